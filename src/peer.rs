use std::{
    fmt::Display,
    hash::{Hash, Hasher},
};

#[cfg(test)]
use quickcheck::Arbitrary;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use url::Url;

/// Opaque application data attached to a peer and compared by
/// [similarity functions](crate::similarity::SimilarityFunction).
///
/// Profiles can be plain numbers, arrays, or arbitrary structured documents.
pub type Profile = serde_json::Value;

/// A [PeerId] is a 64-bit number uniquely identifying a single peer in the overlay
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord, Debug, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Builds a [PeerId] whose value is a hash of the provided URL.
    ///
    /// The hash is keyed with constants so that every peer derives the same id
    /// for the same advertised address.
    pub fn from_url(url: &Url) -> Self {
        let mut hasher = deterministic_hasher();
        url.hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn to_u64(&self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

fn deterministic_hasher() -> SipHasher13 {
    SipHasher13::new_with_keys(0x6f76_6572_6c61_7921, 0x676f_7373_6970_2121)
}

#[cfg(test)]
impl Arbitrary for PeerId {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        // A narrow id space so that generated views collide often
        PeerId(u64::arbitrary(g) % 64)
    }
}
