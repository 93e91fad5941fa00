use std::collections::HashMap;

#[cfg(test)]
use quickcheck::Arbitrary;
use serde::{Deserialize, Serialize};

use crate::peer::{PeerId, Profile};


/// How the running peer sees one of its overlay neighbours.
///
/// `time_stamp` is an age counter: it is reset to zero when the descriptor is
/// created by its owner and incremented on every local tick in which it is not
/// refreshed. A lower time stamp therefore means fresher information.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewEntry {
    pub peer_id: PeerId,
    pub time_stamp: u64,
    #[serde(default)]
    pub payload: Profile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_count: Option<u32>,
}

impl ViewEntry {
    pub fn new(peer_id: PeerId, time_stamp: u64, payload: Profile) -> Self {
        Self {
            peer_id,
            time_stamp,
            payload,
            hop_count: None,
        }
    }

    /// A descriptor freshly minted by its owner, with a zero time stamp
    pub fn fresh(peer_id: PeerId, payload: Profile) -> Self {
        Self::new(peer_id, 0, payload)
    }

    pub fn with_hop_count(mut self, hop_count: u32) -> Self {
        self.hop_count = Some(hop_count);
        self
    }

    /// Returns whichever of the two descriptors carries the fresher information
    pub(crate) fn fresher(self, other: ViewEntry) -> ViewEntry {
        if other.time_stamp < self.time_stamp {
            other
        } else {
            self
        }
    }
}

/// A bounded set of neighbour descriptors, keyed by [PeerId].
///
/// A view knows which peer owns it and never holds a descriptor of its owner.
/// Merges may temporarily exceed the capacity, but every merge ends with one of
/// the eviction helpers ([View::evict_oldest], [View::evict_by]) bringing the
/// view back within `capacity`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct View {
    owner: PeerId,
    capacity: usize,
    entries: HashMap<PeerId, ViewEntry>,
}

impl View {
    pub fn new(owner: PeerId, capacity: usize) -> Self {
        Self {
            owner,
            capacity,
            entries: HashMap::with_capacity(capacity + 1),
        }
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&ViewEntry> {
        self.entries.get(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.entries.contains_key(peer_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ViewEntry> {
        self.entries.values()
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.entries.keys().copied()
    }

    /// Entries sorted by peer id, for callers that need a stable order
    pub fn sorted_entries(&self) -> Vec<ViewEntry> {
        let mut entries: Vec<ViewEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.peer_id);
        entries
    }

    /// Inserts or replaces a descriptor, returning the previous one.
    /// Descriptors of the view owner are refused.
    pub fn insert(&mut self, entry: ViewEntry) -> Option<ViewEntry> {
        if entry.peer_id == self.owner {
            return None;
        }
        self.entries.insert(entry.peer_id, entry)
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<ViewEntry> {
        self.entries.remove(peer_id)
    }

    /// Ages every descriptor by one tick
    pub fn increment_ages(&mut self) {
        for entry in self.entries.values_mut() {
            entry.time_stamp = entry.time_stamp.saturating_add(1);
        }
    }

    /// Resets the time stamp of a descriptor, returning whether it was present
    pub fn refresh(&mut self, peer_id: &PeerId) -> bool {
        match self.entries.get_mut(peer_id) {
            Some(entry) => {
                entry.time_stamp = 0;
                true
            }
            None => false,
        }
    }

    /// The descriptor with the largest time stamp. Ties go to the largest peer id.
    pub fn oldest(&self) -> Option<&ViewEntry> {
        self.entries
            .values()
            .max_by_key(|e| (e.time_stamp, e.peer_id))
    }

    /// Merges a descriptor, keeping the fresher copy when the peer is already known.
    /// Returns true if the view changed.
    pub fn merge_entry(&mut self, entry: ViewEntry) -> bool {
        if entry.peer_id == self.owner {
            return false;
        }
        match self.entries.get_mut(&entry.peer_id) {
            Some(existing) if entry.time_stamp < existing.time_stamp => {
                *existing = entry;
                true
            }
            Some(_) => false,
            None => {
                self.entries.insert(entry.peer_id, entry);
                true
            }
        }
    }

    /// Merges every descriptor of `incoming`, keeping fresher copies, without
    /// enforcing the capacity.
    pub fn merge_fresher(&mut self, incoming: impl IntoIterator<Item = ViewEntry>) {
        for entry in incoming {
            self.merge_entry(entry);
        }
    }

    /// Evicts the oldest descriptors until the view is within its capacity
    pub fn evict_oldest(&mut self) -> Vec<ViewEntry> {
        self.evict_by(|e| (e.time_stamp, e.peer_id))
    }

    /// Evicts the descriptors with the largest key until the view is within its capacity
    pub fn evict_by<K, F>(&mut self, mut key: F) -> Vec<ViewEntry>
    where
        K: Ord,
        F: FnMut(&ViewEntry) -> K,
    {
        let overflow = self.len().saturating_sub(self.capacity);
        if overflow == 0 {
            return Vec::new();
        }
        let mut ranked: Vec<(K, PeerId)> = self
            .entries
            .values()
            .map(|e| (key(e), e.peer_id))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        ranked
            .into_iter()
            .take(overflow)
            .filter_map(|(_, peer_id)| self.entries.remove(&peer_id))
            .collect()
    }
}

/// Collapses a received buffer: drops descriptors of `owner` and keeps the
/// freshest copy of any peer listed more than once.
pub(crate) fn sanitize(owner: PeerId, incoming: Vec<ViewEntry>) -> Vec<ViewEntry> {
    let mut unique: HashMap<PeerId, ViewEntry> = HashMap::with_capacity(incoming.len());
    for entry in incoming.into_iter().filter(|e| e.peer_id != owner) {
        let merged = match unique.remove(&entry.peer_id) {
            Some(existing) => existing.fresher(entry),
            None => entry,
        };
        unique.insert(merged.peer_id, merged);
    }
    let mut entries: Vec<ViewEntry> = unique.into_values().collect();
    entries.sort_by_key(|e| e.peer_id);
    entries
}

#[cfg(test)]
impl Arbitrary for ViewEntry {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        ViewEntry::new(
            PeerId::arbitrary(g),
            u64::from(u8::arbitrary(g)),
            Profile::from(u8::arbitrary(g)),
        )
    }
}

/// Generates a view owned by peer 0 with a capacity between 1 and 16
#[cfg(test)]
impl Arbitrary for View {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let capacity = 1 + usize::arbitrary(g) % 16;
        let mut view = View::new(PeerId::new(0), capacity);
        view.merge_fresher(Vec::<ViewEntry>::arbitrary(g));
        view.evict_oldest();
        view
    }
}
