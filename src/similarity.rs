use std::{collections::HashSet, fmt::Debug};

use crate::{peer::Profile, view::ViewEntry};

mod factory;
pub mod worker;

pub use self::factory::*;

/// A distance metric between two peer profiles.
///
/// Implementations are pure: the same pair of profiles always yields the same
/// distance. `None` signals a profile the function cannot interpret; such
/// candidates are left out of any ranking.
///
/// Each instance is created for a reference profile (the local peer's profile
/// at instantiation time), which [SimilarityFunction::closest_neighbours] ranks against.
pub trait SimilarityFunction: Debug + Send + Sync {
    fn compute(&self, a: &Profile, b: &Profile) -> Option<f64>;

    /// The profile this instance was created for
    fn reference(&self) -> &Profile;

    /// Returns up to `n` candidates, closest to the reference profile first
    fn closest_neighbours(&self, n: usize, candidates: &[ViewEntry]) -> Vec<ViewEntry> {
        rank(self, self.reference(), candidates)
            .into_iter()
            .take(n)
            .map(|(entry, _)| entry.clone())
            .collect()
    }
}

/// Orders the candidates by their distance to `reference`, ascending.
///
/// Candidates the function cannot score are dropped; ties are broken by peer id
/// so that the ranking is deterministic.
pub fn rank<'a, F>(
    func: &F,
    reference: &Profile,
    candidates: &'a [ViewEntry],
) -> Vec<(&'a ViewEntry, f64)>
where
    F: SimilarityFunction + ?Sized,
{
    rank_by(candidates, |c| func.compute(reference, &c.payload))
}

/// Orders the candidates by an arbitrary distance, ascending, with the same
/// filtering and tie-breaking as [rank].
pub(crate) fn rank_by<'a, F>(candidates: &'a [ViewEntry], distance: F) -> Vec<(&'a ViewEntry, f64)>
where
    F: Fn(&ViewEntry) -> Option<f64>,
{
    let mut scored: Vec<(&ViewEntry, f64)> = candidates
        .iter()
        .filter_map(|c| finite(distance(c)).map(|d| (c, d)))
        .collect();
    scored.sort_by(|(a, da), (b, db)| da.total_cmp(db).then(a.peer_id.cmp(&b.peer_id)));
    scored
}

/// Keeps usable distances only. `-0.0` becomes `0.0`, so that it orders
/// with zero under `total_cmp` and bit comparisons.
pub(crate) fn finite(distance: Option<f64>) -> Option<f64> {
    distance
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(|d| d + 0.0)
}

/// Absolute difference between two numeric profiles
#[derive(Debug, Clone)]
pub struct NumericDistance {
    reference: Profile,
}

impl NumericDistance {
    pub fn new(reference: Profile) -> Self {
        Self { reference }
    }
}

impl SimilarityFunction for NumericDistance {
    fn compute(&self, a: &Profile, b: &Profile) -> Option<f64> {
        finite(Some((a.as_f64()? - b.as_f64()?).abs()))
    }

    fn reference(&self) -> &Profile {
        &self.reference
    }
}

/// Euclidean distance between two numeric arrays of the same length
#[derive(Debug, Clone)]
pub struct EuclideanDistance {
    reference: Profile,
}

impl EuclideanDistance {
    pub fn new(reference: Profile) -> Self {
        Self { reference }
    }
}

impl SimilarityFunction for EuclideanDistance {
    fn compute(&self, a: &Profile, b: &Profile) -> Option<f64> {
        let a = a.as_array()?;
        let b = b.as_array()?;
        if a.len() != b.len() {
            return None;
        }
        let mut sum = 0.0;
        for (x, y) in a.iter().zip(b) {
            let diff = x.as_f64()? - y.as_f64()?;
            sum += diff * diff;
        }
        finite(Some(sum.sqrt()))
    }

    fn reference(&self) -> &Profile {
        &self.reference
    }
}

/// Jaccard distance between two sets of topics, given as arrays of strings.
/// Two empty sets are at distance zero.
#[derive(Debug, Clone)]
pub struct JaccardDistance {
    reference: Profile,
}

impl JaccardDistance {
    pub fn new(reference: Profile) -> Self {
        Self { reference }
    }

    fn topics(profile: &Profile) -> Option<HashSet<&str>> {
        profile
            .as_array()?
            .iter()
            .map(|topic| topic.as_str())
            .collect()
    }
}

impl SimilarityFunction for JaccardDistance {
    fn compute(&self, a: &Profile, b: &Profile) -> Option<f64> {
        let a = Self::topics(a)?;
        let b = Self::topics(b)?;
        let union = a.union(&b).count();
        if union == 0 {
            return Some(0.0);
        }
        let intersection = a.intersection(&b).count();
        Some(1.0 - intersection as f64 / union as f64)
    }

    fn reference(&self) -> &Profile {
        &self.reference
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::peer::PeerId;

    fn entry(id: u64, payload: Profile) -> ViewEntry {
        ViewEntry::fresh(PeerId::new(id), payload)
    }

    #[test]
    fn numeric_distance() {
        let f = NumericDistance::new(json!(0));
        assert_eq!(f.compute(&json!(3), &json!(1.5)), Some(1.5));
        assert_eq!(f.compute(&json!("3"), &json!(1)), None);
        assert_eq!(f.compute(&json!(null), &json!(1)), None);
    }

    #[test]
    fn euclidean_distance() {
        let f = EuclideanDistance::new(json!([0, 0]));
        assert_eq!(f.compute(&json!([0, 0]), &json!([3, 4])), Some(5.0));
        assert_eq!(f.compute(&json!([0, 0]), &json!([3])), None);
        assert_eq!(f.compute(&json!([0, "x"]), &json!([3, 4])), None);
    }

    #[test]
    fn jaccard_distance() {
        let f = JaccardDistance::new(json!([]));
        assert_eq!(
            f.compute(&json!(["rust", "gossip"]), &json!(["rust", "gossip"])),
            Some(0.0)
        );
        assert_eq!(f.compute(&json!(["a", "b"]), &json!(["b", "c"])), Some(1.0 - 1.0 / 3.0));
        assert_eq!(f.compute(&json!([]), &json!([])), Some(0.0));
        assert_eq!(f.compute(&json!(["a"]), &json!([1])), None);
    }

    #[test]
    fn closest_neighbours_ranks_and_skips_malformed_profiles() {
        let f = NumericDistance::new(json!(10));
        let candidates = vec![
            entry(1, json!(12)),
            entry(2, json!("not a number")),
            entry(3, json!(15)),
            entry(4, json!(9)),
        ];
        let closest: Vec<PeerId> = f
            .closest_neighbours(2, &candidates)
            .into_iter()
            .map(|e| e.peer_id)
            .collect();
        assert_eq!(closest, vec![PeerId::new(4), PeerId::new(1)]);

        let all = f.closest_neighbours(10, &candidates);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn negative_zero_orders_with_zero() {
        assert_eq!(finite(Some(-0.0)).map(f64::to_bits), Some(0));
        assert_eq!(finite(Some(-1.0)), None);
        assert_eq!(finite(Some(f64::NAN)), None);

        let candidates = vec![entry(1, json!(1)), entry(2, json!(2))];
        let ranked: Vec<PeerId> = rank_by(&candidates, |e| match e.peer_id.to_u64() {
            1 => Some(0.0),
            _ => Some(-0.0),
        })
        .into_iter()
        .map(|(e, _)| e.peer_id)
        .collect();
        assert_eq!(ranked, vec![PeerId::new(1), PeerId::new(2)]);
    }
}
