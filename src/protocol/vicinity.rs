use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use log::{debug, warn};
use rand::seq::SliceRandom;

use super::{Context, GossipPolicy};
use crate::{
    config::{Attribute, ProtocolConfig, SelectionPolicy},
    error::{ConfigurationError, EmptyViewError},
    peer::{PeerId, Profile},
    similarity::{
        finite, rank_by,
        worker::{BatchResponse, SimilarityClient},
        SimilarityFunction,
    },
    view::{View, ViewEntry},
};

/// Oldest in-flight worker batches are forgotten past this count
const MAX_PENDING_BATCHES: usize = 8;

/// Vicinity: a similarity-biased topology.
///
/// The candidate pool is the protocol's own view plus the view it depends on
/// (typically a Cyclon instance), which keeps feeding it random peers. Peers
/// are ranked by their distance to the local profile: selection goes to the
/// closest peer not contacted recently, buffers carry the closest descriptors,
/// and an overflowing view evicts the least similar descriptors first.
///
/// Peers whose profile cannot be scored are left out of the ranking; when no
/// candidate can be scored, selection falls back to a uniform pick.
pub struct VicinityPolicy {
    selection: SelectionPolicy,
    similarity: Option<Arc<dyn SimilarityFunction>>,
    /// Ranked picks since the ranking was last exhausted, limited to the current pool
    contacted: HashSet<PeerId>,
    cycle: u64,
    worker: Option<SimilarityClient>,
    pending: BTreeSet<u64>,
    /// Pool distances computed by the worker
    scores: HashMap<PeerId, Option<f64>>,
}

impl VicinityPolicy {
    pub fn new(
        config: &ProtocolConfig,
        similarity: Option<Arc<dyn SimilarityFunction>>,
    ) -> Result<Self, ConfigurationError> {
        let selection = config.selection_policy.unwrap_or(SelectionPolicy::Biased);
        match selection {
            SelectionPolicy::Oldest => {
                return Err(ConfigurationError::UnsupportedSelectionPolicy {
                    protocol: "vicinity",
                    policy: selection.name(),
                })
            }
            SelectionPolicy::Biased | SelectionPolicy::AgrBiased if similarity.is_none() => {
                return Err(ConfigurationError::MissingSimilarityFunction(
                    selection.name(),
                ))
            }
            _ => (),
        }
        Ok(Self {
            selection,
            similarity,
            contacted: HashSet::new(),
            cycle: 0,
            worker: None,
            pending: BTreeSet::new(),
            scores: HashMap::new(),
        })
    }

    /// Own view and dependency view, one freshest descriptor per peer, sorted by peer id
    fn candidate_pool(&self, ctx: &Context<'_>, view: &View) -> Vec<ViewEntry> {
        let mut pool: HashMap<PeerId, ViewEntry> = HashMap::new();
        for entry in view.entries().cloned().chain(ctx.inputs.candidates()) {
            if entry.peer_id == ctx.local {
                continue;
            }
            let merged = match pool.remove(&entry.peer_id) {
                Some(existing) => existing.fresher(entry),
                None => entry,
            };
            pool.insert(merged.peer_id, merged);
        }
        let mut pool: Vec<ViewEntry> = pool.into_values().collect();
        pool.sort_by_key(|e| e.peer_id);
        pool
    }

    fn distance(&self, profile: &Profile, entry: &ViewEntry) -> Option<f64> {
        finite(self.similarity.as_ref()?.compute(profile, &entry.payload))
    }

    /// Distances used to rank the candidate pool. With a worker attached only
    /// the scores it has sent back are used.
    fn pool_distance(&self, profile: &Profile, entry: &ViewEntry) -> Option<f64> {
        if self.worker.is_some() {
            self.scores.get(&entry.peer_id).copied().flatten()
        } else {
            self.distance(profile, entry)
        }
    }

    fn closest_uncontacted(&mut self, profile: &Profile, pool: &[ViewEntry]) -> Option<PeerId> {
        let ranked = rank_by(pool, |e| self.pool_distance(profile, e));
        let first = ranked.first()?.0.peer_id;
        match ranked.iter().find(|(e, _)| !self.contacted.contains(&e.peer_id)) {
            Some((entry, _)) => Some(entry.peer_id),
            None => {
                self.contacted.clear();
                Some(first)
            }
        }
    }
}

impl GossipPolicy for VicinityPolicy {
    fn select_peer(&mut self, ctx: &Context<'_>, view: &View) -> Result<PeerId, EmptyViewError> {
        let pool = self.candidate_pool(ctx, view);
        if pool.is_empty() {
            return Err(EmptyViewError);
        }
        self.contacted
            .retain(|peer_id| pool.iter().any(|e| e.peer_id == *peer_id));
        self.cycle += 1;
        let biased = match self.selection {
            SelectionPolicy::Biased => true,
            // alternate between ranked and uniform picks
            SelectionPolicy::AgrBiased => self.cycle % 2 == 1,
            _ => false,
        };
        let ranked_pick = if biased {
            self.closest_uncontacted(&ctx.profile, &pool)
        } else {
            None
        };
        let target = match ranked_pick {
            Some(target) => {
                self.contacted.insert(target);
                target
            }
            None => {
                if biased {
                    debug!("No candidate could be ranked, picking one at random");
                }
                pool.choose(&mut rand::thread_rng())
                    .map(|e| e.peer_id)
                    .ok_or(EmptyViewError)?
            }
        };
        Ok(target)
    }

    fn build_buffer(
        &mut self,
        ctx: &Context<'_>,
        view: &mut View,
        target: PeerId,
    ) -> Vec<ViewEntry> {
        let candidates: Vec<ViewEntry> = view
            .sorted_entries()
            .into_iter()
            .filter(|e| e.peer_id != target)
            .collect();
        let mut buffer: Vec<ViewEntry> = rank_by(&candidates, |e| self.distance(&ctx.profile, e))
            .into_iter()
            .take(ctx.config.fanout)
            .map(|(e, _)| e.clone())
            .collect();
        let missing = ctx.config.fanout.saturating_sub(buffer.len());
        if missing > 0 {
            let unranked: Vec<&ViewEntry> = candidates
                .iter()
                .filter(|e| !buffer.iter().any(|b| b.peer_id == e.peer_id))
                .collect();
            buffer.extend(
                unranked
                    .choose_multiple(&mut rand::thread_rng(), missing)
                    .map(|e| (*e).clone()),
            );
        }
        buffer
    }

    fn merge(
        &mut self,
        ctx: &Context<'_>,
        view: &mut View,
        _sender: PeerId,
        incoming: Vec<ViewEntry>,
    ) {
        view.merge_fresher(incoming);
        // unscored first, then farthest, then oldest
        view.evict_by(|e| match self.distance(&ctx.profile, e) {
            Some(d) => (false, d.to_bits(), e.time_stamp),
            None => (true, 0, e.time_stamp),
        });
    }

    fn consumes(&self, attribute: Attribute) -> bool {
        matches!(attribute, Attribute::View | Attribute::Data)
    }

    fn prepare(&mut self, ctx: &Context<'_>, view: &View) {
        if self.worker.is_none() {
            return;
        }
        let pool = self.candidate_pool(ctx, view);
        let known: HashSet<PeerId> = pool.iter().map(|e| e.peer_id).collect();
        self.scores.retain(|peer_id, _| known.contains(peer_id));
        let submitted = self
            .worker
            .as_mut()
            .and_then(|worker| worker.submit(ctx.profile.clone(), pool));
        if let Some(correlation_id) = submitted {
            self.pending.insert(correlation_id);
            while self.pending.len() > MAX_PENDING_BATCHES {
                self.pending.pop_first();
            }
        }
    }

    fn attach_worker(&mut self, client: SimilarityClient) {
        self.worker = Some(client);
    }

    fn accept_similarity(&mut self, ctx: &Context<'_>, view: &View, response: &str) {
        let response: BatchResponse = match serde_json::from_str(response) {
            Ok(response) => response,
            Err(e) => {
                warn!("Ignoring malformed similarity response: {e}");
                return;
            }
        };
        if !self.pending.remove(&response.correlation_id) {
            debug!(
                "Discarding stale similarity batch {}",
                response.correlation_id
            );
            return;
        }
        let pool: HashSet<PeerId> = self
            .candidate_pool(ctx, view)
            .into_iter()
            .map(|e| e.peer_id)
            .collect();
        for (peer_id, distance) in response.distances {
            if pool.contains(&peer_id) {
                self.scores.insert(peer_id, finite(distance));
            }
        }
    }

    fn destroy(&mut self) {
        self.worker = None;
        self.pending.clear();
        self.scores.clear();
        self.contacted.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::watch;

    use super::*;
    use crate::{
        protocol::Inputs,
        similarity::{worker::spawn_worker, NumericDistance},
    };

    const LOCAL: PeerId = PeerId::new(1);

    /// Numeric gap that reports identical profiles as `-0.0`
    #[derive(Debug)]
    struct SignedGap(Profile);

    impl SimilarityFunction for SignedGap {
        fn compute(&self, a: &Profile, b: &Profile) -> Option<f64> {
            let gap = (a.as_f64()? - b.as_f64()?).abs();
            Some(if gap == 0.0 { -0.0 } else { gap })
        }

        fn reference(&self) -> &Profile {
            &self.0
        }
    }

    fn numeric() -> Option<Arc<dyn SimilarityFunction>> {
        Some(Arc::new(NumericDistance::new(json!(0))))
    }

    fn view_of(payloads: &[(u64, Profile)]) -> View {
        let mut view = View::new(LOCAL, 4);
        view.merge_fresher(
            payloads
                .iter()
                .map(|(id, payload)| ViewEntry::fresh(PeerId::new(*id), payload.clone())),
        );
        view
    }

    fn ids(peers: &[u64]) -> HashSet<PeerId> {
        peers.iter().copied().map(PeerId::new).collect()
    }

    #[test]
    fn agr_biased_alternates_ranked_and_uniform_picks() {
        let config = ProtocolConfig::default()
            .with_view_size(4)
            .with_fanout(2)
            .with_selection_policy(SelectionPolicy::AgrBiased);
        let mut policy = VicinityPolicy::new(&config, numeric()).unwrap();
        let inputs = Inputs::default();
        let (data, _) = watch::channel(json!(0));
        let ctx = Context::new(LOCAL, &config, &inputs, &data);
        let view = view_of(&[(3, json!(3)), (5, json!(5)), (8, json!(8))]);

        assert_eq!(policy.select_peer(&ctx, &view), Ok(PeerId::new(3)));
        let uniform = policy.select_peer(&ctx, &view).unwrap();
        assert!(view.contains(&uniform));
        // uniform picks do not count as contacted
        assert_eq!(policy.contacted, ids(&[3]));
        assert_eq!(policy.select_peer(&ctx, &view), Ok(PeerId::new(5)));
        assert_eq!(policy.contacted, ids(&[3, 5]));
    }

    #[test]
    fn unscorable_pools_fall_back_to_uniform_picks() {
        let config = ProtocolConfig::default().with_view_size(4).with_fanout(2);
        let mut policy = VicinityPolicy::new(&config, numeric()).unwrap();
        let inputs = Inputs::default();
        let (data, _) = watch::channel(json!(0));
        let ctx = Context::new(LOCAL, &config, &inputs, &data);
        let view = view_of(&[(3, json!("x")), (5, json!(null)), (8, json!({ "a": 1 }))]);

        for _ in 0..10 {
            let target = policy.select_peer(&ctx, &view).unwrap();
            assert!(view.contains(&target));
        }
        assert!(policy.contacted.is_empty());
    }

    #[test]
    fn contacted_peers_are_forgotten_once_they_leave_the_pool() {
        let config = ProtocolConfig::default()
            .with_view_size(4)
            .with_fanout(2)
            .with_selection_policy(SelectionPolicy::Random);
        let mut policy = VicinityPolicy::new(&config, None).unwrap();
        let inputs = Inputs::default();
        let (data, _) = watch::channel(json!(0));
        let ctx = Context::new(LOCAL, &config, &inputs, &data);
        for id in 2..1002 {
            let view = view_of(&[(id, json!(id))]);
            assert_eq!(policy.select_peer(&ctx, &view), Ok(PeerId::new(id)));
        }
        assert!(policy.contacted.is_empty());

        let config = ProtocolConfig::default().with_view_size(4).with_fanout(2);
        let mut policy = VicinityPolicy::new(&config, numeric()).unwrap();
        let ctx = Context::new(LOCAL, &config, &inputs, &data);
        let view = view_of(&[(3, json!(3)), (5, json!(5))]);
        assert_eq!(policy.select_peer(&ctx, &view), Ok(PeerId::new(3)));

        let view = view_of(&[(5, json!(5)), (8, json!(8))]);
        assert_eq!(policy.select_peer(&ctx, &view), Ok(PeerId::new(5)));
        assert_eq!(policy.contacted, ids(&[5]));
    }

    #[test]
    fn identical_profiles_survive_eviction() {
        let config = ProtocolConfig::default().with_view_size(2).with_fanout(1);
        let mut policy =
            VicinityPolicy::new(&config, Some(Arc::new(SignedGap(json!(0))))).unwrap();
        let inputs = Inputs::default();
        let (data, _) = watch::channel(json!(0));
        let ctx = Context::new(LOCAL, &config, &inputs, &data);
        let mut view = View::new(LOCAL, 2);
        view.merge_fresher([
            ViewEntry::fresh(PeerId::new(2), json!(0)),
            ViewEntry::fresh(PeerId::new(3), json!(1)),
        ]);

        policy.merge(
            &ctx,
            &mut view,
            PeerId::new(4),
            vec![ViewEntry::fresh(PeerId::new(4), json!(5))],
        );

        assert_eq!(view.peer_ids().collect::<HashSet<_>>(), ids(&[2, 3]));
    }

    #[tokio::test]
    async fn worker_scores_are_only_taken_from_pending_batches() {
        let config = ProtocolConfig::default().with_view_size(4).with_fanout(2);
        let mut policy = VicinityPolicy::new(&config, numeric()).unwrap();
        policy.attach_worker(spawn_worker(
            Arc::new(NumericDistance::new(json!(0))),
            |_| true,
        ));
        let inputs = Inputs::default();
        let (data, _) = watch::channel(json!(0));
        let ctx = Context::new(LOCAL, &config, &inputs, &data);
        let view = view_of(&[(3, json!(3)), (5, json!(5))]);

        policy.prepare(&ctx, &view);
        assert_eq!(policy.pending.iter().copied().collect::<Vec<_>>(), vec![1]);

        fn response(correlation_id: u64, distances: &[(u64, f64)]) -> String {
            serde_json::to_string(&BatchResponse {
                correlation_id,
                distances: distances
                    .iter()
                    .map(|(id, d)| (PeerId::new(*id), Some(*d)))
                    .collect(),
            })
            .unwrap()
        }

        policy.accept_similarity(&ctx, &view, &response(7, &[(5, 0.5)]));
        assert!(policy.scores.is_empty());

        policy.accept_similarity(&ctx, &view, &response(1, &[(3, 2.0), (42, 1.0)]));
        assert_eq!(policy.scores.len(), 1);
        assert_eq!(policy.scores.get(&PeerId::new(3)), Some(&Some(2.0)));
        assert!(policy.pending.is_empty());

        // a late duplicate of an answered batch
        policy.accept_similarity(&ctx, &view, &response(1, &[(5, 0.5)]));
        policy.accept_similarity(&ctx, &view, "{ nope");
        assert!(!policy.scores.contains_key(&PeerId::new(5)));

        assert_eq!(policy.select_peer(&ctx, &view), Ok(PeerId::new(3)));
    }
}
