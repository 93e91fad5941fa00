use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;

use super::{Context, GossipPolicy};
use crate::{
    config::{ProtocolConfig, SelectionPolicy},
    error::{ConfigurationError, EmptyViewError},
    peer::PeerId,
    view::{View, ViewEntry},
};

/// Generic peer sampling with explicit healing and swapping.
///
/// Buffers are drawn from a shuffled view in which the `H` oldest descriptors
/// have been moved to the back, so stale information is the last to spread.
/// When a merge overflows the view, the overflow is absorbed in three steps:
///  - up to `H` of the oldest descriptors are discarded (healing)
///  - then up to `S` of the descriptors sent to the same partner are discarded (swapping)
///  - then random descriptors are discarded until the view fits
///
/// `H = 0, S = 0` gives a plain random view, a large `H` favours self-healing
/// under churn, a large `S` favours an even spread of descriptors.
#[derive(Debug)]
pub struct RpsPolicy {
    selection: SelectionPolicy,
    /// Peers sent to each partner whose exchange is still open, in the order they were sent
    sent: HashMap<PeerId, Vec<PeerId>>,
}

impl RpsPolicy {
    pub fn new(config: &ProtocolConfig) -> Result<Self, ConfigurationError> {
        let selection = config.selection_policy.unwrap_or(SelectionPolicy::Random);
        match selection {
            SelectionPolicy::Random | SelectionPolicy::Oldest => Ok(Self {
                selection,
                sent: HashMap::new(),
            }),
            other => Err(ConfigurationError::UnsupportedSelectionPolicy {
                protocol: "rps",
                policy: other.name(),
            }),
        }
    }
}

/// The `n` oldest peers of a view, oldest first
fn oldest(view: &View, n: usize) -> Vec<PeerId> {
    let mut entries = view.sorted_entries();
    entries.sort_by(|a, b| {
        b.time_stamp
            .cmp(&a.time_stamp)
            .then(b.peer_id.cmp(&a.peer_id))
    });
    entries.into_iter().take(n).map(|e| e.peer_id).collect()
}

impl GossipPolicy for RpsPolicy {
    fn select_peer(&mut self, _ctx: &Context<'_>, view: &View) -> Result<PeerId, EmptyViewError> {
        match self.selection {
            SelectionPolicy::Oldest => view.oldest().map(|e| e.peer_id).ok_or(EmptyViewError),
            _ => view
                .sorted_entries()
                .choose(&mut rand::thread_rng())
                .map(|e| e.peer_id)
                .ok_or(EmptyViewError),
        }
    }

    fn build_buffer(
        &mut self,
        ctx: &Context<'_>,
        view: &mut View,
        target: PeerId,
    ) -> Vec<ViewEntry> {
        let aged: HashSet<PeerId> = oldest(view, ctx.config.healing).into_iter().collect();
        let mut candidates: Vec<ViewEntry> = view
            .sorted_entries()
            .into_iter()
            .filter(|e| e.peer_id != target)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        // stable: keeps the shuffled order within both groups
        candidates.sort_by_key(|e| aged.contains(&e.peer_id));
        candidates.truncate(ctx.config.fanout.saturating_sub(1));
        self.sent
            .insert(target, candidates.iter().map(|e| e.peer_id).collect());
        candidates
    }

    fn merge(
        &mut self,
        ctx: &Context<'_>,
        view: &mut View,
        sender: PeerId,
        incoming: Vec<ViewEntry>,
    ) {
        let sent = self.sent.remove(&sender).unwrap_or_default();
        view.merge_fresher(incoming);

        let overflow = view.len().saturating_sub(view.capacity());
        for peer_id in oldest(view, ctx.config.healing.min(overflow)) {
            view.remove(&peer_id);
        }

        let overflow = view.len().saturating_sub(view.capacity());
        let swapped: Vec<PeerId> = sent
            .iter()
            .filter(|peer_id| view.contains(peer_id))
            .take(ctx.config.swap.min(overflow))
            .copied()
            .collect();
        for peer_id in swapped {
            view.remove(&peer_id);
        }

        let mut rng = rand::thread_rng();
        while view.len() > view.capacity() {
            let victim = view.sorted_entries().choose(&mut rng).map(|e| e.peer_id);
            match victim {
                Some(peer_id) => {
                    view.remove(&peer_id);
                }
                None => break,
            }
        }
    }

    fn exchange_closed(&mut self, peer: PeerId) {
        self.sent.remove(&peer);
    }

    fn destroy(&mut self) {
        self.sent.clear();
    }
}
