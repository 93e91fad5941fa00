use rand::seq::SliceRandom;

use super::{Context, GossipPolicy};
use crate::{
    config::{ProtocolConfig, SelectionPolicy},
    error::{ConfigurationError, EmptyViewError},
    peer::PeerId,
    view::{View, ViewEntry},
};

/// Cyclon: random shuffling with staleness-driven target selection.
///
/// Every cycle gossips with the peer we hold the oldest information about, which
/// actively flushes stale descriptors out of the overlay. Right after selection
/// the target's descriptor is refreshed locally, so that the same peer is not
/// picked again until it has aged like everybody else.
#[derive(Debug, Default)]
pub struct CyclonPolicy;

impl CyclonPolicy {
    pub fn new(config: &ProtocolConfig) -> Result<Self, ConfigurationError> {
        match config.selection_policy {
            None | Some(SelectionPolicy::Oldest) => Ok(Self),
            Some(other) => Err(ConfigurationError::UnsupportedSelectionPolicy {
                protocol: "cyclon",
                policy: other.name(),
            }),
        }
    }
}

impl GossipPolicy for CyclonPolicy {
    fn select_peer(&mut self, _ctx: &Context<'_>, view: &View) -> Result<PeerId, EmptyViewError> {
        view.oldest().map(|e| e.peer_id).ok_or(EmptyViewError)
    }

    fn build_buffer(
        &mut self,
        ctx: &Context<'_>,
        view: &mut View,
        target: PeerId,
    ) -> Vec<ViewEntry> {
        let others: Vec<ViewEntry> = view
            .sorted_entries()
            .into_iter()
            .filter(|e| e.peer_id != target)
            .collect();
        let buffer = others
            .choose_multiple(&mut rand::thread_rng(), ctx.config.fanout.saturating_sub(1))
            .cloned()
            .collect();
        view.refresh(&target);
        buffer
    }

    fn merge(
        &mut self,
        _ctx: &Context<'_>,
        view: &mut View,
        _sender: PeerId,
        incoming: Vec<ViewEntry>,
    ) {
        view.merge_fresher(incoming);
        view.evict_oldest();
    }
}
