//! Similarity scoring on a separate execution context.
//!
//! Protocols that rank large candidate pools can hand scoring over to a
//! worker thread (see [spawn_worker]). Requests and responses travel as JSON text, each request
//! carrying everything needed to score it: no state survives between two
//! batches. Responses are keyed by the correlation id of their request, and may
//! come back after several more ticks; it is up to the protocol to discard
//! results that no longer describe its view.

use std::{collections::BTreeMap, sync::Arc};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{finite, SimilarityFunction};
use crate::{
    peer::{PeerId, Profile},
    view::ViewEntry,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub correlation_id: u64,
    pub profile: Profile,
    pub view: Vec<ViewEntry>,
}

/// Distances per peer. `None` marks a profile the function could not score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub correlation_id: u64,
    pub distances: BTreeMap<PeerId, Option<f64>>,
}

/// Scores one serialized [BatchRequest] and returns the serialized [BatchResponse]
pub fn score_batch(func: &dyn SimilarityFunction, request: &str) -> serde_json::Result<String> {
    let request: BatchRequest = serde_json::from_str(request)?;
    let distances = request
        .view
        .iter()
        .map(|entry| {
            (
                entry.peer_id,
                finite(func.compute(&request.profile, &entry.payload)),
            )
        })
        .collect();
    serde_json::to_string(&BatchResponse {
        correlation_id: request.correlation_id,
        distances,
    })
}

/// Spawns a scoring thread bound to one similarity function, on the runtime's
/// blocking pool. Must be called from within a tokio runtime.
///
/// Serialized responses are handed to `on_response`, which is usually a sender
/// into the owning coordinator's event queue. The thread stops once the returned
/// [SimilarityClient] is dropped, or as soon as `on_response` returns false.
pub fn spawn_worker<F>(func: Arc<dyn SimilarityFunction>, on_response: F) -> SimilarityClient
where
    F: Fn(String) -> bool + Send + 'static,
{
    let (requests_sender, mut requests_receiver) = mpsc::unbounded_channel::<String>();
    tokio::task::spawn_blocking(move || {
        while let Some(request) = requests_receiver.blocking_recv() {
            match score_batch(func.as_ref(), &request) {
                Ok(response) => {
                    if !on_response(response) {
                        debug!("Similarity worker has nobody to answer to, stopping");
                        break;
                    }
                }
                Err(e) => warn!("Dropping malformed similarity request: {e}"),
            }
        }
    });
    SimilarityClient {
        requests: requests_sender,
        next_correlation_id: 0,
    }
}

/// The sending half of a scoring thread started with [spawn_worker]
#[derive(Debug)]
pub struct SimilarityClient {
    requests: mpsc::UnboundedSender<String>,
    next_correlation_id: u64,
}

impl SimilarityClient {
    /// Queues a batch and returns its correlation id, or `None` if the worker is gone
    pub fn submit(&mut self, profile: Profile, view: Vec<ViewEntry>) -> Option<u64> {
        self.next_correlation_id += 1;
        let request = BatchRequest {
            correlation_id: self.next_correlation_id,
            profile,
            view,
        };
        let text = match serde_json::to_string(&request) {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not serialize similarity request: {e}");
                return None;
            }
        };
        self.requests
            .send(text)
            .ok()
            .map(|_| request.correlation_id)
    }
}
