use std::{sync::Arc, time::Duration};

use log::LevelFilter;
use overlay_gossip::{
    Coordinator, LocalNetwork, OverlayConfig, PeerId, ProtocolId, RunningCoordinator, ViewEntry,
};
use rand::seq::SliceRandom;
use serde_json::json;
use simplelog::{ConfigBuilder, SimpleLogger};
use url::Url;

const OVERLAY: &str = r#"{
    "similarityFunctions": { "proximity": "numeric" },
    "protocols": [
        { "id": "cyclon", "kind": "cyclon", "config": {
            "viewSize": 6, "gossipPeriod": 200, "fanout": 3 } },
        { "id": "vicinity", "kind": "vicinity", "config": {
            "viewSize": 4, "gossipPeriod": 200, "fanout": 2,
            "selectionPolicy": "biased", "similarityFunction": "proximity",
            "dependencies": [{ "algoId": "cyclon", "algoAttribute": "view" }] } }
    ]
}"#;

#[tokio::main]
pub async fn main() {
    let _ = SimpleLogger::init(
        LevelFilter::Info,
        ConfigBuilder::new().build(),
    );

    let number_of_peers: u64 = std::env::args()
        .find_map(|arg| arg.parse::<u64>().ok().filter(|n| n > &1 && n <= &100))
        .unwrap_or(12);

    log::info!("Starting {} peers", number_of_peers);

    let config = OverlayConfig::from_json(OVERLAY).unwrap();
    let network = LocalNetwork::new();

    // each peer's profile is its position on a line
    let peers: Vec<(PeerId, u64)> = (0..number_of_peers)
        .map(|i| {
            let url = Url::parse(&format!("http://localhost:{}", 9000 + i)).unwrap();
            (PeerId::from_url(&url), i)
        })
        .collect();
    let bootstrap: Vec<ViewEntry> = peers
        .choose_multiple(&mut rand::thread_rng(), 3)
        .map(|(peer, position)| ViewEntry::fresh(*peer, json!(position)))
        .collect();

    let running: Vec<(RunningCoordinator, u64)> = peers
        .iter()
        .map(|(peer, position)| {
            let coordinator = Coordinator::builder(*peer, json!(position))
                .with_bootstrap_peers(&bootstrap)
                .with_transport(Arc::new(network.clone()))
                .with_overlay_config(config.clone())
                .build()
                .unwrap()
                .start();
            network.join(coordinator.inbox());
            (coordinator, *position)
        })
        .collect();

    tokio::time::sleep(Duration::from_secs(5)).await;

    let vicinity = ProtocolId::from("vicinity");
    for (coordinator, position) in &running {
        let view = coordinator.view(&vicinity).await.unwrap_or_else(|| {
            panic!("peer {} has no vicinity view", coordinator.local())
        });
        let mut neighbours: Vec<String> = view
            .sorted_entries()
            .iter()
            .map(|e| e.payload.to_string())
            .collect();
        neighbours.sort();
        log::info!(
            "Peer at {:>3} ({}) is close to {}",
            position,
            coordinator.local(),
            neighbours.join(", ")
        );
    }

    for (coordinator, _) in &running {
        coordinator.destroy().await;
    }
}
