use log::{debug, info};
use rand::Rng;
use tokio::{
    select,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_stream::{wrappers::IntervalStream, StreamExt, StreamMap};

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

mod builder;

pub mod config;
pub mod coordinator;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod similarity;
pub mod transport;
pub mod view;

#[cfg(test)]
pub(crate) mod testing;

pub use self::builder::*;
pub use self::config::{OverlayConfig, ProtocolConfig, ProtocolDescriptor};
pub use self::coordinator::{Coordinator, Dependency};
pub use self::error::{Error, Result};
pub use self::peer::{PeerId, Profile};
pub use self::protocol::{GossipMessage, ProtocolId, ProtocolKind};
pub use self::transport::{Inbox, LocalNetwork, Transport};
pub use self::view::{View, ViewEntry};

/// Everything the main loop of a running coordinator reacts to, besides its timers
#[derive(Debug)]
pub(crate) enum Event {
    /// Sent by the transport through an [Inbox]
    MessageReceived(GossipMessage),
    /// Sent by a similarity worker
    SimilarityScored {
        protocol_id: ProtocolId,
        response: String,
    },
    Snapshot {
        protocol_id: ProtocolId,
        reply: oneshot::Sender<Option<View>>,
    },
    Destroy,
}

impl Coordinator {
    /// Moves the coordinator onto the tokio runtime: every protocol ticks on its
    /// own timer, inbound messages are processed one at a time, and scoring
    /// workers are spawned for the protocols that offload similarity.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(mut self) -> RunningCoordinator {
        let (events_sender, events_receiver) = mpsc::unbounded_channel();

        let mut timers = StreamMap::new();
        let mut rng = rand::thread_rng();
        for protocol in self.protocols_mut() {
            let period = protocol.config().gossip_period;
            // spread the first ticks so that peers started together do not gossip in lockstep
            let first_tick = Instant::now() + period.mul_f64(rng.gen_range(0.0..1.0));
            let mut interval = tokio::time::interval_at(first_tick, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timers.insert(protocol.id().clone(), IntervalStream::new(interval));

            if let Some(func) = protocol.offloaded_similarity() {
                let protocol_id = protocol.id().clone();
                let events = events_sender.clone();
                let client = similarity::worker::spawn_worker(func, move |response| {
                    events
                        .send(Event::SimilarityScored {
                            protocol_id: protocol_id.clone(),
                            response,
                        })
                        .is_ok()
                });
                protocol.attach_worker(client);
                debug!("Started a similarity worker for {}", protocol.id());
            }
        }

        let local = self.local();
        info!("Peer {local} is running");
        let main_loop = tokio::spawn(Self::main_loop(self, timers, events_receiver));
        RunningCoordinator {
            local,
            events: events_sender,
            main_loop: Mutex::new(Some(main_loop)),
        }
    }

    async fn main_loop(
        mut coordinator: Coordinator,
        mut timers: StreamMap<ProtocolId, IntervalStream>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) -> Coordinator {
        loop {
            select! {
                Some(event) = events.recv() => {
                    match event {
                        Event::MessageReceived(message) => coordinator.route(message),
                        Event::SimilarityScored { protocol_id, response } => {
                            coordinator.accept_similarity(&protocol_id, &response)
                        }
                        Event::Snapshot { protocol_id, reply } => {
                            let _ = reply.send(coordinator.view(&protocol_id));
                        }
                        Event::Destroy => break,
                    }
                },
                Some((protocol_id, _)) = timers.next() => coordinator.tick(&protocol_id),
                else => break,
            }
        }
        coordinator.destroy();
        coordinator
    }
}

/// A coordinator driven by the tokio runtime, see [Coordinator::start]
pub struct RunningCoordinator {
    local: PeerId,
    events: mpsc::UnboundedSender<Event>,
    main_loop: Mutex<Option<JoinHandle<Coordinator>>>,
}

impl RunningCoordinator {
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// The handle a transport uses to hand inbound messages over to this peer
    pub fn inbox(&self) -> Inbox {
        Inbox {
            peer: self.local,
            events: self.events.clone(),
        }
    }

    /// Queues an inbound message. Fails only once the coordinator has stopped.
    pub fn route(&self, message: GossipMessage) -> std::result::Result<(), error::DeliveryError> {
        self.inbox().deliver(message)
    }

    /// A copy of a protocol's view, or `None` for unknown protocols and stopped coordinators
    pub async fn view(&self, protocol_id: &ProtocolId) -> Option<View> {
        let (reply, snapshot) = oneshot::channel();
        self.events
            .send(Event::Snapshot {
                protocol_id: protocol_id.clone(),
                reply,
            })
            .ok()?;
        snapshot.await.ok().flatten()
    }

    /// Stops the main loop and destroys every protocol. Idempotent: only the
    /// first call gets the stopped coordinator back.
    pub async fn destroy(&self) -> Option<Coordinator> {
        let _ = self.events.send(Event::Destroy);
        let main_loop = self.main_loop.lock().await.take()?;
        main_loop.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::json;

    use super::*;
    use crate::config::{Attribute, DependencySpec, ProtocolConfig};

    fn descriptor(id: &str, kind: ProtocolKind, config: ProtocolConfig) -> ProtocolDescriptor {
        ProtocolDescriptor::new(ProtocolId::from(id), kind, config)
    }

    #[tokio::test]
    async fn peers_on_a_local_network_discover_each_other() {
        let network = LocalNetwork::new();
        let peers: Vec<PeerId> = (1..=4).map(PeerId::new).collect();
        let mut running = Vec::new();
        for (i, peer) in peers.iter().enumerate() {
            // a chain: each peer only knows the previous one
            let bootstrap: Vec<ViewEntry> = peers[..i]
                .last()
                .map(|previous| ViewEntry::fresh(*previous, json!(previous.to_u64())))
                .into_iter()
                .collect();
            let coordinator = Coordinator::builder(*peer, json!(peer.to_u64()))
                .with_bootstrap_peers(&bootstrap)
                .with_transport(Arc::new(network.clone()))
                .with_protocol(descriptor(
                    "cyclon",
                    ProtocolKind::Cyclon,
                    ProtocolConfig::default()
                        .with_view_size(3)
                        .with_fanout(2)
                        .with_gossip_period(Duration::from_millis(20)),
                ))
                .build()
                .unwrap();
            let coordinator = coordinator.start();
            network.join(coordinator.inbox());
            running.push(coordinator);
        }

        tokio::time::sleep(Duration::from_millis(500)).await;

        let cyclon = ProtocolId::from("cyclon");
        for coordinator in &running {
            let view = coordinator.view(&cyclon).await.unwrap();
            assert!(!view.is_empty());
            assert!(view.len() <= 3);
            assert!(!view.contains(&coordinator.local()));
        }
        // the first peer started with an empty view and was found by the others
        assert!(!running[0].view(&cyclon).await.unwrap().is_empty());

        for coordinator in &running {
            assert!(coordinator.destroy().await.is_some());
        }
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_stops_routing() {
        let coordinator = Coordinator::builder(PeerId::new(1), json!(1))
            .with_protocol(descriptor(
                "rps",
                ProtocolKind::Rps,
                ProtocolConfig::default(),
            ))
            .build()
            .unwrap()
            .start();

        let stopped = coordinator.destroy().await.unwrap();
        assert!(stopped.is_destroyed());
        assert!(coordinator.destroy().await.is_none());
        assert!(coordinator.view(&ProtocolId::from("rps")).await.is_none());
        assert!(coordinator
            .route(GossipMessage {
                sender_id: PeerId::new(2),
                protocol_id: ProtocolId::from("rps"),
                kind: protocol::MessageKind::Push,
                buffer: vec![],
            })
            .is_err());
    }

    #[tokio::test]
    async fn offloaded_similarity_is_scored_by_a_worker() {
        let network = LocalNetwork::new();
        let bootstrap: Vec<ViewEntry> = (2..=6)
            .map(|i| ViewEntry::fresh(PeerId::new(i), json!(i * 10)))
            .collect();
        let coordinator = Coordinator::builder(PeerId::new(1), json!(0))
            .with_bootstrap_peers(&bootstrap)
            .with_transport(Arc::new(network.clone()))
            .with_similarity_functions([("proximity", "numeric")])
            .with_protocol(descriptor(
                "cyclon",
                ProtocolKind::Cyclon,
                ProtocolConfig::default().with_view_size(5).with_fanout(2),
            ))
            .with_protocol(descriptor(
                "vicinity",
                ProtocolKind::Vicinity,
                ProtocolConfig::default()
                    .with_view_size(5)
                    .with_fanout(2)
                    .with_similarity_function("proximity")
                    .with_offloaded_similarity(true)
                    .with_gossip_period(Duration::from_millis(10))
                    .with_dependency(DependencySpec::new(
                        ProtocolId::from("cyclon"),
                        Attribute::View,
                    )),
            ))
            .build()
            .unwrap()
            .start();
        network.join(coordinator.inbox());

        // nobody answers: the loop keeps running, scoring in the background
        tokio::time::sleep(Duration::from_millis(200)).await;
        let view = coordinator
            .view(&ProtocolId::from("vicinity"))
            .await
            .unwrap();
        assert!(view.len() <= 5);
        assert!(coordinator.destroy().await.is_some());
    }
}
