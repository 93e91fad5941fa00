use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::{
    builder::CoordinatorBuilder,
    config::{Attribute, ProtocolDescriptor},
    error::{ConfigurationError, MalformedMessageError, RegistrationError, Result},
    peer::{PeerId, Profile},
    protocol::{GossipMessage, GossipProtocol, ProtocolId},
    similarity::SimFuncFactory,
    transport::Transport,
    view::{View, ViewEntry},
};


/// A directed data-flow edge: `consumer` reads its `consumer_attribute` input
/// from the `producer_attribute` output of `producer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub consumer: ProtocolId,
    pub consumer_attribute: Attribute,
    pub producer: ProtocolId,
    pub producer_attribute: Attribute,
}

/// Owns every protocol a peer runs, and the dependencies between them.
///
/// The coordinator is a plain state machine: [Coordinator::tick] and
/// [Coordinator::route] each run one step to completion. Call
/// [Coordinator::start] to drive it with timers and an event queue, or drive it
/// by hand for simulations and tests.
///
/// Dependencies are resolved at registration time, and a protocol can only
/// depend on protocols registered before it. The dependency graph is therefore
/// acyclic, and no protocol ever reads an output that it produces itself.
pub struct Coordinator {
    local: PeerId,
    profile: Profile,
    protocols: Vec<GossipProtocol>,
    dependencies: Vec<Dependency>,
    similarity: SimFuncFactory,
    bootstrap: Vec<ViewEntry>,
    transport: Arc<dyn Transport>,
    destroyed: bool,
}

impl Coordinator {
    pub fn builder(local: PeerId, profile: Profile) -> CoordinatorBuilder {
        CoordinatorBuilder::new(local, profile)
    }

    pub(crate) fn new(
        local: PeerId,
        profile: Profile,
        similarity: SimFuncFactory,
        bootstrap: Vec<ViewEntry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        if bootstrap.is_empty() {
            warn!("Peer {local} starts without bootstrap peers, it will wait to be contacted");
        }
        Self {
            local,
            profile,
            protocols: Vec::new(),
            dependencies: Vec::new(),
            similarity,
            bootstrap,
            transport,
            destroyed: false,
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn protocol_ids(&self) -> impl Iterator<Item = &ProtocolId> {
        self.protocols.iter().map(GossipProtocol::id)
    }

    pub fn protocol(&self, id: &ProtocolId) -> Option<&GossipProtocol> {
        self.protocols.iter().find(|p| p.id() == id)
    }

    fn protocol_mut(&mut self, id: &ProtocolId) -> Option<&mut GossipProtocol> {
        self.protocols.iter_mut().find(|p| p.id() == id)
    }

    pub(crate) fn protocols_mut(&mut self) -> impl Iterator<Item = &mut GossipProtocol> {
        self.protocols.iter_mut()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// A copy of a protocol's current view
    pub fn view(&self, id: &ProtocolId) -> Option<View> {
        self.protocol(id).map(GossipProtocol::view)
    }

    pub fn subscribe_view(&self, id: &ProtocolId) -> Option<watch::Receiver<View>> {
        self.protocol(id).map(GossipProtocol::subscribe_view)
    }

    /// Replaces the local profile. Every protocol gossips the new profile from its next step on.
    pub fn set_profile(&mut self, profile: Profile) {
        for protocol in &self.protocols {
            protocol.set_profile(profile.clone());
        }
        self.profile = profile;
    }

    /// Instantiates a protocol, binds its declared dependencies to the live outputs
    /// of already registered protocols, and seeds its view with the bootstrap peers.
    pub fn register_protocol(&mut self, descriptor: ProtocolDescriptor) -> Result<()> {
        let ProtocolDescriptor { id, kind, config } = descriptor;
        if self.protocol(&id).is_some() {
            return Err(RegistrationError::DuplicateProtocol(id).into());
        }
        let similarity = match &config.similarity_function {
            Some(name) => Some(
                self.similarity
                    .get(name)
                    .ok_or_else(|| ConfigurationError::UnknownSimilarityFunction(name.clone()))?,
            ),
            None => None,
        };
        let dependencies = config.dependencies.clone();
        let mut protocol = GossipProtocol::initialize(
            id.clone(),
            kind,
            config,
            self.local,
            self.profile.clone(),
            similarity,
        )?;

        let mut edges = Vec::with_capacity(dependencies.len());
        for declared in dependencies {
            if declared.algo_id == id {
                return Err(ConfigurationError::SelfDependency(id).into());
            }
            if !protocol.consumes(declared.algo_attribute) {
                return Err(ConfigurationError::UnsupportedAttribute {
                    protocol: id,
                    attribute: declared.algo_attribute,
                }
                .into());
            }
            let producer = self.protocol(&declared.algo_id).ok_or_else(|| {
                ConfigurationError::UnknownDependency {
                    consumer: id.clone(),
                    producer: declared.algo_id.clone(),
                }
            })?;
            match declared.algo_attribute {
                Attribute::View => protocol.bind_view(producer.subscribe_view()),
                Attribute::Data => protocol.bind_data(producer.subscribe_data()),
            }
            edges.push(Dependency {
                consumer: id.clone(),
                consumer_attribute: declared.algo_attribute,
                producer: declared.algo_id,
                producer_attribute: declared.algo_attribute,
            });
        }

        protocol.seed(self.bootstrap.iter().cloned());
        info!(
            "Peer {} registered protocol {} ({:?}, {} dependencies)",
            self.local,
            id,
            protocol.kind(),
            edges.len()
        );
        self.dependencies.extend(edges);
        self.protocols.push(protocol);
        Ok(())
    }

    /// Runs one cycle of the given protocol
    pub fn tick(&mut self, id: &ProtocolId) {
        if self.destroyed {
            return;
        }
        let transport = Arc::clone(&self.transport);
        match self.protocol_mut(id) {
            Some(protocol) => protocol.tick(transport.as_ref()),
            None => debug!("Ignoring tick for unknown protocol {id}"),
        }
    }

    /// Ticks every protocol once, in registration order
    pub fn tick_all(&mut self) {
        if self.destroyed {
            return;
        }
        let transport = Arc::clone(&self.transport);
        for protocol in &mut self.protocols {
            protocol.tick(transport.as_ref());
        }
    }

    /// Dispatches an inbound message to its protocol. Messages that cannot be
    /// dispatched are logged and dropped; they never reach the caller as errors.
    pub fn route(&mut self, message: GossipMessage) {
        if let Err(e) = self.dispatch(message) {
            warn!("Peer {} dropped an inbound message: {}", self.local, e);
        }
    }

    fn dispatch(
        &mut self,
        message: GossipMessage,
    ) -> std::result::Result<(), MalformedMessageError> {
        if self.destroyed {
            return Ok(());
        }
        if message.sender_id == self.local {
            return Err(MalformedMessageError::FromSelf(self.local));
        }
        let transport = Arc::clone(&self.transport);
        let protocol = self
            .protocol_mut(&message.protocol_id)
            .ok_or_else(|| MalformedMessageError::UnknownProtocol(message.protocol_id.clone()))?;
        protocol.receive(message, transport.as_ref());
        Ok(())
    }

    pub(crate) fn accept_similarity(&mut self, id: &ProtocolId, response: &str) {
        if self.destroyed {
            return;
        }
        if let Some(protocol) = self.protocol_mut(id) {
            protocol.accept_similarity(response);
        }
    }

    /// Destroys every protocol and releases their views. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for protocol in &mut self.protocols {
            protocol.destroy();
        }
        self.destroyed = true;
        info!("Peer {} destroyed", self.local);
    }
}
