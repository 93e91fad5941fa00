use std::{fmt::Display, sync::Arc};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use self::{cyclon::CyclonPolicy, rps::RpsPolicy, vicinity::VicinityPolicy};
use crate::{
    config::{Attribute, ProtocolConfig},
    error::{ConfigurationError, EmptyViewError},
    peer::{PeerId, Profile},
    similarity::{worker::SimilarityClient, SimilarityFunction},
    transport::Transport,
    view::{sanitize, View, ViewEntry},
};

pub mod cyclon;
pub mod rps;
pub mod vicinity;


/// Identifies one protocol instance within a peer, and the matching instances on remote peers
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolId(String);

impl ProtocolId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProtocolId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ProtocolId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Cyclon,
    Vicinity,
    Rps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// An unsolicited buffer
    Push,
    /// An empty request for the receiver's buffer, sent by pull-only protocols
    PullRequest,
    /// The answer to a push or a pull request. Never answered itself.
    Response,
}

/// The unit exchanged between two peers for one protocol cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipMessage {
    pub sender_id: PeerId,
    pub protocol_id: ProtocolId,
    pub kind: MessageKind,
    pub buffer: Vec<ViewEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Idle,
    /// Running a tick
    Active,
    /// A buffer was sent and the answer of this peer has not arrived yet
    AwaitingPeer(PeerId),
    /// Terminal: ticks and inbound messages are ignored
    Destroyed,
}

/// Live bindings to the outputs of the protocols this one depends on.
///
/// Each binding is a [watch::Receiver] on the producer's attribute, so every read
/// observes the producer's latest fully merged value without copying it around.
#[derive(Debug, Default, Clone)]
pub struct Inputs {
    pub(crate) view: Option<watch::Receiver<View>>,
    pub(crate) data: Option<watch::Receiver<Profile>>,
}

impl Inputs {
    /// The descriptors of the bound view, or nothing if no view is bound
    pub fn candidates(&self) -> Vec<ViewEntry> {
        self.view
            .as_ref()
            .map(|view| view.borrow().entries().cloned().collect())
            .unwrap_or_default()
    }

    pub fn profile(&self) -> Option<Profile> {
        self.data.as_ref().map(|data| data.borrow().clone())
    }
}

/// What a policy gets to see of its protocol during one step
pub struct Context<'a> {
    pub local: PeerId,
    /// The local profile, taken from the bound `data` input when there is one
    pub profile: Profile,
    pub config: &'a ProtocolConfig,
    pub inputs: &'a Inputs,
}

impl<'a> Context<'a> {
    fn new(
        local: PeerId,
        config: &'a ProtocolConfig,
        inputs: &'a Inputs,
        data: &watch::Sender<Profile>,
    ) -> Self {
        let profile = inputs.profile().unwrap_or_else(|| data.borrow().clone());
        Self {
            local,
            profile,
            config,
            inputs,
        }
    }
}

/// The parts of a gossip cycle that differ between protocols.
///
/// [GossipProtocol] drives the cycle (aging, sending, answering, sanitizing
/// received buffers), and calls into its policy to choose a target, to pick
/// the descriptors to send, and to reconcile received descriptors.
pub trait GossipPolicy: Send {
    /// Chooses the peer to gossip with. The view has already been aged for this tick.
    fn select_peer(&mut self, ctx: &Context<'_>, view: &View) -> Result<PeerId, EmptyViewError>;

    /// Picks the descriptors to send to `target`, not counting the fresh self
    /// descriptor the engine appends. May update the view.
    fn build_buffer(
        &mut self,
        ctx: &Context<'_>,
        view: &mut View,
        target: PeerId,
    ) -> Vec<ViewEntry>;

    /// Reconciles sanitized descriptors received from `sender` into the view.
    /// Must leave the view within its capacity. Closes the exchange with `sender`.
    fn merge(
        &mut self,
        ctx: &Context<'_>,
        view: &mut View,
        sender: PeerId,
        incoming: Vec<ViewEntry>,
    );

    /// The exchange with `peer` ended without a buffer to merge
    fn exchange_closed(&mut self, _peer: PeerId) {}

    /// Whether the protocol knows what to do with a bound input
    fn consumes(&self, attribute: Attribute) -> bool {
        attribute == Attribute::Data
    }

    /// Called at the start of every tick, after aging
    fn prepare(&mut self, _ctx: &Context<'_>, _view: &View) {}

    fn attach_worker(&mut self, _client: SimilarityClient) {}

    /// Receives a serialized similarity batch response from the worker
    fn accept_similarity(&mut self, _ctx: &Context<'_>, _view: &View, _response: &str) {}

    fn destroy(&mut self) {}
}

/// One running protocol instance: its view, its policy, and its position in the cycle
pub struct GossipProtocol {
    id: ProtocolId,
    kind: ProtocolKind,
    local: PeerId,
    config: ProtocolConfig,
    state: ProtocolState,
    policy: Box<dyn GossipPolicy>,
    view: watch::Sender<View>,
    data: watch::Sender<Profile>,
    inputs: Inputs,
    similarity: Option<Arc<dyn SimilarityFunction>>,
}

impl GossipProtocol {
    /// Validates the configuration and builds an idle protocol with an empty view
    pub fn initialize(
        id: ProtocolId,
        kind: ProtocolKind,
        config: ProtocolConfig,
        local: PeerId,
        profile: Profile,
        similarity: Option<Arc<dyn SimilarityFunction>>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let policy: Box<dyn GossipPolicy> = match kind {
            ProtocolKind::Cyclon => Box::new(CyclonPolicy::new(&config)?),
            ProtocolKind::Vicinity => Box::new(VicinityPolicy::new(&config, similarity.clone())?),
            ProtocolKind::Rps => Box::new(RpsPolicy::new(&config)?),
        };
        let (view, _) = watch::channel(View::new(local, config.view_size));
        let (data, _) = watch::channel(profile);
        Ok(Self {
            id,
            kind,
            local,
            config,
            state: ProtocolState::Idle,
            policy,
            view,
            data,
            inputs: Inputs::default(),
            similarity,
        })
    }

    pub fn id(&self) -> &ProtocolId {
        &self.id
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == ProtocolState::Destroyed
    }

    /// A copy of the current view
    pub fn view(&self) -> View {
        self.view.borrow().clone()
    }

    /// A live handle on the view, for dependent protocols and observers
    pub fn subscribe_view(&self) -> watch::Receiver<View> {
        self.view.subscribe()
    }

    pub fn subscribe_data(&self) -> watch::Receiver<Profile> {
        self.data.subscribe()
    }

    pub fn set_profile(&self, profile: Profile) {
        self.data.send_replace(profile);
    }

    /// Seeds the view with bootstrap descriptors, keeping it within its capacity
    pub fn seed(&mut self, entries: impl IntoIterator<Item = ViewEntry>) {
        self.view.send_modify(|view| {
            view.merge_fresher(entries);
            view.evict_oldest();
        });
    }

    pub(crate) fn consumes(&self, attribute: Attribute) -> bool {
        self.policy.consumes(attribute)
    }

    pub(crate) fn bind_view(&mut self, producer: watch::Receiver<View>) {
        self.inputs.view = Some(producer);
    }

    pub(crate) fn bind_data(&mut self, producer: watch::Receiver<Profile>) {
        self.inputs.data = Some(producer);
    }

    /// The function to run on a worker thread, if this protocol offloads scoring
    pub(crate) fn offloaded_similarity(&self) -> Option<Arc<dyn SimilarityFunction>> {
        if self.config.offload_similarity && self.kind == ProtocolKind::Vicinity {
            self.similarity.clone()
        } else {
            None
        }
    }

    pub(crate) fn attach_worker(&mut self, client: SimilarityClient) {
        self.policy.attach_worker(client);
    }

    /// Runs one gossip cycle: age the view, pick a target, send it our buffer
    /// (or a pull request when push is disabled). Never blocks.
    pub fn tick(&mut self, transport: &dyn Transport) {
        if self.is_destroyed() {
            return;
        }
        if let ProtocolState::AwaitingPeer(silent) = self.state {
            debug!("[{}] {} never answered, dropping it", self.id, silent);
            self.view.send_modify(|view| {
                view.remove(&silent);
            });
            self.policy.exchange_closed(silent);
        }
        self.state = ProtocolState::Active;

        let ctx = Context::new(self.local, &self.config, &self.inputs, &self.data);
        self.view.send_modify(|view| view.increment_ages());
        self.policy.prepare(&ctx, &self.view.borrow());

        let selected = self.policy.select_peer(&ctx, &self.view.borrow());
        let target = match selected {
            Ok(target) => target,
            Err(e) => {
                debug!("[{}] Skipping cycle: {}", self.id, e);
                self.state = ProtocolState::Idle;
                return;
            }
        };

        let (kind, buffer) = if self.config.propagation_policy.push {
            let mut buffer = Vec::new();
            self.view
                .send_modify(|view| buffer = self.policy.build_buffer(&ctx, view, target));
            buffer.push(ViewEntry::fresh(self.local, ctx.profile.clone()));
            (MessageKind::Push, buffer)
        } else {
            (MessageKind::PullRequest, Vec::new())
        };
        debug!(
            "[{}] Gossiping with {} ({:?}, {} descriptors)",
            self.id,
            target,
            kind,
            buffer.len()
        );

        let message = GossipMessage {
            sender_id: self.local,
            protocol_id: self.id.clone(),
            kind,
            buffer,
        };
        match transport.send(target, message) {
            Ok(()) if self.config.propagation_policy.pull => {
                self.state = ProtocolState::AwaitingPeer(target);
            }
            Ok(()) => {
                self.policy.exchange_closed(target);
                self.state = ProtocolState::Idle;
            }
            Err(e) => {
                warn!("[{}] Could not gossip with {}: {}", self.id, target, e);
                self.view.send_modify(|view| {
                    view.remove(&target);
                });
                self.policy.exchange_closed(target);
                self.state = ProtocolState::Idle;
            }
        }
    }

    /// Handles an inbound message: answers it once if it asks for an answer and
    /// pull is enabled, then merges the received descriptors.
    pub fn receive(&mut self, message: GossipMessage, transport: &dyn Transport) {
        if self.is_destroyed() {
            return;
        }
        let ctx = Context::new(self.local, &self.config, &self.inputs, &self.data);
        let sender = message.sender_id;

        match message.kind {
            MessageKind::Push | MessageKind::PullRequest if self.config.propagation_policy.pull => {
                let mut buffer = Vec::new();
                self.view
                    .send_modify(|view| buffer = self.policy.build_buffer(&ctx, view, sender));
                buffer.push(ViewEntry::fresh(self.local, ctx.profile.clone()));
                let response = GossipMessage {
                    sender_id: self.local,
                    protocol_id: self.id.clone(),
                    kind: MessageKind::Response,
                    buffer,
                };
                if let Err(e) = transport.send(sender, response) {
                    warn!("[{}] Could not answer {}: {}", self.id, sender, e);
                }
            }
            MessageKind::Push | MessageKind::PullRequest => {}
            MessageKind::Response => {
                if self.state == ProtocolState::AwaitingPeer(sender) {
                    self.state = ProtocolState::Idle;
                }
            }
        }

        let incoming = sanitize(self.local, message.buffer);
        if incoming.is_empty() {
            self.policy.exchange_closed(sender);
            return;
        }
        debug!(
            "[{}] Merging {} descriptors from {}",
            self.id,
            incoming.len(),
            sender
        );
        self.view
            .send_modify(|view| self.policy.merge(&ctx, view, sender, incoming));
    }

    /// Hands a serialized similarity batch response over to the policy
    pub fn accept_similarity(&mut self, response: &str) {
        if self.is_destroyed() {
            return;
        }
        let ctx = Context::new(self.local, &self.config, &self.inputs, &self.data);
        self.policy
            .accept_similarity(&ctx, &self.view.borrow(), response);
    }

    /// Stops the protocol for good and releases its view. Idempotent.
    pub fn destroy(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.state = ProtocolState::Destroyed;
        self.policy.destroy();
        self.view
            .send_replace(View::new(self.local, self.config.view_size));
        self.inputs = Inputs::default();
    }
}
