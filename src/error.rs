use thiserror::Error;

use crate::{config::Attribute, peer::PeerId, protocol::ProtocolId};

/// An invalid or missing option. Fatal at construction: the protocol never starts.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigurationError {
    #[error("view size must be greater than zero")]
    InvalidViewSize,
    #[error("gossip period must be greater than zero")]
    InvalidGossipPeriod,
    #[error(
        "fanout must be greater than zero and smaller than the view size {view_size}, got {fanout}"
    )]
    InvalidFanout { fanout: usize, view_size: usize },
    #[error("propagation policy must enable push, pull, or both")]
    NoPropagation,
    #[error("protocol {protocol} does not support the {policy} selection policy")]
    UnsupportedSelectionPolicy {
        protocol: &'static str,
        policy: &'static str,
    },
    #[error("the {0} selection policy requires a similarity function")]
    MissingSimilarityFunction(&'static str),
    #[error("no similarity function is registered under the name {0}")]
    UnknownSimilarityFunction(String),
    #[error("protocol {consumer} depends on unregistered protocol {producer}")]
    UnknownDependency {
        consumer: ProtocolId,
        producer: ProtocolId,
    },
    #[error("protocol {0} cannot depend on itself")]
    SelfDependency(ProtocolId),
    #[error("protocol {protocol} does not consume the {attribute} attribute")]
    UnsupportedAttribute {
        protocol: ProtocolId,
        attribute: Attribute,
    },
    #[error("invalid overlay configuration document: {0}")]
    Document(String),
}

/// Raised by peer selection when there is nobody to gossip with. The cycle is skipped.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("the view is empty, no peer to gossip with")]
pub struct EmptyViewError;

/// Plug-in wiring failures. Fatal at registration.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RegistrationError {
    #[error("{0} is already registered")]
    DuplicateRegistration(String),
    #[error("no similarity implementation is known as {0}")]
    UnknownImplementation(String),
    #[error("a protocol with id {0} is already registered")]
    DuplicateProtocol(ProtocolId),
}

/// The transport could not hand a message over to its destination
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DeliveryError {
    #[error("peer {0} is unreachable")]
    UnknownPeer(PeerId),
    #[error("peer {0} has disconnected")]
    Disconnected(PeerId),
}

/// An inbound message that cannot be dispatched. The message is dropped.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MalformedMessageError {
    #[error("no protocol is registered with id {0}")]
    UnknownProtocol(ProtocolId),
    #[error("message claims to come from the local peer {0}")]
    FromSelf(PeerId),
}

/// Errors surfaced to callers while setting up an overlay
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

pub type Result<T> = std::result::Result<T, Error>;
