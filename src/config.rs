use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::{
    error::ConfigurationError,
    protocol::{ProtocolId, ProtocolKind},
};

/// Which directions of an exchange are enabled.
///
/// `push` sends our own buffer to the selected peer on every tick, `pull`
/// answers inbound exchanges with a buffer of our own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationPolicy {
    pub push: bool,
    pub pull: bool,
}

impl PropagationPolicy {
    pub const PUSH_PULL: Self = Self {
        push: true,
        pull: true,
    };
    pub const PUSH: Self = Self {
        push: true,
        pull: false,
    };
    pub const PULL: Self = Self {
        push: false,
        pull: true,
    };
}

impl Default for PropagationPolicy {
    fn default() -> Self {
        Self::PUSH_PULL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    Random,
    Biased,
    AgrBiased,
    Oldest,
}

impl SelectionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            SelectionPolicy::Random => "random",
            SelectionPolicy::Biased => "biased",
            SelectionPolicy::AgrBiased => "agr-biased",
            SelectionPolicy::Oldest => "oldest",
        }
    }
}

/// A protocol attribute that can be produced for, or consumed by, another protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Attribute {
    /// The protocol's current view
    View,
    /// The local profile the protocol gossips about
    Data,
}

impl Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attribute::View => f.write_str("view"),
            Attribute::Data => f.write_str("data"),
        }
    }
}

/// Declares that the configured protocol sources its `algo_attribute` input
/// from the protocol registered as `algo_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    pub algo_id: ProtocolId,
    pub algo_attribute: Attribute,
}

impl DependencySpec {
    pub fn new(algo_id: impl Into<ProtocolId>, algo_attribute: Attribute) -> Self {
        Self {
            algo_id: algo_id.into(),
            algo_attribute,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolConfig {
    pub view_size: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub gossip_period: Duration,
    /// Number of descriptors sent per exchange, the fresh self descriptor included
    #[serde(alias = "gossipLength")]
    pub fanout: usize,
    pub propagation_policy: PropagationPolicy,
    /// Defaults to the protocol's own rule when absent
    pub selection_policy: Option<SelectionPolicy>,
    /// Logical name of a similarity function in the coordinator's inventory
    pub similarity_function: Option<String>,
    pub dependencies: Vec<DependencySpec>,
    /// `H`: number of oldest descriptors discarded first when a merge overflows
    pub healing: usize,
    /// `S`: number of sent descriptors discarded next when a merge overflows
    pub swap: usize,
    /// Score candidates on a worker thread instead of inline
    pub offload_similarity: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            view_size: 10,
            gossip_period: Duration::from_secs(1),
            fanout: 5,
            propagation_policy: PropagationPolicy::default(),
            selection_policy: None,
            similarity_function: None,
            dependencies: Vec::new(),
            healing: 1,
            swap: 3,
            offload_similarity: false,
        }
    }
}

impl ProtocolConfig {
    pub fn with_view_size(mut self, view_size: usize) -> Self {
        self.view_size = view_size;
        self
    }
    pub fn with_gossip_period(mut self, gossip_period: Duration) -> Self {
        self.gossip_period = gossip_period;
        self
    }
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }
    pub fn with_propagation_policy(mut self, policy: PropagationPolicy) -> Self {
        self.propagation_policy = policy;
        self
    }
    pub fn with_selection_policy(mut self, policy: SelectionPolicy) -> Self {
        self.selection_policy = Some(policy);
        self
    }
    pub fn with_similarity_function(mut self, name: impl Into<String>) -> Self {
        self.similarity_function = Some(name.into());
        self
    }
    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }
    pub fn with_healing(mut self, healing: usize) -> Self {
        self.healing = healing;
        self
    }
    pub fn with_swap(mut self, swap: usize) -> Self {
        self.swap = swap;
        self
    }
    pub fn with_offloaded_similarity(mut self, offload: bool) -> Self {
        self.offload_similarity = offload;
        self
    }

    /// Checks the options shared by every protocol
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.view_size == 0 {
            return Err(ConfigurationError::InvalidViewSize);
        }
        if self.gossip_period.is_zero() {
            return Err(ConfigurationError::InvalidGossipPeriod);
        }
        if self.fanout == 0 || self.fanout >= self.view_size {
            return Err(ConfigurationError::InvalidFanout {
                fanout: self.fanout,
                view_size: self.view_size,
            });
        }
        if !self.propagation_policy.push && !self.propagation_policy.pull {
            return Err(ConfigurationError::NoPropagation);
        }
        Ok(())
    }
}

/// Everything the coordinator needs to instantiate one protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolDescriptor {
    pub id: ProtocolId,
    pub kind: ProtocolKind,
    #[serde(default)]
    pub config: ProtocolConfig,
}

impl ProtocolDescriptor {
    pub fn new(id: impl Into<ProtocolId>, kind: ProtocolKind, config: ProtocolConfig) -> Self {
        Self {
            id: id.into(),
            kind,
            config,
        }
    }
}

/// A whole overlay, as loaded from a configuration document.
///
/// ```json
/// {
///   "similarityFunctions": { "proximity": "numeric" },
///   "protocols": [
///     { "id": "cyclon", "kind": "cyclon", "config": {
///         "viewSize": 8, "gossipPeriod": 500, "fanout": 4 } },
///     { "id": "vicinity", "kind": "vicinity", "config": {
///         "viewSize": 6, "fanout": 3, "selectionPolicy": "biased",
///         "similarityFunction": "proximity",
///         "dependencies": [{ "algoId": "cyclon", "algoAttribute": "view" }] } }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverlayConfig {
    /// Logical name to implementation id, in declaration order
    pub similarity_functions: Vec<(String, String)>,
    pub protocols: Vec<ProtocolDescriptor>,
}

impl OverlayConfig {
    pub fn from_json(document: &str) -> Result<Self, ConfigurationError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Document {
            #[serde(default)]
            similarity_functions: serde_json::Map<String, serde_json::Value>,
            #[serde(default)]
            protocols: Vec<ProtocolDescriptor>,
        }

        let document: Document = serde_json::from_str(document)
            .map_err(|e| ConfigurationError::Document(e.to_string()))?;
        let similarity_functions = document
            .similarity_functions
            .into_iter()
            .map(|(name, implementation)| match implementation {
                serde_json::Value::String(implementation) => Ok((name, implementation)),
                other => Err(ConfigurationError::Document(format!(
                    "similarity function {name} must name an implementation, got {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            similarity_functions,
            protocols: document.protocols,
        })
    }
}
