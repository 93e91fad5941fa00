use std::sync::Arc;

use crate::{
    config::{OverlayConfig, ProtocolDescriptor},
    coordinator::Coordinator,
    error::Result,
    peer::{PeerId, Profile},
    similarity::{SimFuncFactory, SimilarityConstructor},
    transport::{LocalNetwork, Transport},
    view::ViewEntry,
};

pub struct CoordinatorBuilder {
    local: PeerId,
    profile: Profile,
    bootstrap_peers: Vec<ViewEntry>,
    protocols: Vec<ProtocolDescriptor>,
    similarity_functions: Vec<(String, String)>,
    implementations: Vec<(String, SimilarityConstructor)>,
    transport: Option<Arc<dyn Transport>>,
}

impl CoordinatorBuilder {
    pub fn new(local: PeerId, profile: Profile) -> Self {
        Self {
            local,
            profile,
            bootstrap_peers: Vec::new(),
            protocols: Vec::new(),
            similarity_functions: Vec::new(),
            implementations: Vec::new(),
            transport: None,
        }
    }
    /// Descriptors every protocol's view is seeded with. The local peer is skipped.
    pub fn with_bootstrap_peers(mut self, peers: &[ViewEntry]) -> Self {
        self.bootstrap_peers.extend(peers.iter().cloned());
        self
    }
    /// Protocols are registered in the order they are added, and may only
    /// depend on protocols added before them.
    pub fn with_protocol(mut self, descriptor: ProtocolDescriptor) -> Self {
        self.protocols.push(descriptor);
        self
    }
    pub fn with_overlay_config(mut self, config: OverlayConfig) -> Self {
        self.similarity_functions.extend(config.similarity_functions);
        self.protocols.extend(config.protocols);
        self
    }
    /// Named similarity functions as `(name, implementation id)` pairs
    pub fn with_similarity_functions<N, I>(
        mut self,
        functions: impl IntoIterator<Item = (N, I)>,
    ) -> Self
    where
        N: Into<String>,
        I: Into<String>,
    {
        self.similarity_functions
            .extend(functions.into_iter().map(|(n, i)| (n.into(), i.into())));
        self
    }
    pub fn with_similarity_implementation(
        mut self,
        id: impl Into<String>,
        constructor: SimilarityConstructor,
    ) -> Self {
        self.implementations.push((id.into(), constructor));
        self
    }
    /// Without a transport, the coordinator runs on a network of its own and cannot reach anybody
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }
    pub fn build(self) -> Result<Coordinator> {
        let mut similarity = SimFuncFactory::new();
        for (id, constructor) in self.implementations {
            similarity.register_implementation(id, constructor)?;
        }
        similarity.instantiate_funcs(self.similarity_functions, &self.profile)?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalNetwork::new()));
        let mut coordinator = Coordinator::new(
            self.local,
            self.profile,
            similarity,
            self.bootstrap_peers,
            transport,
        );
        for descriptor in self.protocols {
            coordinator.register_protocol(descriptor)?;
        }
        Ok(coordinator)
    }
}
