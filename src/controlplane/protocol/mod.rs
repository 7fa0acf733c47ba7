//! Access protocol handlers
//!
//! Each protocol knows how to link a host's initiators on the array and how
//! to describe the targets the host should connect to. Handlers are looked
//! up by protocol in a [`ProtocolRegistry`] built once at startup.

pub mod fc;
pub mod iscsi;

pub use fc::FcHandler;
pub use iscsi::IscsiHandler;

use crate::array::ArrayClient;
use crate::config::DriverConfig;
use crate::domain::ports::{AccessProtocol, TargetBinding};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Protocol-specific part of attach and detach
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn protocol(&self) -> AccessProtocol;

    /// Link the initiators to the host and resolve the targets they reach
    async fn attach(&self, client: &ArrayClient, host_id: &str, initiators: &[String]) -> Result<TargetBinding>;

    /// Unlink the given initiators from the host, or all of them when empty
    async fn detach(&self, client: &ArrayClient, host_id: &str, initiators: &[String]) -> Result<()>;

    /// Initiators of this protocol currently linked to the host
    async fn host_initiators(&self, client: &ArrayClient, host_id: &str) -> Result<Vec<String>>;
}

pub type ProtocolHandlerRef = Arc<dyn ProtocolHandler>;

/// Handlers keyed by protocol
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    handlers: BTreeMap<AccessProtocol, ProtocolHandlerRef>,
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}

impl ProtocolRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the iSCSI and FC handlers
    pub fn with_defaults(config: &DriverConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IscsiHandler::new(config.iscsi.clone())));
        registry.register(Arc::new(FcHandler::new()));
        registry
    }

    /// Add or replace the handler for its protocol
    pub fn register(&mut self, handler: ProtocolHandlerRef) {
        let protocol = handler.protocol();
        info!("Registered {} protocol handler", protocol);
        self.handlers.insert(protocol, handler);
    }

    pub fn get(&self, protocol: AccessProtocol) -> Result<ProtocolHandlerRef> {
        self.handlers
            .get(&protocol)
            .cloned()
            .ok_or_else(|| Error::UnsupportedProtocol {
                protocol: protocol.to_string(),
            })
    }

    pub fn protocols(&self) -> Vec<AccessProtocol> {
        self.handlers.keys().copied().collect()
    }
}
