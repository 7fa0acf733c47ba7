//! Control Plane Module
//!
//! Orchestration on top of the array client: host-to-LUN mappings, the
//! per-protocol initiator handlers, replication pairs, volumes copied from
//! snapshots and the API serving them.

pub mod api;
pub mod mapping;
pub mod naming;
pub mod protocol;
pub mod replication;
pub mod volume;

pub use api::*;
pub use mapping::MappingOrchestrator;
pub use naming::ResourceNaming;
pub use protocol::{ProtocolHandler, ProtocolHandlerRef, ProtocolRegistry};
pub use replication::{ReplicaDriver, ReplicaPairManager, ReplicationService};
pub use volume::VolumeService;
