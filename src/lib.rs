//! Block Array Driver - Attach & Replication Control Plane
//!
//! Exposes LUNs of an enterprise block-storage array to hosts over iSCSI or
//! Fibre Channel, and manages replication pairs between two arrays.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        REST API (axum)                           │
//! ├────────────────────────────────┬─────────────────────────────────┤
//! │      Mapping Orchestrator      │      Replication Service        │
//! │  host ─ host group ─ view ─    │  pair manager (two arrays)      │
//! │  lun group ─ lun               │  replica driver (one side)      │
//! │  ┌──────────┐  ┌──────────┐    │                                 │
//! │  │  iSCSI   │  │    FC    │    │                                 │
//! │  └──────────┘  └──────────┘    │                                 │
//! ├────────────────────────────────┴─────────────────────────────────┤
//! │              Array Client (typed operations)                     │
//! ├──────────────────────────────────────────────────────────────────┤
//! │   ArrayGateway:  RestGateway (HTTPS)  |  SimulatedArray          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`array`]: array gateway implementations and the typed client
//! - [`controlplane`]: mapping orchestration, protocols, replication,
//!   volumes, API
//! - [`config`]: driver configuration
//! - [`domain`]: request types and the gateway port
//! - [`error`]: error types and handling
//! - [`metrics`]: operation metrics
//! - [`wait`]: bounded polling

pub mod array;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod wait;

// Re-export commonly used types
pub use array::{ArrayClient, RestGateway, SimulatedArray};

pub use config::{ArrayAuthConfig, DriverConfig};

pub use controlplane::{
    ApiServer, ApiServerConfig, MappingOrchestrator, ProtocolRegistry, ReplicaPairManager,
    ReplicationService, VolumeService,
};

pub use domain::ports::{
    AccessProtocol, ArrayGateway, ArrayGatewayRef, AttachRequest, ConnectionInfo,
    CreateReplicationRequest, CreateVolumeFromSnapshotRequest, DetachRequest, FailoverDirection,
    FailoverRequest, HostInfo, PairRequest, ReplicationMode, ReplicationOutcome, VolumeInfo,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::Metrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
