//! Cross-array replication
//!
//! - [`driver`]: primitive transitions of one pair on one array
//! - [`manager`]: the two-array lifecycle built from those primitives
//! - [`service`]: request entry points, gated on the primary side

pub mod driver;
pub mod manager;
pub mod service;

pub use driver::ReplicaDriver;
pub use manager::ReplicaPairManager;
pub use service::ReplicationService;
