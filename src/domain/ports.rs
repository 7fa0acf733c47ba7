//! Domain Ports - Core trait definitions for the array driver
//!
//! These types define the boundary between the orchestration logic and the
//! storage array. The array is reached only through [`ArrayGateway`];
//! inbound requests arrive as the plain request structs defined here.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Array Gateway Port
// =============================================================================

/// Request/response access to the array's object-oriented REST namespace.
///
/// Every call returns the `data` member of the array's response envelope; a
/// non-zero array error code is surfaced as [`Error::RemoteObject`].
/// Implementations renew expired sessions transparently.
#[async_trait]
pub trait ArrayGateway: Send + Sync {
    /// Read an object or a collection
    async fn get(&self, path: &str) -> Result<Value>;

    /// Create an object or an association (POST)
    async fn create(&self, path: &str, body: Value) -> Result<Value>;

    /// Modify an object or issue a command (PUT)
    async fn update(&self, path: &str, body: Value) -> Result<Value>;

    /// Delete an object or an association
    async fn delete(&self, path: &str) -> Result<Value>;

    /// Name of the array, for logs
    fn name(&self) -> &str;
}

pub type ArrayGatewayRef = Arc<dyn ArrayGateway>;

// =============================================================================
// Access Protocols
// =============================================================================

/// Protocol a host uses to reach a mapped LUN
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessProtocol {
    Iscsi,
    Fc,
}

impl std::fmt::Display for AccessProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessProtocol::Iscsi => write!(f, "iscsi"),
            AccessProtocol::Fc => write!(f, "fibre_channel"),
        }
    }
}

impl std::str::FromStr for AccessProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "iscsi" => Ok(AccessProtocol::Iscsi),
            "fc" | "fibre_channel" => Ok(AccessProtocol::Fc),
            other => Err(Error::UnsupportedProtocol {
                protocol: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Attach / Detach
// =============================================================================

/// Identity of the initiator node requesting access
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    /// Host name as known to the requester
    pub name: String,
    /// Management IP of the host
    #[serde(default)]
    pub ip: String,
    /// Operating system (linux, windows, ...)
    #[serde(default)]
    pub os_type: String,
    /// iSCSI IQNs or FC WWPNs of the host
    #[serde(default)]
    pub initiators: Vec<String>,
}

/// Request to expose a LUN to a host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachRequest {
    pub host: HostInfo,
    pub lun_id: String,
    pub protocol: AccessProtocol,
}

/// Request to withdraw a LUN from a host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachRequest {
    pub host_name: String,
    pub lun_id: String,
    pub protocol: AccessProtocol,
    /// Initiators to unlink once the host has no LUNs left; empty means all
    #[serde(default)]
    pub initiators: Vec<String>,
}

/// Target side of an attachment, produced by a protocol handler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetBinding {
    pub target_addresses: Vec<String>,
    pub target_identifiers: Vec<String>,
    pub initiator_target_map: BTreeMap<String, Vec<String>>,
}

/// Parameters the host-side connector needs to reach the LUN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub protocol: AccessProtocol,
    /// iSCSI portals (`ip:port`) or FC target port WWNs
    pub target_addresses: Vec<String>,
    /// iSCSI target IQNs or FC target port WWNs
    pub target_identifiers: Vec<String>,
    /// LUN number the host sees for this mapping
    pub host_lun_number: u32,
    /// FC only: initiator WWN to reachable target WWNs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub initiator_target_map: BTreeMap<String, Vec<String>>,
    pub target_discovered: bool,
}

impl ConnectionInfo {
    /// Assemble connection info from a target binding
    pub fn from_binding(protocol: AccessProtocol, binding: TargetBinding, host_lun_number: u32) -> Self {
        Self {
            protocol,
            target_addresses: binding.target_addresses,
            target_identifiers: binding.target_identifiers,
            host_lun_number,
            initiator_target_map: binding.initiator_target_map,
            target_discovered: true,
        }
    }
}

// =============================================================================
// Replication
// =============================================================================

/// Metadata key under which the pair id is handed back to the caller
pub const PAIR_ID_KEY: &str = "pair_id";

/// Replication mode of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Sync,
    Async,
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationMode::Sync => write!(f, "sync"),
            ReplicationMode::Async => write!(f, "async"),
        }
    }
}

/// Request to replicate a local LUN onto a LUN of the remote array
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReplicationRequest {
    /// Only the primary side drives pair operations
    pub is_primary: bool,
    pub local_lun_id: String,
    pub remote_lun_id: String,
    pub mode: ReplicationMode,
    /// Async replication period; ignored for sync mode
    #[serde(default)]
    pub period_seconds: u64,
}

/// Request addressing an existing pair through caller-persisted metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub is_primary: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PairRequest {
    /// Pair id recorded at creation time
    pub fn pair_id(&self) -> Result<&str> {
        self.metadata
            .get(PAIR_ID_KEY)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::MissingMetadata {
                key: PAIR_ID_KEY.to_string(),
            })
    }
}

/// Which way a failover moves the writable copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailoverDirection {
    /// Promote the remote array (disaster on the local array)
    ToSecondary,
    /// Hand the primary role back to the local array
    ToPrimary,
}

/// Request to fail a pair over or back
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverRequest {
    #[serde(flatten)]
    pub pair: PairRequest,
    pub direction: FailoverDirection,
}

/// Outcome of a replication creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationOutcome {
    /// Metadata the caller persists and hands back on later operations
    pub metadata: BTreeMap<String, String>,
}

impl ReplicationOutcome {
    pub fn pair_id(&self) -> Option<&str> {
        self.metadata.get(PAIR_ID_KEY).map(String::as_str)
    }
}

// =============================================================================
// Volumes
// =============================================================================

/// Request to create a new LUN holding a copy of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeFromSnapshotRequest {
    /// Name of the new LUN
    pub name: String,
    pub snapshot_name: String,
    /// Pool for the new LUN; empty means the configured default
    #[serde(default)]
    pub pool_name: String,
    /// Size of the new LUN; 0 means the size of the snapshot
    #[serde(default)]
    pub capacity_gb: u64,
    #[serde(default)]
    pub description: String,
}

/// A LUN created by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub lun_id: String,
    pub name: String,
    pub wwn: String,
    pub capacity_gb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_volume_request_defaults() {
        let json = r#"{"name":"vol-clone","snapshotName":"snap-1"}"#;
        let request: CreateVolumeFromSnapshotRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.snapshot_name, "snap-1");
        assert!(request.pool_name.is_empty());
        assert_eq!(request.capacity_gb, 0);
    }

    #[test]
    fn test_protocol_parse_and_display() {
        assert_eq!("iSCSI".parse::<AccessProtocol>().unwrap(), AccessProtocol::Iscsi);
        assert_eq!("fibre_channel".parse::<AccessProtocol>().unwrap(), AccessProtocol::Fc);
        assert_eq!(format!("{}", AccessProtocol::Fc), "fibre_channel");
        assert_matches!(
            "nvmeof".parse::<AccessProtocol>(),
            Err(Error::UnsupportedProtocol { .. })
        );
    }

    #[test]
    fn test_pair_request_metadata() {
        let mut request = PairRequest {
            is_primary: true,
            metadata: BTreeMap::new(),
        };
        assert_matches!(request.pair_id(), Err(Error::MissingMetadata { .. }));

        request.metadata.insert(PAIR_ID_KEY.into(), "4f2a".into());
        assert_eq!(request.pair_id().unwrap(), "4f2a");
    }

    #[test]
    fn test_failover_request_json_shape() {
        let json = r#"{"isPrimary":true,"metadata":{"pair_id":"7"},"direction":"toSecondary"}"#;
        let request: FailoverRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.direction, FailoverDirection::ToSecondary);
        assert_eq!(request.pair.pair_id().unwrap(), "7");
    }
}
