//! Array object model
//!
//! Remote objects as the array reports them, plus the status vocabularies
//! and wire codes of the management API. The array reports every scalar as
//! a string; status fields keep the raw code and expose a typed view.

use serde::{Deserialize, Serialize};

// =============================================================================
// Wire Codes
// =============================================================================

/// Array error codes interpreted by the driver
pub mod codes {
    /// Session expired, or the controller refused the connection
    pub const SESSION_EXPIRED: i64 = -403;
    /// Request carried no valid session
    pub const UNAUTHORIZED: i64 = -401;
    /// An object with the same name already exists
    pub const OBJECT_NAME_ALREADY_EXISTS: i64 = 1077948993;
    /// The addressed object does not exist
    pub const OBJECT_NOT_FOUND: i64 = 1077948996;
    /// An object with the same id already exists
    pub const OBJECT_ID_NOT_UNIQUE: i64 = 1077948997;
    /// The association is already in place
    pub const OBJECT_ALREADY_ASSOCIATED: i64 = 1073804556;
    /// The object is still referenced and cannot be removed
    pub const OBJECT_IN_USE: i64 = 1077949001;
    /// The initiator belongs to another host
    pub const INITIATOR_IN_USE: i64 = 1077950342;
    /// Command not allowed in the pair's current state
    pub const INVALID_PAIR_STATE: i64 = 1077937880;
    /// Malformed request
    pub const PARAMETER_ERROR: i64 = 50331651;
}

/// Object type codes used in association queries
pub mod object_type {
    pub const LUN: &str = "11";
    pub const HOST_GROUP: &str = "14";
    pub const HOST: &str = "21";
    pub const SNAPSHOT: &str = "27";
    pub const ISCSI_INITIATOR: &str = "222";
    pub const FC_INITIATOR: &str = "223";
    pub const MAPPING_VIEW: &str = "245";
    pub const LUN_GROUP: &str = "256";
}

/// LUN running status once it can serve I/O
pub const LUN_STATUS_READY: &str = "27";
/// LUN running status while it is still being formatted
pub const LUN_STATUS_INITIALIZING: &str = "53";
pub const LUN_HEALTH_NORMAL: &str = "1";
pub const LUN_HEALTH_FAULT: &str = "2";
/// FC initiator running status when logged in to the array
pub const FC_INITIATOR_ONLINE: &str = "27";
pub const FC_INITIATOR_OFFLINE: &str = "28";
/// Remote device type of a replication peer
pub const REMOTE_DEVICE_REPLICATION: &str = "1";
pub const REMOTE_DEVICE_HEALTH_NORMAL: &str = "1";
pub const REMOTE_DEVICE_LINK_UP: &str = "10";

// =============================================================================
// Mapping Objects
// =============================================================================

/// Array-side identity of an initiator node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "OPERATIONSYSTEM")]
    pub os_type: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "DESCRIPTION")]
    pub description: String,
}

/// Named container of hosts, of LUNs, or a mapping view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamedObject {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME")]
    pub name: String,
}

pub type HostGroup = NamedObject;
pub type LunGroup = NamedObject;
pub type MappingView = NamedObject;

/// A LUN
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lun {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "RUNNINGSTATUS")]
    pub running_status: String,
    #[serde(rename = "HEALTHSTATUS")]
    pub health_status: String,
    #[serde(rename = "WWN")]
    pub wwn: String,
    /// Size in 512-byte sectors
    #[serde(rename = "CAPACITY")]
    pub capacity: String,
}

impl Lun {
    pub fn is_ready(&self) -> bool {
        self.running_status == LUN_STATUS_READY
    }

    /// Ready and healthy, so it can take part in a copy
    pub fn is_online(&self) -> bool {
        self.is_ready() && self.health_status == LUN_HEALTH_NORMAL
    }
}

// =============================================================================
// Volume Objects
// =============================================================================

/// Sectors per GiB of capacity
pub const SECTORS_PER_GB: u64 = 2 * 1024 * 1024;

/// Convert a size in GiB to array sectors
pub fn gb_to_sectors(gb: u64) -> u64 {
    gb * SECTORS_PER_GB
}

/// Convert array sectors to whole GiB, rounding up
pub fn sectors_to_gb(sectors: u64) -> u64 {
    sectors.div_ceil(SECTORS_PER_GB)
}

/// A point-in-time snapshot of a LUN
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "PARENTID")]
    pub parent_id: String,
    /// Size in sectors exposed to a reader of the snapshot
    #[serde(rename = "USERCAPACITY")]
    pub user_capacity: String,
    #[serde(rename = "HEALTHSTATUS")]
    pub health_status: String,
}

/// A storage pool LUNs are carved from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePool {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "HEALTHSTATUS")]
    pub health_status: String,
    /// Free space in sectors
    #[serde(rename = "USERFREECAPACITY")]
    pub user_free_capacity: String,
}

/// Running status of a LUN copy task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LunCopyStatus {
    Queuing,
    Copying,
    Stopped,
    Complete,
    Paused,
    Other,
}

impl LunCopyStatus {
    pub fn code(self) -> &'static str {
        match self {
            LunCopyStatus::Queuing => "37",
            LunCopyStatus::Stopped => "38",
            LunCopyStatus::Copying => "39",
            LunCopyStatus::Complete => "40",
            LunCopyStatus::Paused => "41",
            LunCopyStatus::Other => "",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "37" => LunCopyStatus::Queuing,
            "38" => LunCopyStatus::Stopped,
            "39" => LunCopyStatus::Copying,
            "40" => LunCopyStatus::Complete,
            "41" => LunCopyStatus::Paused,
            _ => LunCopyStatus::Other,
        }
    }
}

/// A copy task from a source object onto a target LUN
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LunCopy {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "RUNNINGSTATUS")]
    pub running_status: String,
    #[serde(rename = "HEALTHSTATUS")]
    pub health_status: String,
    /// Percent complete
    #[serde(rename = "COPYPROGRESS")]
    pub progress: String,
}

impl LunCopy {
    pub fn status(&self) -> LunCopyStatus {
        LunCopyStatus::from_code(&self.running_status)
    }

    pub fn is_healthy(&self) -> bool {
        self.health_status == LUN_HEALTH_NORMAL
    }
}

/// Source or target descriptor of a LUN copy: only the object id is set
pub fn lun_copy_member(object_id: &str) -> String {
    format!("INVALID;{};INVALID;INVALID;INVALID", object_id)
}

/// A LUN as seen through a host association
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostAssociatedLun {
    #[serde(rename = "ID")]
    pub id: String,
    /// JSON document carrying `HostLUNID`
    #[serde(rename = "ASSOCIATEMETADATA")]
    pub associate_metadata: String,
}

/// Metadata attached to a host/LUN association
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostLunMetadata {
    #[serde(rename = "HostLUNID")]
    pub host_lun_id: u32,
}

/// iSCSI initiator object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IscsiInitiator {
    /// The IQN
    #[serde(rename = "ID")]
    pub id: String,
    /// Owning host id, empty when free
    #[serde(rename = "PARENTID")]
    pub parent_id: String,
    #[serde(rename = "ISFREE")]
    pub is_free: String,
}

/// FC initiator object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FcInitiator {
    /// The WWPN
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "PARENTID")]
    pub parent_id: String,
    #[serde(rename = "ISFREE")]
    pub is_free: String,
    #[serde(rename = "RUNNINGSTATUS")]
    pub running_status: String,
}

impl FcInitiator {
    pub fn is_online(&self) -> bool {
        self.running_status == FC_INITIATOR_ONLINE
    }
}

/// Host link entry reporting a reachable FC target port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostLink {
    #[serde(rename = "INITIATOR_PORT_WWN")]
    pub initiator_port_wwn: String,
    #[serde(rename = "TARGET_PORT_WWN")]
    pub target_port_wwn: String,
}

/// Raw iSCSI target port entry, `ID` is `"<n>+<iqn>,t,<tpgt>"`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IscsiTargetPortEntry {
    #[serde(rename = "ID")]
    pub id: String,
}

/// Parsed iSCSI target portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiPortal {
    pub iqn: String,
    pub ip: String,
}

impl IscsiTargetPortEntry {
    /// Split the port id into target IQN and portal IP
    pub fn portal(&self) -> Option<IscsiPortal> {
        let head = self.id.split(',').next()?;
        let iqn = head.split_once('+')?.1;
        let ip = iqn.rsplit(':').next()?;
        if iqn.is_empty() || ip.is_empty() || ip == iqn {
            return None;
        }
        Some(IscsiPortal {
            iqn: iqn.to_string(),
            ip: ip.to_string(),
        })
    }
}

/// Result of a count query
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CountResult {
    #[serde(rename = "COUNT")]
    pub count: String,
}

// =============================================================================
// Array Identity
// =============================================================================

/// Identity of the array itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "WWN")]
    pub wwn: String,
}

/// A peer array registered on this array
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteDevice {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "WWN")]
    pub wwn: String,
    #[serde(rename = "ARRAYTYPE")]
    pub array_type: String,
    #[serde(rename = "HEALTHSTATUS")]
    pub health_status: String,
    #[serde(rename = "RUNNINGSTATUS")]
    pub running_status: String,
}

impl RemoteDevice {
    /// Whether replication pairs can be created against this device
    pub fn is_usable_for_replication(&self) -> bool {
        self.array_type == REMOTE_DEVICE_REPLICATION
            && self.health_status == REMOTE_DEVICE_HEALTH_NORMAL
            && self.running_status == REMOTE_DEVICE_LINK_UP
    }
}

// =============================================================================
// Replication Pair
// =============================================================================

/// Running status of a replication pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunningStatus {
    Normal,
    InitialSync,
    Synchronizing,
    Synced,
    Split,
    Interrupted,
    Invalid,
    Connecting,
    Other,
}

impl RunningStatus {
    pub fn code(self) -> &'static str {
        match self {
            RunningStatus::Normal => "1",
            RunningStatus::InitialSync => "21",
            RunningStatus::Synchronizing => "23",
            RunningStatus::Synced => "24",
            RunningStatus::Split => "26",
            RunningStatus::Interrupted => "34",
            RunningStatus::Invalid => "35",
            RunningStatus::Connecting => "110",
            RunningStatus::Other => "",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "1" => RunningStatus::Normal,
            "21" => RunningStatus::InitialSync,
            "23" => RunningStatus::Synchronizing,
            "24" => RunningStatus::Synced,
            "26" => RunningStatus::Split,
            "34" => RunningStatus::Interrupted,
            "35" => RunningStatus::Invalid,
            "110" => RunningStatus::Connecting,
            _ => RunningStatus::Other,
        }
    }
}

impl std::fmt::Display for RunningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunningStatus::Normal => "normal",
            RunningStatus::InitialSync => "initial-sync",
            RunningStatus::Synchronizing => "sync",
            RunningStatus::Synced => "synced",
            RunningStatus::Split => "split",
            RunningStatus::Interrupted => "interrupted",
            RunningStatus::Invalid => "invalid",
            RunningStatus::Connecting => "connecting",
            RunningStatus::Other => "other",
        };
        f.write_str(name)
    }
}

/// Health status of a replication pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    Normal,
    Fault,
    Other,
}

impl HealthStatus {
    pub fn code(self) -> &'static str {
        match self {
            HealthStatus::Normal => "1",
            HealthStatus::Fault => "2",
            HealthStatus::Other => "",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "1" => HealthStatus::Normal,
            "2" => HealthStatus::Fault,
            _ => HealthStatus::Other,
        }
    }
}

/// Data access mode of the secondary LUN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecondaryAccess {
    ReadOnly,
    ReadWrite,
}

impl SecondaryAccess {
    pub fn code(self) -> &'static str {
        match self {
            SecondaryAccess::ReadOnly => "2",
            SecondaryAccess::ReadWrite => "3",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "2" => Some(SecondaryAccess::ReadOnly),
            "3" => Some(SecondaryAccess::ReadWrite),
            _ => None,
        }
    }
}

/// Replication mode codes
pub const REPLICATION_MODE_SYNC: &str = "1";
pub const REPLICATION_MODE_ASYNC: &str = "2";

/// A replication pair as seen from one array
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationPair {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "LOCALRESID")]
    pub local_res_id: String,
    #[serde(rename = "REMOTERESID")]
    pub remote_res_id: String,
    #[serde(rename = "REPLICATIONMODEL")]
    pub replication_mode: String,
    #[serde(rename = "RUNNINGSTATUS")]
    pub running_status: String,
    #[serde(rename = "HEALTHSTATUS")]
    pub health_status: String,
    #[serde(rename = "ISPRIMARY")]
    pub is_primary: String,
    #[serde(rename = "SECRESACCESS")]
    pub secondary_access: String,
}

impl ReplicationPair {
    pub fn running(&self) -> RunningStatus {
        RunningStatus::from_code(&self.running_status)
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_code(&self.health_status)
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.eq_ignore_ascii_case("true")
    }

    pub fn secondary_access(&self) -> Option<SecondaryAccess> {
        SecondaryAccess::from_code(&self.secondary_access)
    }

    pub fn is_sync_mode(&self) -> bool {
        self.replication_mode == REPLICATION_MODE_SYNC
    }

    /// Running status is one of `accepted`
    pub fn is_running(&self, accepted: &[RunningStatus]) -> bool {
        accepted.contains(&self.running())
    }

    /// Health status is one of `accepted`
    pub fn is_health(&self, accepted: &[HealthStatus]) -> bool {
        accepted.contains(&self.health())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iscsi_portal_parse() {
        let entry = IscsiTargetPortEntry {
            id: "0+iqn.2006-08.com.huawei:oceanstor:2100a0b1c2:192.168.10.21,t,0x01".into(),
        };
        let portal = entry.portal().unwrap();
        assert_eq!(portal.ip, "192.168.10.21");
        assert_eq!(portal.iqn, "iqn.2006-08.com.huawei:oceanstor:2100a0b1c2:192.168.10.21");

        let broken = IscsiTargetPortEntry { id: "garbage".into() };
        assert!(broken.portal().is_none());
    }

    #[test]
    fn test_pair_status_view() {
        let pair: ReplicationPair = serde_json::from_value(serde_json::json!({
            "ID": "9",
            "RUNNINGSTATUS": "23",
            "HEALTHSTATUS": "1",
            "ISPRIMARY": "TRUE",
            "SECRESACCESS": "2",
            "REPLICATIONMODEL": "1"
        }))
        .unwrap();

        assert_eq!(pair.running(), RunningStatus::Synchronizing);
        assert!(pair.is_primary());
        assert!(pair.is_sync_mode());
        assert_eq!(pair.secondary_access(), Some(SecondaryAccess::ReadOnly));
        assert!(pair.is_running(&[RunningStatus::Normal, RunningStatus::Synchronizing]));
        assert!(!pair.is_health(&[HealthStatus::Fault]));
    }

    #[test]
    fn test_running_status_codes_roundtrip() {
        for status in [
            RunningStatus::Normal,
            RunningStatus::Split,
            RunningStatus::Interrupted,
            RunningStatus::Connecting,
        ] {
            assert_eq!(RunningStatus::from_code(status.code()), status);
        }
        assert_eq!(RunningStatus::from_code("999"), RunningStatus::Other);
    }

    #[test]
    fn test_capacity_conversion() {
        assert_eq!(gb_to_sectors(10), 20_971_520);
        assert_eq!(sectors_to_gb(20_971_520), 10);
        assert_eq!(sectors_to_gb(20_971_521), 11);
        assert_eq!(lun_copy_member("7"), "INVALID;7;INVALID;INVALID;INVALID");
    }

    #[test]
    fn test_remote_device_usability() {
        let mut device = RemoteDevice {
            id: "0".into(),
            name: "site-b".into(),
            wwn: "2100b".into(),
            array_type: REMOTE_DEVICE_REPLICATION.into(),
            health_status: REMOTE_DEVICE_HEALTH_NORMAL.into(),
            running_status: REMOTE_DEVICE_LINK_UP.into(),
        };
        assert!(device.is_usable_for_replication());

        device.running_status = "11".into();
        assert!(!device.is_usable_for_replication());
    }
}
