//! In-process simulated array
//!
//! Implements the array's REST namespace over in-memory state and enforces
//! the controller's integrity rules, so that orchestration ordering bugs
//! surface as the same error codes a real controller returns. Two arrays
//! created with [`SimulatedArray::pair`] share a replication link and see
//! the same replication pairs, each from its own side.

use crate::array::model::{
    codes, gb_to_sectors, lun_copy_member, object_type, FcInitiator, Host, HostAssociatedLun,
    HostLink, IscsiInitiator, IscsiTargetPortEntry, Lun, LunCopy, LunCopyStatus, NamedObject,
    RemoteDevice, ReplicationPair, RunningStatus, SecondaryAccess, Snapshot, StoragePool,
    SystemInfo, FC_INITIATOR_OFFLINE, FC_INITIATOR_ONLINE, LUN_HEALTH_FAULT, LUN_HEALTH_NORMAL,
    LUN_STATUS_INITIALIZING, LUN_STATUS_READY, REMOTE_DEVICE_HEALTH_NORMAL, REMOTE_DEVICE_LINK_UP,
    REMOTE_DEVICE_REPLICATION, REPLICATION_MODE_SYNC,
};
use crate::domain::ports::ArrayGateway;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Status reads a pair spends synchronizing before it reports normal
const DEFAULT_SYNC_READS: u32 = 2;
/// Status reads a started LUN copy spends copying before it completes
const DEFAULT_COPY_READS: u32 = 2;
/// Status reads a newly created LUN spends formatting
const DEFAULT_NEW_LUN_READS: u32 = 1;
/// Size of LUNs added through the test hooks
const DEFAULT_LUN_GB: u64 = 10;

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone)]
struct HostRecord {
    name: String,
    os_type: String,
    ip: String,
    description: String,
}

#[derive(Debug, Clone, Default)]
struct GroupRecord {
    name: String,
    members: BTreeSet<String>,
    snapshots: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
struct ViewRecord {
    name: String,
    host_group: Option<String>,
    lun_group: Option<String>,
}

#[derive(Debug, Clone)]
struct LunRecord {
    name: String,
    wwn: String,
    capacity: u64,
    pool: String,
    /// Status reads left before an initializing LUN turns ready
    reads_until_ready: u32,
}

#[derive(Debug, Clone)]
struct SnapshotRecord {
    name: String,
    lun: String,
    capacity: u64,
}

#[derive(Debug, Clone)]
struct PoolRecord {
    name: String,
    free: u64,
}

#[derive(Debug, Clone)]
struct CopyRecord {
    name: String,
    source: String,
    target: String,
    status: LunCopyStatus,
    healthy: bool,
    reads_left: u32,
    fails: bool,
}

#[derive(Debug, Clone, Default)]
struct FcRecord {
    parent: Option<String>,
    online: bool,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    method: String,
    path_prefix: String,
    code: i64,
}

#[derive(Debug)]
struct ArrayState {
    next_id: u64,
    hosts: BTreeMap<String, HostRecord>,
    host_groups: BTreeMap<String, GroupRecord>,
    lun_groups: BTreeMap<String, GroupRecord>,
    views: BTreeMap<String, ViewRecord>,
    luns: BTreeMap<String, LunRecord>,
    snapshots: BTreeMap<String, SnapshotRecord>,
    pools: BTreeMap<String, PoolRecord>,
    lun_copies: BTreeMap<String, CopyRecord>,
    copy_reads: u32,
    new_lun_reads: u32,
    fail_next_copy: bool,
    iscsi_initiators: BTreeMap<String, Option<String>>,
    fc_initiators: BTreeMap<String, FcRecord>,
    fc_links: BTreeMap<String, BTreeSet<String>>,
    iscsi_ports: Vec<String>,
    remote_devices: Vec<RemoteDevice>,
    host_lun_ids: BTreeMap<String, BTreeMap<String, u32>>,
    failures: Vec<InjectedFailure>,
    requests: u64,
}

impl Default for ArrayState {
    fn default() -> Self {
        Self {
            next_id: 0,
            hosts: BTreeMap::new(),
            host_groups: BTreeMap::new(),
            lun_groups: BTreeMap::new(),
            views: BTreeMap::new(),
            luns: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            pools: BTreeMap::new(),
            lun_copies: BTreeMap::new(),
            copy_reads: DEFAULT_COPY_READS,
            new_lun_reads: DEFAULT_NEW_LUN_READS,
            fail_next_copy: false,
            iscsi_initiators: BTreeMap::new(),
            fc_initiators: BTreeMap::new(),
            fc_links: BTreeMap::new(),
            iscsi_ports: Vec::new(),
            remote_devices: Vec::new(),
            host_lun_ids: BTreeMap::new(),
            failures: Vec::new(),
            requests: 0,
        }
    }
}

impl ArrayState {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn host_initiator_count(&self, host_id: &str) -> usize {
        let iscsi = self
            .iscsi_initiators
            .values()
            .filter(|p| p.as_deref() == Some(host_id))
            .count();
        let fc = self
            .fc_initiators
            .values()
            .filter(|r| r.parent.as_deref() == Some(host_id))
            .count();
        iscsi + fc
    }

    fn host_group_ids_of(&self, host_id: &str) -> Vec<String> {
        self.host_groups
            .iter()
            .filter(|(_, g)| g.members.contains(host_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// LUNs a host can see through its mapping views
    fn visible_luns(&self, host_id: &str) -> BTreeSet<String> {
        let groups: BTreeSet<String> = self.host_group_ids_of(host_id).into_iter().collect();
        self.views
            .values()
            .filter(|v| v.host_group.as_ref().map_or(false, |hg| groups.contains(hg)))
            .filter_map(|v| v.lun_group.as_ref())
            .filter_map(|lg| self.lun_groups.get(lg))
            .flat_map(|lg| lg.members.iter().cloned())
            .collect()
    }

    /// Host LUN numbers, smallest free integer from 1 for newly visible LUNs
    fn refresh_host_lun_ids(&mut self, host_id: &str) -> BTreeMap<String, u32> {
        let visible = self.visible_luns(host_id);
        let ids = self.host_lun_ids.entry(host_id.to_string()).or_default();
        ids.retain(|lun, _| visible.contains(lun));
        for lun in visible {
            if ids.contains_key(&lun) {
                continue;
            }
            let used: BTreeSet<u32> = ids.values().copied().collect();
            let next = (1..).find(|n| !used.contains(n)).unwrap_or(1);
            ids.insert(lun, next);
        }
        ids.clone()
    }
}

#[derive(Debug, Clone)]
struct PairRecord {
    /// LUN id on each side, indexed by side
    luns: [String; 2],
    mode: String,
    primary_side: usize,
    running: RunningStatus,
    secondary_access: SecondaryAccess,
    reads_until_synced: u32,
}

/// Replication state shared by the two arrays of a pair
#[derive(Debug)]
struct ReplicationLink {
    next_id: u64,
    sync_reads: u32,
    pairs: BTreeMap<String, PairRecord>,
}

impl Default for ReplicationLink {
    fn default() -> Self {
        Self {
            next_id: 0,
            sync_reads: DEFAULT_SYNC_READS,
            pairs: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Request Parsing
// =============================================================================

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

struct Request<'a> {
    method: &'a str,
    segments: Vec<String>,
    query: BTreeMap<String, String>,
    body: Value,
}

impl<'a> Request<'a> {
    fn parse(method: &'a str, path: &str, body: Value) -> Self {
        let (route, query) = path.split_once('?').unwrap_or((path, ""));
        let segments = route
            .split('/')
            .filter(|s| !s.is_empty())
            .map(percent_decode)
            .collect();
        let query = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), percent_decode(v)))
            .collect();
        Self {
            method,
            segments,
            query,
            body,
        }
    }

    fn query(&self, key: &str) -> &str {
        self.query.get(key).map(String::as_str).unwrap_or("")
    }

    fn name_filter(&self) -> Option<&str> {
        self.query.get("filter").and_then(|f| f.strip_prefix("NAME::"))
    }

    fn field(&self, key: &str) -> String {
        match &self.body[key] {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => String::new(),
        }
    }
}

fn not_found(what: &str, id: &str) -> Error {
    Error::remote(codes::OBJECT_NOT_FOUND, format!("{} {} does not exist", what, id))
}

fn in_use(what: &str, id: &str) -> Error {
    Error::remote(codes::OBJECT_IN_USE, format!("{} {} is in use", what, id))
}

fn invalid_pair_state(id: &str, status: RunningStatus) -> Error {
    Error::remote(
        codes::INVALID_PAIR_STATE,
        format!("operation not allowed on pair {} in state {}", id, status),
    )
}

fn parameter_error(desc: impl Into<String>) -> Error {
    Error::remote(codes::PARAMETER_ERROR, desc)
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn named(id: &str, record_name: &str) -> NamedObject {
    NamedObject {
        id: id.to_string(),
        name: record_name.to_string(),
    }
}

fn matches_filter(name: &str, filter: Option<&str>) -> bool {
    filter.map_or(true, |f| name.contains(f))
}

// =============================================================================
// Simulated Array
// =============================================================================

/// In-memory array controller
pub struct SimulatedArray {
    name: String,
    wwn: String,
    side: usize,
    state: Mutex<ArrayState>,
    link: Arc<Mutex<ReplicationLink>>,
}

impl std::fmt::Debug for SimulatedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedArray")
            .field("name", &self.name)
            .field("wwn", &self.wwn)
            .finish()
    }
}

impl SimulatedArray {
    fn with_link(name: &str, side: usize, link: Arc<Mutex<ReplicationLink>>) -> Self {
        Self {
            name: name.to_string(),
            wwn: format!("2100{:012x}", simple_hash(name)),
            side,
            state: Mutex::new(ArrayState::default()),
            link,
        }
    }

    /// A standalone array with no replication peer
    pub fn new(name: &str) -> Self {
        Self::with_link(name, 0, Arc::new(Mutex::new(ReplicationLink::default())))
    }

    /// Two arrays registered as each other's replication peer
    pub fn pair(local_name: &str, remote_name: &str) -> (Arc<Self>, Arc<Self>) {
        let link = Arc::new(Mutex::new(ReplicationLink::default()));
        let local = Self::with_link(local_name, 0, link.clone());
        let remote = Self::with_link(remote_name, 1, link);
        local.register_remote_device(&remote.name, &remote.wwn);
        remote.register_remote_device(&local.name, &local.wwn);
        (Arc::new(local), Arc::new(remote))
    }

    /// World wide name of this array
    pub fn wwn(&self) -> &str {
        &self.wwn
    }

    // =========================================================================
    // Test Hooks
    // =========================================================================

    /// Fail the next request matching `method` and `path_prefix` with `code`
    pub fn inject_failure(&self, method: &str, path_prefix: &str, code: i64) {
        self.state.lock().failures.push(InjectedFailure {
            method: method.to_uppercase(),
            path_prefix: path_prefix.to_string(),
            code,
        });
    }

    /// Requests served so far, failed ones included
    pub fn request_count(&self) -> u64 {
        self.state.lock().requests
    }

    fn lun_wwn(&self, lun_id: &str) -> String {
        format!("6{:031x}", simple_hash(&format!("{}/{}", self.name, lun_id)))
    }

    /// Create a ready LUN
    pub fn add_lun(&self, lun_id: &str, name: &str) {
        let wwn = self.lun_wwn(lun_id);
        self.state.lock().luns.insert(
            lun_id.to_string(),
            LunRecord {
                name: name.to_string(),
                wwn,
                capacity: gb_to_sectors(DEFAULT_LUN_GB),
                pool: String::new(),
                reads_until_ready: 0,
            },
        );
    }

    /// Ids of every LUN on the array
    pub fn lun_ids(&self) -> Vec<String> {
        self.state.lock().luns.keys().cloned().collect()
    }

    /// Status reads a LUN created through the API spends formatting
    pub fn set_new_lun_init_reads(&self, reads: u32) {
        self.state.lock().new_lun_reads = reads;
    }

    /// Create a storage pool with `free_gb` of free space
    pub fn add_storage_pool(&self, pool_id: &str, name: &str, free_gb: u64) {
        self.state.lock().pools.insert(
            pool_id.to_string(),
            PoolRecord {
                name: name.to_string(),
                free: gb_to_sectors(free_gb),
            },
        );
    }

    /// Take a snapshot of an existing LUN
    pub fn add_snapshot(&self, snapshot_id: &str, name: &str, lun_id: &str) {
        let mut state = self.state.lock();
        let capacity = state.luns.get(lun_id).map_or(0, |l| l.capacity);
        state.snapshots.insert(
            snapshot_id.to_string(),
            SnapshotRecord {
                name: name.to_string(),
                lun: lun_id.to_string(),
                capacity,
            },
        );
    }

    /// Status reads each started LUN copy takes before it completes
    pub fn set_copy_reads(&self, reads: u32) {
        self.state.lock().copy_reads = reads;
    }

    /// Make the next started LUN copy stop with a fault
    pub fn fail_next_lun_copy(&self) {
        self.state.lock().fail_next_copy = true;
    }

    /// Ids of the LUN copy tasks still defined
    pub fn lun_copy_ids(&self) -> Vec<String> {
        self.state.lock().lun_copies.keys().cloned().collect()
    }

    /// Keep a LUN initializing for the next `reads` status reads
    pub fn set_lun_initializing(&self, lun_id: &str, reads: u32) {
        if let Some(lun) = self.state.lock().luns.get_mut(lun_id) {
            lun.reads_until_ready = reads;
        }
    }

    /// Register or update an FC initiator the array has seen
    pub fn set_fc_initiator(&self, wwn: &str, online: bool) {
        let mut state = self.state.lock();
        state.fc_initiators.entry(wwn.to_string()).or_default().online = online;
    }

    /// Record that an FC initiator can reach a target port
    pub fn add_fc_target_port(&self, initiator_wwn: &str, target_wwn: &str) {
        self.state
            .lock()
            .fc_links
            .entry(initiator_wwn.to_string())
            .or_default()
            .insert(target_wwn.to_string());
    }

    /// Expose an iSCSI target portal
    pub fn add_iscsi_target_port(&self, target_iqn: &str, ip: &str) {
        let mut state = self.state.lock();
        let index = state.iscsi_ports.len();
        state
            .iscsi_ports
            .push(format!("{}+{}:{},t,0x{:02x}", index, target_iqn, ip, index + 1));
    }

    /// Attach a snapshot to a LUN group, found by name
    pub fn add_snapshot_to_lun_group(&self, lun_group_name: &str, snapshot_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.lun_groups.values_mut().find(|g| g.name == lun_group_name) {
            Some(group) => group.snapshots.insert(snapshot_id.to_string()),
            None => false,
        }
    }

    /// Status reads each sync takes before the pair reports normal
    pub fn set_sync_reads(&self, reads: u32) {
        self.link.lock().sync_reads = reads;
    }

    pub fn host_names(&self) -> Vec<String> {
        self.state.lock().hosts.values().map(|h| h.name.clone()).collect()
    }

    pub fn host_group_names(&self) -> Vec<String> {
        self.state.lock().host_groups.values().map(|g| g.name.clone()).collect()
    }

    pub fn lun_group_names(&self) -> Vec<String> {
        self.state.lock().lun_groups.values().map(|g| g.name.clone()).collect()
    }

    pub fn mapping_view_names(&self) -> Vec<String> {
        self.state.lock().views.values().map(|v| v.name.clone()).collect()
    }

    /// LUN ids in the LUN group with this name
    pub fn lun_group_members(&self, lun_group_name: &str) -> Vec<String> {
        self.state
            .lock()
            .lun_groups
            .values()
            .find(|g| g.name == lun_group_name)
            .map(|g| g.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Id of the host an FC initiator is linked to
    pub fn fc_initiator_owner(&self, wwn: &str) -> Option<String> {
        self.state
            .lock()
            .fc_initiators
            .get(wwn)
            .and_then(|r| r.parent.clone())
    }

    /// Id of the host an iSCSI initiator is linked to
    pub fn iscsi_initiator_owner(&self, iqn: &str) -> Option<String> {
        self.state.lock().iscsi_initiators.get(iqn).cloned().flatten()
    }

    /// Ids of the replication pairs on the link
    pub fn pair_ids(&self) -> Vec<String> {
        self.link.lock().pairs.keys().cloned().collect()
    }

    fn register_remote_device(&self, name: &str, wwn: &str) {
        let mut state = self.state.lock();
        let id = state.remote_devices.len().to_string();
        state.remote_devices.push(RemoteDevice {
            id,
            name: name.to_string(),
            wwn: wwn.to_string(),
            array_type: REMOTE_DEVICE_REPLICATION.to_string(),
            health_status: REMOTE_DEVICE_HEALTH_NORMAL.to_string(),
            running_status: REMOTE_DEVICE_LINK_UP.to_string(),
        });
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn handle(&self, method: &str, path: &str, body: Value) -> Result<Value> {
        let mut state = self.state.lock();
        state.requests += 1;
        debug!(array = %self.name, "{} {}", method, path);

        if let Some(pos) = state
            .failures
            .iter()
            .position(|f| f.method == method && path.starts_with(&f.path_prefix))
        {
            let failure = state.failures.remove(pos);
            return Err(Error::remote(failure.code, format!("injected failure on {}", path)));
        }

        let req = Request::parse(method, path, body);
        let segments: Vec<&str> = req.segments.iter().map(String::as_str).collect();
        match (req.method, segments.as_slice()) {
            ("GET", ["system"]) => to_value(SystemInfo {
                id: self.wwn.clone(),
                name: self.name.clone(),
                wwn: self.wwn.clone(),
            }),
            ("GET", ["remote_device"]) => to_value(&state.remote_devices),
            ("DELETE", ["sessions"]) => Ok(Value::Null),

            ("GET", ["host"]) => Self::list_hosts(&state, &req),
            ("POST", ["host"]) => Self::create_host(&mut state, &req),
            ("GET", ["host", "associate"]) => Self::hosts_in_group(&state, &req),
            ("DELETE", ["host", "associate"]) => Self::remove_host_from_group(&mut state, &req),
            ("DELETE", ["host", id]) => Self::delete_host(&mut state, id),

            ("GET", ["hostgroup"]) => to_value(Self::list_groups(&state.host_groups, &req)),
            ("POST", ["hostgroup"]) => Self::create_group(&mut state, &req, GroupKind::Host),
            ("DELETE", ["hostgroup", id]) => Self::delete_host_group(&mut state, id),
            ("GET", ["hostgroup", "associate"]) => Self::groups_of_host(&state, &req),
            ("POST", ["hostgroup", "associate"]) => Self::add_host_to_group(&mut state, &req),

            ("GET", ["lungroup"]) => to_value(Self::list_groups(&state.lun_groups, &req)),
            ("POST", ["lungroup"]) => Self::create_group(&mut state, &req, GroupKind::Lun),
            ("POST", ["lungroup", "associate"]) => Self::add_lun_to_group(&mut state, &req),
            ("DELETE", ["lungroup", "associate"]) => Self::remove_lun_from_group(&mut state, &req),
            ("DELETE", ["lungroup", id]) => Self::delete_lun_group(&mut state, id),

            ("GET", ["lun"]) => Self::list_luns(&state, &req),
            ("POST", ["lun"]) => self.create_lun(&mut state, &req),
            ("GET", ["lun", "associate"]) => Self::lun_associations(&mut state, &req),
            ("GET", ["lun", "count"]) => Self::lun_count(&state, &req),
            ("GET", ["snapshot", "count"]) => Self::snapshot_count(&state, &req),
            ("GET", ["lun", id]) => Self::get_lun(&mut state, id),
            ("DELETE", ["lun", id]) => self.delete_lun(&mut state, id),

            ("GET", ["snapshot"]) => Self::list_snapshots(&state, &req),
            ("GET", ["storagepool"]) => Self::list_pools(&state, &req),

            ("POST", ["luncopy"]) => Self::create_lun_copy(&mut state, &req),
            ("PUT", ["LUNCOPY", "start"]) => Self::start_lun_copy(&mut state, &req),
            ("GET", ["LUNCOPY", id]) => Self::get_lun_copy(&mut state, id),
            ("DELETE", ["LUNCOPY", id]) => Self::delete_lun_copy(&mut state, id),

            ("GET", ["mappingview"]) => Self::list_views(&state, &req),
            ("POST", ["mappingview"]) => Self::create_group(&mut state, &req, GroupKind::View),
            ("DELETE", ["mappingview", id]) => Self::delete_view(&mut state, id),
            ("GET", ["mappingview", "associate"]) => Self::views_containing(&state, &req),
            ("PUT", ["mappingview", "create_associate"]) => Self::associate_view(&mut state, &req),
            ("PUT", ["mappingview", "REMOVE_ASSOCIATE"]) => Self::dissociate_view(&mut state, &req),

            ("GET", ["iscsi_initiator"]) => Self::list_iscsi_initiators(&state, &req),
            ("POST", ["iscsi_initiator"]) => Self::create_iscsi_initiator(&mut state, &req),
            ("PUT", ["iscsi_initiator", "remove_iscsi_from_host"]) => {
                Self::unlink_iscsi_initiator(&mut state, &req)
            }
            ("GET", ["iscsi_initiator", iqn]) => Self::get_iscsi_initiator(&state, iqn),
            ("PUT", ["iscsi_initiator", iqn]) => Self::link_iscsi_initiator(&mut state, iqn, &req),
            ("GET", ["iscsi_tgt_port"]) => to_value(
                state
                    .iscsi_ports
                    .iter()
                    .map(|id| IscsiTargetPortEntry { id: id.clone() })
                    .collect::<Vec<_>>(),
            ),

            ("GET", ["fc_initiator"]) => Self::list_fc_initiators(&state, &req),
            ("PUT", ["fc_initiator", "remove_fc_from_host"]) => Self::unlink_fc_initiator(&mut state, &req),
            ("PUT", ["fc_initiator", wwn]) => Self::link_fc_initiator(&mut state, wwn, &req),
            ("GET", ["host_link"]) => Self::host_links(&state, &req),

            ("POST", ["REPLICATIONPAIR"]) => self.create_pair(&state, &req),
            ("PUT", ["REPLICATIONPAIR", command @ ("split" | "sync" | "switch")]) => {
                self.pair_command(command, &req)
            }
            ("GET", ["REPLICATIONPAIR", id]) => self.get_pair(id),
            ("PUT", ["REPLICATIONPAIR", id]) => self.set_secondary_access(id, &req),
            ("DELETE", ["REPLICATIONPAIR", id]) => self.delete_pair(id),

            _ => Err(parameter_error(format!("unsupported request {} {}", method, path))),
        }
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    fn host_view(id: &str, record: &HostRecord) -> Host {
        Host {
            id: id.to_string(),
            name: record.name.clone(),
            os_type: record.os_type.clone(),
            ip: record.ip.clone(),
            description: record.description.clone(),
        }
    }

    fn list_hosts(state: &ArrayState, req: &Request) -> Result<Value> {
        let filter = req.name_filter();
        to_value(
            state
                .hosts
                .iter()
                .filter(|(_, h)| matches_filter(&h.name, filter))
                .map(|(id, h)| Self::host_view(id, h))
                .collect::<Vec<_>>(),
        )
    }

    fn create_host(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let name = req.field("NAME");
        if name.is_empty() {
            return Err(parameter_error("host name is required"));
        }
        if state.hosts.values().any(|h| h.name == name) {
            return Err(Error::remote(codes::OBJECT_NAME_ALREADY_EXISTS, format!("host {} exists", name)));
        }
        let id = state.allocate_id();
        let record = HostRecord {
            name,
            os_type: req.field("OPERATIONSYSTEM"),
            ip: req.field("IP"),
            description: req.field("DESCRIPTION"),
        };
        let view = Self::host_view(&id, &record);
        state.hosts.insert(id, record);
        to_value(view)
    }

    fn delete_host(state: &mut ArrayState, id: &str) -> Result<Value> {
        if !state.hosts.contains_key(id) {
            return Err(not_found("host", id));
        }
        if state.host_initiator_count(id) > 0 || !state.host_group_ids_of(id).is_empty() {
            return Err(in_use("host", id));
        }
        state.hosts.remove(id);
        state.host_lun_ids.remove(id);
        Ok(Value::Null)
    }

    fn hosts_in_group(state: &ArrayState, req: &Request) -> Result<Value> {
        if req.query("ASSOCIATEOBJTYPE") != object_type::HOST_GROUP {
            return Err(parameter_error("hosts can only be listed by host group"));
        }
        let group_id = req.query("ASSOCIATEOBJID");
        let group = state
            .host_groups
            .get(group_id)
            .ok_or_else(|| not_found("host group", group_id))?;
        to_value(
            group
                .members
                .iter()
                .filter_map(|id| state.hosts.get(id).map(|h| Self::host_view(id, h)))
                .collect::<Vec<_>>(),
        )
    }

    fn remove_host_from_group(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let group_id = req.query("ID");
        let host_id = req.query("ASSOCIATEOBJID");
        let group = state
            .host_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("host group", group_id))?;
        if !group.members.remove(host_id) {
            return Err(not_found("host group member", host_id));
        }
        Ok(Value::Null)
    }

    // =========================================================================
    // Groups and Views
    // =========================================================================

    fn list_groups(groups: &BTreeMap<String, GroupRecord>, req: &Request) -> Vec<NamedObject> {
        let filter = req.name_filter();
        groups
            .iter()
            .filter(|(_, g)| matches_filter(&g.name, filter))
            .map(|(id, g)| named(id, &g.name))
            .collect()
    }

    fn create_group(state: &mut ArrayState, req: &Request, kind: GroupKind) -> Result<Value> {
        let name = req.field("NAME");
        if name.is_empty() {
            return Err(parameter_error("name is required"));
        }
        let taken = match kind {
            GroupKind::Host => state.host_groups.values().any(|g| g.name == name),
            GroupKind::Lun => state.lun_groups.values().any(|g| g.name == name),
            GroupKind::View => state.views.values().any(|v| v.name == name),
        };
        if taken {
            return Err(Error::remote(codes::OBJECT_NAME_ALREADY_EXISTS, format!("{} exists", name)));
        }
        let id = state.allocate_id();
        let object = named(&id, &name);
        match kind {
            GroupKind::Host => {
                state.host_groups.insert(id, GroupRecord { name, ..Default::default() });
            }
            GroupKind::Lun => {
                state.lun_groups.insert(id, GroupRecord { name, ..Default::default() });
            }
            GroupKind::View => {
                state.views.insert(id, ViewRecord { name, ..Default::default() });
            }
        }
        to_value(object)
    }

    fn delete_host_group(state: &mut ArrayState, id: &str) -> Result<Value> {
        let group = state.host_groups.get(id).ok_or_else(|| not_found("host group", id))?;
        let in_view = state.views.values().any(|v| v.host_group.as_deref() == Some(id));
        if !group.members.is_empty() || in_view {
            return Err(in_use("host group", id));
        }
        state.host_groups.remove(id);
        Ok(Value::Null)
    }

    fn groups_of_host(state: &ArrayState, req: &Request) -> Result<Value> {
        if req.query("ASSOCIATEOBJTYPE") != object_type::HOST {
            return Err(parameter_error("host groups can only be listed by host"));
        }
        let host_id = req.query("ASSOCIATEOBJID");
        to_value(
            state
                .host_groups
                .iter()
                .filter(|(_, g)| g.members.contains(host_id))
                .map(|(id, g)| named(id, &g.name))
                .collect::<Vec<_>>(),
        )
    }

    fn add_host_to_group(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let group_id = req.field("ID");
        let host_id = req.field("ASSOCIATEOBJID");
        if !state.hosts.contains_key(&host_id) {
            return Err(not_found("host", &host_id));
        }
        let group = state
            .host_groups
            .get_mut(&group_id)
            .ok_or_else(|| not_found("host group", &group_id))?;
        if !group.members.insert(host_id.clone()) {
            return Err(Error::remote(
                codes::OBJECT_ALREADY_ASSOCIATED,
                format!("host {} already in host group {}", host_id, group_id),
            ));
        }
        Ok(Value::Null)
    }

    fn delete_lun_group(state: &mut ArrayState, id: &str) -> Result<Value> {
        let group = state.lun_groups.get(id).ok_or_else(|| not_found("lun group", id))?;
        let in_view = state.views.values().any(|v| v.lun_group.as_deref() == Some(id));
        if !group.members.is_empty() || !group.snapshots.is_empty() || in_view {
            return Err(in_use("lun group", id));
        }
        state.lun_groups.remove(id);
        Ok(Value::Null)
    }

    fn add_lun_to_group(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let group_id = req.field("ID");
        let lun_id = req.field("ASSOCIATEOBJID");
        if !state.luns.contains_key(&lun_id) {
            return Err(not_found("lun", &lun_id));
        }
        let group = state
            .lun_groups
            .get_mut(&group_id)
            .ok_or_else(|| not_found("lun group", &group_id))?;
        if !group.members.insert(lun_id.clone()) {
            return Err(Error::remote(
                codes::OBJECT_ALREADY_ASSOCIATED,
                format!("lun {} already in lun group {}", lun_id, group_id),
            ));
        }
        Ok(Value::Null)
    }

    fn remove_lun_from_group(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let group_id = req.query("ID");
        let lun_id = req.query("ASSOCIATEOBJID");
        let group = state
            .lun_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("lun group", group_id))?;
        if !group.members.remove(lun_id) {
            return Err(not_found("lun group member", lun_id));
        }
        Ok(Value::Null)
    }

    fn lun_associations(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let object_id = req.query("ASSOCIATEOBJID").to_string();
        match req.query("ASSOCIATEOBJTYPE") {
            t if t == object_type::HOST => {
                if !state.hosts.contains_key(&object_id) {
                    return Err(not_found("host", &object_id));
                }
                let ids = state.refresh_host_lun_ids(&object_id);
                to_value(
                    ids.into_iter()
                        .map(|(lun, host_lun_id)| HostAssociatedLun {
                            id: lun,
                            associate_metadata: json!({ "HostLUNID": host_lun_id }).to_string(),
                        })
                        .collect::<Vec<_>>(),
                )
            }
            t if t == object_type::LUN_GROUP => {
                let group = state
                    .lun_groups
                    .get(&object_id)
                    .ok_or_else(|| not_found("lun group", &object_id))?;
                let luns: Vec<Lun> = group
                    .members
                    .iter()
                    .filter_map(|id| state.luns.get(id).map(|l| Self::lun_view(id, l)))
                    .collect();
                to_value(luns)
            }
            other => Err(parameter_error(format!("unsupported association type {}", other))),
        }
    }

    fn lun_group_for_count<'s>(state: &'s ArrayState, req: &Request) -> Result<&'s GroupRecord> {
        let group_id = req.query("ASSOCIATEOBJID");
        if req.query("ASSOCIATEOBJTYPE") != object_type::LUN_GROUP {
            return Err(parameter_error("counts are only kept per lun group"));
        }
        state
            .lun_groups
            .get(group_id)
            .ok_or_else(|| not_found("lun group", group_id))
    }

    fn lun_count(state: &ArrayState, req: &Request) -> Result<Value> {
        let group = Self::lun_group_for_count(state, req)?;
        Ok(json!({ "COUNT": group.members.len().to_string() }))
    }

    fn snapshot_count(state: &ArrayState, req: &Request) -> Result<Value> {
        let group = Self::lun_group_for_count(state, req)?;
        Ok(json!({ "COUNT": group.snapshots.len().to_string() }))
    }

    fn lun_view(id: &str, record: &LunRecord) -> Lun {
        let status = if record.reads_until_ready > 0 {
            LUN_STATUS_INITIALIZING
        } else {
            LUN_STATUS_READY
        };
        Lun {
            id: id.to_string(),
            name: record.name.clone(),
            running_status: status.to_string(),
            health_status: LUN_HEALTH_NORMAL.to_string(),
            wwn: record.wwn.clone(),
            capacity: record.capacity.to_string(),
        }
    }

    fn get_lun(state: &mut ArrayState, id: &str) -> Result<Value> {
        let record = state.luns.get_mut(id).ok_or_else(|| not_found("lun", id))?;
        let view = Self::lun_view(id, record);
        record.reads_until_ready = record.reads_until_ready.saturating_sub(1);
        to_value(view)
    }

    fn list_luns(state: &ArrayState, req: &Request) -> Result<Value> {
        let filter = req.name_filter();
        to_value(
            state
                .luns
                .iter()
                .filter(|(_, l)| matches_filter(&l.name, filter))
                .map(|(id, l)| Self::lun_view(id, l))
                .collect::<Vec<_>>(),
        )
    }

    fn create_lun(&self, state: &mut ArrayState, req: &Request) -> Result<Value> {
        let name = req.field("NAME");
        if name.is_empty() {
            return Err(parameter_error("lun name is required"));
        }
        if state.luns.values().any(|l| l.name == name) {
            return Err(Error::remote(codes::OBJECT_NAME_ALREADY_EXISTS, format!("lun {} exists", name)));
        }
        let capacity: u64 = req
            .field("CAPACITY")
            .parse()
            .map_err(|_| parameter_error("lun capacity must be a sector count"))?;
        if capacity == 0 {
            return Err(parameter_error("lun capacity must be positive"));
        }
        let pool_id = req.field("PARENTID");
        let pool = state
            .pools
            .get_mut(&pool_id)
            .ok_or_else(|| not_found("storage pool", &pool_id))?;
        if pool.free < capacity {
            return Err(parameter_error(format!("storage pool {} is out of space", pool_id)));
        }
        pool.free -= capacity;

        let mut id = state.allocate_id();
        while state.luns.contains_key(&id) {
            id = state.allocate_id();
        }
        let record = LunRecord {
            name,
            wwn: self.lun_wwn(&id),
            capacity,
            pool: pool_id,
            reads_until_ready: state.new_lun_reads,
        };
        let view = Self::lun_view(&id, &record);
        state.luns.insert(id, record);
        to_value(view)
    }

    fn delete_lun(&self, state: &mut ArrayState, id: &str) -> Result<Value> {
        if !state.luns.contains_key(id) {
            return Err(not_found("lun", id));
        }
        let grouped = state.lun_groups.values().any(|g| g.members.contains(id));
        let copying = state
            .lun_copies
            .values()
            .any(|c| c.source == id || c.target == id);
        let paired = self.link.lock().pairs.values().any(|p| p.luns[self.side] == id);
        if grouped || copying || paired {
            return Err(in_use("lun", id));
        }
        if let Some(record) = state.luns.remove(id) {
            if let Some(pool) = state.pools.get_mut(&record.pool) {
                pool.free += record.capacity;
            }
        }
        Ok(Value::Null)
    }

    fn list_snapshots(state: &ArrayState, req: &Request) -> Result<Value> {
        let filter = req.name_filter();
        to_value(
            state
                .snapshots
                .iter()
                .filter(|(_, s)| matches_filter(&s.name, filter))
                .map(|(id, s)| Snapshot {
                    id: id.clone(),
                    name: s.name.clone(),
                    parent_id: s.lun.clone(),
                    user_capacity: s.capacity.to_string(),
                    health_status: LUN_HEALTH_NORMAL.to_string(),
                })
                .collect::<Vec<_>>(),
        )
    }

    fn list_pools(state: &ArrayState, req: &Request) -> Result<Value> {
        let filter = req.name_filter();
        to_value(
            state
                .pools
                .iter()
                .filter(|(_, p)| matches_filter(&p.name, filter))
                .map(|(id, p)| StoragePool {
                    id: id.clone(),
                    name: p.name.clone(),
                    health_status: LUN_HEALTH_NORMAL.to_string(),
                    user_free_capacity: p.free.to_string(),
                })
                .collect::<Vec<_>>(),
        )
    }

    // =========================================================================
    // LUN Copies
    // =========================================================================

    fn copy_view(id: &str, record: &CopyRecord, copy_reads: u32) -> LunCopy {
        let progress = match record.status {
            LunCopyStatus::Complete => 100,
            LunCopyStatus::Copying if copy_reads > 0 => {
                100 * (copy_reads - record.reads_left.min(copy_reads)) / (copy_reads + 1)
            }
            _ => 0,
        };
        LunCopy {
            id: id.to_string(),
            name: record.name.clone(),
            running_status: record.status.code().to_string(),
            health_status: if record.healthy {
                LUN_HEALTH_NORMAL
            } else {
                LUN_HEALTH_FAULT
            }
            .to_string(),
            progress: progress.to_string(),
        }
    }

    /// Object id named by a copy member descriptor
    fn copy_member_id(descriptor: &str) -> String {
        descriptor.split(';').nth(1).unwrap_or_default().to_string()
    }

    fn create_lun_copy(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let name = req.field("NAME");
        let source = Self::copy_member_id(&req.field("SOURCELUN"));
        let target = Self::copy_member_id(&req.field("TARGETLUN"));
        if name.is_empty() {
            return Err(parameter_error("lun copy name is required"));
        }
        if req.field("SOURCELUN") != lun_copy_member(&source) {
            return Err(parameter_error("malformed lun copy source"));
        }
        let source_capacity = match (state.snapshots.get(&source), state.luns.get(&source)) {
            (Some(snapshot), _) => snapshot.capacity,
            (None, Some(lun)) => lun.capacity,
            (None, None) => return Err(not_found("lun copy source", &source)),
        };
        let target_lun = state
            .luns
            .get(&target)
            .ok_or_else(|| not_found("lun", &target))?;
        if target_lun.capacity < source_capacity {
            return Err(parameter_error(format!(
                "target lun {} is smaller than source {}",
                target, source
            )));
        }
        if state.lun_copies.values().any(|c| c.target == target) {
            return Err(in_use("lun", &target));
        }

        let id = state.allocate_id();
        let record = CopyRecord {
            name,
            source,
            target,
            status: LunCopyStatus::Stopped,
            healthy: true,
            reads_left: 0,
            fails: false,
        };
        let view = Self::copy_view(&id, &record, state.copy_reads);
        state.lun_copies.insert(id, record);
        to_value(view)
    }

    fn start_lun_copy(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let id = req.field("ID");
        let copy_reads = state.copy_reads;
        let fails = std::mem::take(&mut state.fail_next_copy);
        let record = state
            .lun_copies
            .get_mut(&id)
            .ok_or_else(|| not_found("lun copy", &id))?;
        if matches!(record.status, LunCopyStatus::Queuing | LunCopyStatus::Copying) {
            return Err(in_use("lun copy", &id));
        }
        record.status = LunCopyStatus::Copying;
        record.healthy = true;
        record.reads_left = copy_reads;
        record.fails = fails;
        Ok(Value::Null)
    }

    fn get_lun_copy(state: &mut ArrayState, id: &str) -> Result<Value> {
        let copy_reads = state.copy_reads;
        let record = state
            .lun_copies
            .get_mut(id)
            .ok_or_else(|| not_found("lun copy", id))?;
        if record.status == LunCopyStatus::Copying {
            if record.reads_left == 0 {
                if record.fails {
                    record.status = LunCopyStatus::Stopped;
                    record.healthy = false;
                } else {
                    record.status = LunCopyStatus::Complete;
                }
            } else {
                record.reads_left -= 1;
            }
        }
        to_value(Self::copy_view(id, record, copy_reads))
    }

    fn delete_lun_copy(state: &mut ArrayState, id: &str) -> Result<Value> {
        let record = state.lun_copies.get(id).ok_or_else(|| not_found("lun copy", id))?;
        if matches!(record.status, LunCopyStatus::Queuing | LunCopyStatus::Copying) {
            return Err(in_use("lun copy", id));
        }
        state.lun_copies.remove(id);
        Ok(Value::Null)
    }

    fn list_views(state: &ArrayState, req: &Request) -> Result<Value> {
        let filter = req.name_filter();
        to_value(
            state
                .views
                .iter()
                .filter(|(_, v)| matches_filter(&v.name, filter))
                .map(|(id, v)| named(id, &v.name))
                .collect::<Vec<_>>(),
        )
    }

    fn delete_view(state: &mut ArrayState, id: &str) -> Result<Value> {
        let view = state.views.get(id).ok_or_else(|| not_found("mapping view", id))?;
        if view.host_group.is_some() || view.lun_group.is_some() {
            return Err(in_use("mapping view", id));
        }
        state.views.remove(id);
        Ok(Value::Null)
    }

    fn views_containing(state: &ArrayState, req: &Request) -> Result<Value> {
        let group_id = req.query("ASSOCIATEOBJID");
        let kind = req.query("ASSOCIATEOBJTYPE");
        let views: Vec<NamedObject> = state
            .views
            .iter()
            .filter(|(_, v)| {
                if kind == object_type::HOST_GROUP {
                    v.host_group.as_deref() == Some(group_id)
                } else if kind == object_type::LUN_GROUP {
                    v.lun_group.as_deref() == Some(group_id)
                } else {
                    false
                }
            })
            .map(|(id, v)| named(id, &v.name))
            .collect();
        to_value(views)
    }

    fn associate_view(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let view_id = req.field("ID");
        let kind = req.field("ASSOCIATEOBJTYPE");
        let group_id = req.field("ASSOCIATEOBJID");
        let exists = if kind == object_type::HOST_GROUP {
            state.host_groups.contains_key(&group_id)
        } else if kind == object_type::LUN_GROUP {
            state.lun_groups.contains_key(&group_id)
        } else {
            return Err(parameter_error(format!("unsupported association type {}", kind)));
        };
        if !exists {
            return Err(not_found("group", &group_id));
        }
        let view = state
            .views
            .get_mut(&view_id)
            .ok_or_else(|| not_found("mapping view", &view_id))?;
        let slot = if kind == object_type::HOST_GROUP {
            &mut view.host_group
        } else {
            &mut view.lun_group
        };
        match slot {
            Some(current) if *current == group_id => Err(Error::remote(
                codes::OBJECT_ALREADY_ASSOCIATED,
                format!("group {} already in mapping view {}", group_id, view_id),
            )),
            Some(current) => Err(parameter_error(format!(
                "mapping view {} already holds group {}",
                view_id, current
            ))),
            None => {
                *slot = Some(group_id);
                Ok(Value::Null)
            }
        }
    }

    fn dissociate_view(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let view_id = req.field("ID");
        let kind = req.field("ASSOCIATEOBJTYPE");
        let group_id = req.field("ASSOCIATEOBJID");
        let view = state
            .views
            .get_mut(&view_id)
            .ok_or_else(|| not_found("mapping view", &view_id))?;
        let slot = if kind == object_type::HOST_GROUP {
            &mut view.host_group
        } else if kind == object_type::LUN_GROUP {
            &mut view.lun_group
        } else {
            return Err(parameter_error(format!("unsupported association type {}", kind)));
        };
        if slot.as_deref() != Some(group_id.as_str()) {
            return Err(not_found("mapping view member", &group_id));
        }
        *slot = None;
        Ok(Value::Null)
    }

    // =========================================================================
    // Initiators
    // =========================================================================

    fn iscsi_view(iqn: &str, parent: &Option<String>) -> IscsiInitiator {
        IscsiInitiator {
            id: iqn.to_string(),
            parent_id: parent.clone().unwrap_or_default(),
            is_free: parent.is_none().to_string(),
        }
    }

    fn list_iscsi_initiators(state: &ArrayState, req: &Request) -> Result<Value> {
        let parent = req.query("PARENTID");
        to_value(
            state
                .iscsi_initiators
                .iter()
                .filter(|(_, p)| parent.is_empty() || p.as_deref() == Some(parent))
                .map(|(iqn, p)| Self::iscsi_view(iqn, p))
                .collect::<Vec<_>>(),
        )
    }

    fn get_iscsi_initiator(state: &ArrayState, iqn: &str) -> Result<Value> {
        let parent = state
            .iscsi_initiators
            .get(iqn)
            .ok_or_else(|| not_found("iscsi initiator", iqn))?;
        to_value(Self::iscsi_view(iqn, parent))
    }

    fn create_iscsi_initiator(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let iqn = req.field("ID");
        if iqn.is_empty() {
            return Err(parameter_error("initiator id is required"));
        }
        if state.iscsi_initiators.contains_key(&iqn) {
            return Err(Error::remote(codes::OBJECT_ID_NOT_UNIQUE, format!("initiator {} exists", iqn)));
        }
        state.iscsi_initiators.insert(iqn.clone(), None);
        to_value(Self::iscsi_view(&iqn, &None))
    }

    fn check_link(state: &ArrayState, initiator: &str, current: &Option<String>, host_id: &str) -> Result<()> {
        if !state.hosts.contains_key(host_id) {
            return Err(not_found("host", host_id));
        }
        match current {
            Some(owner) if owner != host_id => Err(Error::remote(
                codes::INITIATOR_IN_USE,
                format!("initiator {} belongs to host {}", initiator, owner),
            )),
            _ => Ok(()),
        }
    }

    fn link_iscsi_initiator(state: &mut ArrayState, iqn: &str, req: &Request) -> Result<Value> {
        let host_id = req.field("PARENTID");
        let current = state
            .iscsi_initiators
            .get(iqn)
            .ok_or_else(|| not_found("iscsi initiator", iqn))?
            .clone();
        Self::check_link(state, iqn, &current, &host_id)?;
        state.iscsi_initiators.insert(iqn.to_string(), Some(host_id));
        Ok(Value::Null)
    }

    fn unlink_iscsi_initiator(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let iqn = req.field("ID");
        match state.iscsi_initiators.get_mut(&iqn) {
            Some(parent) if parent.is_some() => {
                *parent = None;
                Ok(Value::Null)
            }
            _ => Err(not_found("linked iscsi initiator", &iqn)),
        }
    }

    fn fc_view(wwn: &str, record: &FcRecord) -> FcInitiator {
        FcInitiator {
            id: wwn.to_string(),
            parent_id: record.parent.clone().unwrap_or_default(),
            is_free: record.parent.is_none().to_string(),
            running_status: if record.online {
                FC_INITIATOR_ONLINE
            } else {
                FC_INITIATOR_OFFLINE
            }
            .to_string(),
        }
    }

    fn list_fc_initiators(state: &ArrayState, req: &Request) -> Result<Value> {
        let parent = req.query("PARENTID");
        let free_only = req.query("ISFREE") == "true";
        to_value(
            state
                .fc_initiators
                .iter()
                .filter(|(_, r)| !free_only || r.parent.is_none())
                .filter(|(_, r)| parent.is_empty() || r.parent.as_deref() == Some(parent))
                .map(|(wwn, r)| Self::fc_view(wwn, r))
                .collect::<Vec<_>>(),
        )
    }

    fn link_fc_initiator(state: &mut ArrayState, wwn: &str, req: &Request) -> Result<Value> {
        let host_id = req.field("PARENTID");
        let current = state
            .fc_initiators
            .get(wwn)
            .ok_or_else(|| not_found("fc initiator", wwn))?
            .parent
            .clone();
        Self::check_link(state, wwn, &current, &host_id)?;
        if let Some(record) = state.fc_initiators.get_mut(wwn) {
            record.parent = Some(host_id);
        }
        Ok(Value::Null)
    }

    fn unlink_fc_initiator(state: &mut ArrayState, req: &Request) -> Result<Value> {
        let wwn = req.field("ID");
        match state.fc_initiators.get_mut(&wwn) {
            Some(record) if record.parent.is_some() => {
                record.parent = None;
                Ok(Value::Null)
            }
            _ => Err(not_found("linked fc initiator", &wwn)),
        }
    }

    fn host_links(state: &ArrayState, req: &Request) -> Result<Value> {
        let wwn = req.query("INITIATOR_PORT_WWN");
        let links: Vec<HostLink> = state
            .fc_links
            .get(wwn)
            .into_iter()
            .flatten()
            .map(|target| HostLink {
                initiator_port_wwn: wwn.to_string(),
                target_port_wwn: target.clone(),
            })
            .collect();
        to_value(links)
    }

    // =========================================================================
    // Replication
    // =========================================================================

    fn pair_view(&self, id: &str, record: &PairRecord) -> ReplicationPair {
        let other = 1 - self.side;
        ReplicationPair {
            id: id.to_string(),
            local_res_id: record.luns[self.side].clone(),
            remote_res_id: record.luns[other].clone(),
            replication_mode: record.mode.clone(),
            running_status: record.running.code().to_string(),
            health_status: "1".to_string(),
            is_primary: (record.primary_side == self.side).to_string(),
            secondary_access: record.secondary_access.code().to_string(),
        }
    }

    fn create_pair(&self, state: &ArrayState, req: &Request) -> Result<Value> {
        let local_lun = req.field("LOCALRESID");
        let remote_lun = req.field("REMOTERESID");
        let device_id = req.field("REMOTEDEVICEID");
        let lun = state.luns.get(&local_lun).ok_or_else(|| not_found("lun", &local_lun))?;
        if lun.reads_until_ready > 0 {
            return Err(parameter_error(format!("lun {} is not ready", local_lun)));
        }
        if !state.remote_devices.iter().any(|d| d.id == device_id) {
            return Err(not_found("remote device", &device_id));
        }
        if remote_lun.is_empty() {
            return Err(parameter_error("remote resource id is required"));
        }

        let mut link = self.link.lock();
        link.next_id += 1;
        let id = format!("{:x}", 0x4000 + link.next_id);
        let mut luns = [String::new(), String::new()];
        luns[self.side] = local_lun;
        luns[1 - self.side] = remote_lun;
        let mode = match req.field("REPLICATIONMODEL") {
            m if m.is_empty() => REPLICATION_MODE_SYNC.to_string(),
            m => m,
        };
        let record = PairRecord {
            luns,
            mode,
            primary_side: self.side,
            running: RunningStatus::Split,
            secondary_access: SecondaryAccess::ReadOnly,
            reads_until_synced: 0,
        };
        let view = self.pair_view(&id, &record);
        link.pairs.insert(id, record);
        to_value(view)
    }

    fn get_pair(&self, id: &str) -> Result<Value> {
        let mut link = self.link.lock();
        let record = link
            .pairs
            .get_mut(id)
            .ok_or_else(|| not_found("replication pair", id))?;
        if record.running == RunningStatus::Synchronizing {
            if record.reads_until_synced == 0 {
                record.running = RunningStatus::Normal;
            } else {
                record.reads_until_synced -= 1;
            }
        }
        let view = self.pair_view(id, record);
        to_value(view)
    }

    fn pair_command(&self, command: &str, req: &Request) -> Result<Value> {
        let id = req.field("ID");
        let mut link = self.link.lock();
        let sync_reads = link.sync_reads;
        let record = link
            .pairs
            .get_mut(&id)
            .ok_or_else(|| not_found("replication pair", &id))?;
        match command {
            "split" => {
                if matches!(record.running, RunningStatus::Normal | RunningStatus::Synchronizing) {
                    record.running = RunningStatus::Split;
                }
            }
            "sync" => {
                if record.primary_side != self.side
                    || record.secondary_access != SecondaryAccess::ReadOnly
                {
                    return Err(invalid_pair_state(&id, record.running));
                }
                if matches!(record.running, RunningStatus::Split | RunningStatus::Interrupted) {
                    record.running = RunningStatus::Synchronizing;
                    record.reads_until_synced = sync_reads;
                }
            }
            _ => {
                if record.running != RunningStatus::Split {
                    return Err(invalid_pair_state(&id, record.running));
                }
                record.primary_side = 1 - record.primary_side;
            }
        }
        Ok(Value::Null)
    }

    fn set_secondary_access(&self, id: &str, req: &Request) -> Result<Value> {
        let access = SecondaryAccess::from_code(&req.field("SECRESACCESS"))
            .ok_or_else(|| parameter_error("unknown secondary access mode"))?;
        let mut link = self.link.lock();
        let record = link
            .pairs
            .get_mut(id)
            .ok_or_else(|| not_found("replication pair", id))?;
        if access == SecondaryAccess::ReadWrite && record.running != RunningStatus::Split {
            return Err(invalid_pair_state(id, record.running));
        }
        record.secondary_access = access;
        Ok(Value::Null)
    }

    fn delete_pair(&self, id: &str) -> Result<Value> {
        let mut link = self.link.lock();
        let record = link
            .pairs
            .get(id)
            .ok_or_else(|| not_found("replication pair", id))?;
        if matches!(record.running, RunningStatus::Normal | RunningStatus::Synchronizing) {
            return Err(invalid_pair_state(id, record.running));
        }
        link.pairs.remove(id);
        Ok(Value::Null)
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupKind {
    Host,
    Lun,
    View,
}

/// FNV-1a, only used to derive stable fake WWNs
fn simple_hash(s: &str) -> u64 {
    s.bytes()
        .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3))
        & 0xffff_ffff_ffff
}

#[async_trait]
impl ArrayGateway for SimulatedArray {
    async fn get(&self, path: &str) -> Result<Value> {
        self.handle("GET", path, Value::Null)
    }

    async fn create(&self, path: &str, body: Value) -> Result<Value> {
        self.handle("POST", path, body)
    }

    async fn update(&self, path: &str, body: Value) -> Result<Value> {
        self.handle("PUT", path, body)
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.handle("DELETE", path, Value::Null)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn code(result: Result<Value>) -> Option<i64> {
        result.err().and_then(|e| e.remote_code())
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let array = SimulatedArray::new("a");
        array.create("/hostgroup", json!({"NAME": "HostGroup_1"})).await.unwrap();
        assert_eq!(
            code(array.create("/hostgroup", json!({"NAME": "HostGroup_1"})).await),
            Some(codes::OBJECT_NAME_ALREADY_EXISTS)
        );
    }

    #[tokio::test]
    async fn test_in_use_objects_cannot_be_deleted() {
        let array = SimulatedArray::new("a");
        let host = array.create("/host", json!({"NAME": "h1"})).await.unwrap();
        let group = array.create("/hostgroup", json!({"NAME": "g1"})).await.unwrap();
        let host_id = host["ID"].as_str().unwrap().to_string();
        let group_id = group["ID"].as_str().unwrap().to_string();

        array
            .create(
                "/hostgroup/associate",
                json!({"ID": group_id, "ASSOCIATEOBJTYPE": "21", "ASSOCIATEOBJID": host_id}),
            )
            .await
            .unwrap();
        assert_eq!(
            code(array.delete(&format!("/host/{}", host_id)).await),
            Some(codes::OBJECT_IN_USE)
        );
        assert_eq!(
            code(array.delete(&format!("/hostgroup/{}", group_id)).await),
            Some(codes::OBJECT_IN_USE)
        );
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let array = SimulatedArray::new("a");
        array.inject_failure("get", "/system", codes::SESSION_EXPIRED);
        assert_eq!(code(array.get("/system/").await), Some(codes::SESSION_EXPIRED));
        assert!(array.get("/system/").await.is_ok());
        assert_eq!(array.request_count(), 2);
    }

    #[tokio::test]
    async fn test_encoded_path_segments_are_decoded() {
        let array = Arc::new(SimulatedArray::new("a"));
        let client = crate::array::ArrayClient::new(array.clone());
        let iqn = "iqn.1994-05.com.redhat:node01";

        client.create_iscsi_initiator(iqn).await.unwrap();
        let found = client.get_iscsi_initiator(iqn).await.unwrap().unwrap();
        assert_eq!(found.id, iqn);

        let host = client.create_host("node01", "0", "", "").await.unwrap();
        client.link_iscsi_initiator(iqn, &host.id).await.unwrap();
        assert_eq!(array.iscsi_initiator_owner(iqn), Some(host.id));
    }

    #[tokio::test]
    async fn test_lun_lifecycle_guards() {
        let array = SimulatedArray::new("a");
        array.add_storage_pool("0", "pool", 10);
        array.add_lun("11", "vol-src");
        array.add_snapshot("s1", "snap", "11");

        assert_eq!(
            code(array.create("/lun", json!({"NAME": "big", "CAPACITY": gb_to_sectors(11), "PARENTID": "0"})).await),
            Some(codes::PARAMETER_ERROR)
        );
        let lun = array
            .create("/lun", json!({"NAME": "vol-dst", "CAPACITY": gb_to_sectors(10), "PARENTID": "0"}))
            .await
            .unwrap();
        let lun_id = lun["ID"].as_str().unwrap().to_string();
        assert_eq!(lun["RUNNINGSTATUS"], LUN_STATUS_INITIALIZING);

        let copy = array
            .create(
                "/luncopy",
                json!({"NAME": "c1", "SOURCELUN": lun_copy_member("s1"), "TARGETLUN": lun_copy_member(&lun_id)}),
            )
            .await
            .unwrap();
        let copy_id = copy["ID"].as_str().unwrap().to_string();
        array.update("/LUNCOPY/start", json!({"ID": copy_id})).await.unwrap();

        // Neither the copy nor its target can go while copying
        assert_eq!(
            code(array.delete(&format!("/LUNCOPY/{}", copy_id)).await),
            Some(codes::OBJECT_IN_USE)
        );
        assert_eq!(
            code(array.delete(&format!("/lun/{}", lun_id)).await),
            Some(codes::OBJECT_IN_USE)
        );
    }

    #[tokio::test]
    async fn test_pair_sync_completes_after_reads() {
        let (local, remote) = SimulatedArray::pair("a", "b");
        local.add_lun("11", "vol");
        local.set_sync_reads(1);
        let pair = local
            .create(
                "/REPLICATIONPAIR",
                json!({"LOCALRESID": "11", "REMOTEDEVICEID": "0", "REMOTERESID": "22"}),
            )
            .await
            .unwrap();
        let id = pair["ID"].as_str().unwrap().to_string();
        assert_eq!(pair["ISPRIMARY"], "true");

        let seen = remote.get(&format!("/REPLICATIONPAIR/{}", id)).await.unwrap();
        assert_eq!(seen["ISPRIMARY"], "false");
        assert_eq!(seen["LOCALRESID"], "22");

        assert_eq!(
            code(remote.update("/REPLICATIONPAIR/sync", json!({"ID": id})).await),
            Some(codes::INVALID_PAIR_STATE)
        );
        local.update("/REPLICATIONPAIR/sync", json!({"ID": id})).await.unwrap();
        let path = format!("/REPLICATIONPAIR/{}", id);
        assert_eq!(local.get(&path).await.unwrap()["RUNNINGSTATUS"], "23");
        assert_eq!(local.get(&path).await.unwrap()["RUNNINGSTATUS"], "1");

        assert_matches!(local.delete(&path).await, Err(Error::RemoteObject { .. }));
    }

    #[tokio::test]
    async fn test_host_lun_ids_smallest_free() {
        let mut state = ArrayState::default();
        state.hosts.insert(
            "1".into(),
            HostRecord {
                name: "h".into(),
                os_type: "0".into(),
                ip: String::new(),
                description: String::new(),
            },
        );
        let mut hg = GroupRecord::default();
        hg.members.insert("1".into());
        let mut lg = GroupRecord::default();
        lg.members.insert("a".into());
        lg.members.insert("b".into());
        state.host_groups.insert("2".into(), hg);
        state.lun_groups.insert("3".into(), lg);
        state.views.insert(
            "4".into(),
            ViewRecord {
                name: "v".into(),
                host_group: Some("2".into()),
                lun_group: Some("3".into()),
            },
        );

        let ids = state.refresh_host_lun_ids("1");
        assert_eq!(ids["a"], 1);
        assert_eq!(ids["b"], 2);

        state.lun_groups.get_mut("3").unwrap().members.remove("a");
        state.lun_groups.get_mut("3").unwrap().members.insert("c".into());
        let ids = state.refresh_host_lun_ids("1");
        assert_eq!(ids["b"], 2);
        assert_eq!(ids["c"], 1);
    }
}
