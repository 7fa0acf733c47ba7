//! Typed array client
//!
//! Wraps an [`ArrayGateway`] with typed, logged operations over the array's
//! object namespace. Every REST path the driver uses lives in this file.
//!
//! Lookups by name return `Option`; creates treat "already exists" as the
//! found case and associations treat "already associated" as done, so that
//! racing requests for the same deterministic names converge.

use crate::array::model::{
    codes, lun_copy_member, object_type, CountResult, FcInitiator, Host, HostAssociatedLun,
    HostGroup, HostLink, HostLunMetadata, IscsiInitiator, IscsiPortal, IscsiTargetPortEntry, Lun,
    LunCopy, LunGroup, MappingView, NamedObject, RemoteDevice, ReplicationPair, SecondaryAccess,
    Snapshot, StoragePool, SystemInfo,
};
use crate::domain::ports::ArrayGatewayRef;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Typed access to one array
#[derive(Clone)]
pub struct ArrayClient {
    gateway: ArrayGatewayRef,
}

impl std::fmt::Debug for ArrayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayClient")
            .field("array", &self.gateway.name())
            .finish()
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn decode_list<T: DeserializeOwned>(value: Value) -> Result<Vec<T>> {
    match value {
        Value::Null => Ok(Vec::new()),
        other => decode(other),
    }
}

/// Thin provisioning
const LUN_ALLOC_THIN: &str = "1";
/// Write-back cache policy
const LUN_WRITE_BACK: &str = "1";

fn enc(s: &str) -> std::borrow::Cow<'_, str> {
    urlencoding::encode(s)
}

/// Mapping-view association kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewMember {
    HostGroup,
    LunGroup,
}

impl ViewMember {
    fn type_code(self) -> &'static str {
        match self {
            ViewMember::HostGroup => object_type::HOST_GROUP,
            ViewMember::LunGroup => object_type::LUN_GROUP,
        }
    }
}

impl ArrayClient {
    /// Create a client over a gateway
    pub fn new(gateway: ArrayGatewayRef) -> Self {
        Self { gateway }
    }

    /// Name of the underlying array
    pub fn array_name(&self) -> &str {
        self.gateway.name()
    }

    // =========================================================================
    // Generic Helpers
    // =========================================================================

    async fn list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        decode_list(self.gateway.get(path).await?)
    }

    async fn count(&self, path: &str) -> Result<u64> {
        let result: CountResult = decode(self.gateway.get(path).await?)?;
        if result.count.is_empty() {
            return Ok(0);
        }
        result
            .count
            .parse()
            .map_err(|_| Error::Internal(format!("invalid count '{}' from {}", result.count, path)))
    }

    async fn find_named(&self, collection: &str, name: &str) -> Result<Option<NamedObject>> {
        let path = format!("/{}?filter=NAME::{}", collection, enc(name));
        let found: Vec<NamedObject> = self.list(&path).await?;
        Ok(found.into_iter().find(|o| o.name == name))
    }

    async fn create_named(&self, collection: &str, name: &str) -> Result<NamedObject> {
        match self
            .gateway
            .create(&format!("/{}", collection), json!({ "NAME": name }))
            .await
        {
            Ok(value) => {
                let created: NamedObject = decode(value)?;
                info!(array = self.array_name(), "Created {} {} ({})", collection, name, created.id);
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                warn!("{} {} was created concurrently, using the existing one", collection, name);
                self.find_named(collection, name)
                    .await?
                    .ok_or_else(|| Error::not_found(collection, name))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_object(&self, collection: &str, id: &str) -> Result<()> {
        match self.gateway.delete(&format!("/{}/{}", collection, enc(id))).await {
            Ok(_) => {
                info!(array = self.array_name(), "Deleted {} {}", collection, id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("{} {} already deleted", collection, id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn associate(&self, result: Result<Value>, what: String) -> Result<()> {
        match result {
            Ok(_) => {
                info!(array = self.array_name(), "Associated {}", what);
                Ok(())
            }
            Err(e) if e.is_already_associated() => {
                warn!("{} was associated concurrently", what);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// An initiator link the array refused because another host holds the initiator
    fn link_result(&self, result: Result<Value>, initiator: &str, host_id: &str) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.remote_code() == Some(codes::INITIATOR_IN_USE) => {
                warn!(
                    "Initiator {} was linked to another host concurrently, not adding it to host {}",
                    initiator, host_id
                );
                Err(Error::Conflict {
                    initiator: initiator.to_string(),
                    host: host_id.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn disassociate(&self, result: Result<Value>, what: String) -> Result<()> {
        match result {
            Ok(_) => {
                info!(array = self.array_name(), "Removed {}", what);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("{} already removed", what);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Array Identity
    // =========================================================================

    /// Identity of this array
    pub async fn system_info(&self) -> Result<SystemInfo> {
        decode(self.gateway.get("/system/").await?)
    }

    /// Peer arrays registered on this array
    pub async fn list_remote_devices(&self) -> Result<Vec<RemoteDevice>> {
        self.list("/remote_device").await
    }

    // =========================================================================
    // LUNs
    // =========================================================================

    /// Get a LUN by id
    pub async fn get_lun(&self, lun_id: &str) -> Result<Lun> {
        match self.gateway.get(&format!("/lun/{}", enc(lun_id))).await {
            Ok(value) => decode(value),
            Err(e) if e.is_not_found() => Err(Error::not_found("lun", lun_id)),
            Err(e) => Err(e),
        }
    }

    /// Find a LUN by name
    pub async fn find_lun(&self, name: &str) -> Result<Option<Lun>> {
        let luns: Vec<Lun> = self.list(&format!("/lun?filter=NAME::{}", enc(name))).await?;
        Ok(luns.into_iter().find(|l| l.name == name))
    }

    /// Create a thin LUN in a pool, returning the existing one when the name is taken
    pub async fn create_lun(&self, name: &str, capacity_sectors: u64, description: &str, pool_id: &str) -> Result<Lun> {
        let body = json!({
            "NAME": name,
            "CAPACITY": capacity_sectors,
            "DESCRIPTION": description,
            "PARENTID": pool_id,
            "ALLOCTYPE": LUN_ALLOC_THIN,
            "WRITEPOLICY": LUN_WRITE_BACK,
        });
        match self.gateway.create("/lun", body).await {
            Ok(value) => {
                let lun: Lun = decode(value)?;
                info!(array = self.array_name(), "Created lun {} ({})", name, lun.id);
                Ok(lun)
            }
            Err(e) if e.is_already_exists() => {
                warn!("Lun {} already exists, using it", name);
                self.find_lun(name)
                    .await?
                    .ok_or_else(|| Error::not_found("lun", name))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete_lun(&self, lun_id: &str) -> Result<()> {
        self.delete_object("lun", lun_id).await
    }

    // =========================================================================
    // Snapshots and Pools
    // =========================================================================

    /// Find a snapshot by name
    pub async fn find_snapshot(&self, name: &str) -> Result<Option<Snapshot>> {
        let snapshots: Vec<Snapshot> = self
            .list(&format!("/snapshot?filter=NAME::{}", enc(name)))
            .await?;
        Ok(snapshots.into_iter().find(|s| s.name == name))
    }

    /// Find a storage pool by name
    pub async fn find_storage_pool(&self, name: &str) -> Result<Option<StoragePool>> {
        let pools: Vec<StoragePool> = self
            .list(&format!("/storagepool?filter=NAME::{}", enc(name)))
            .await?;
        Ok(pools.into_iter().find(|p| p.name == name))
    }

    // =========================================================================
    // LUN Copies
    // =========================================================================

    /// Define a copy of `source_id` onto the LUN `target_id`; it starts idle
    pub async fn create_lun_copy(&self, name: &str, source_id: &str, target_id: &str, speed: &str) -> Result<LunCopy> {
        let body = json!({
            "NAME": name,
            "COPYSPEED": speed,
            "SOURCELUN": lun_copy_member(source_id),
            "TARGETLUN": lun_copy_member(target_id),
        });
        let copy: LunCopy = decode(self.gateway.create("/luncopy", body).await?)?;
        info!(
            array = self.array_name(),
            "Created lun copy {} ({}) from {} to {}", name, copy.id, source_id, target_id
        );
        Ok(copy)
    }

    pub async fn start_lun_copy(&self, copy_id: &str) -> Result<()> {
        self.gateway
            .update("/LUNCOPY/start", json!({ "ID": copy_id }))
            .await?;
        info!(array = self.array_name(), "Started lun copy {}", copy_id);
        Ok(())
    }

    pub async fn get_lun_copy(&self, copy_id: &str) -> Result<LunCopy> {
        match self.gateway.get(&format!("/LUNCOPY/{}", enc(copy_id))).await {
            Ok(value) => decode(value),
            Err(e) if e.is_not_found() => Err(Error::not_found("lun copy", copy_id)),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_lun_copy(&self, copy_id: &str) -> Result<()> {
        self.delete_object("LUNCOPY", copy_id).await
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    /// Find a host by its (already encoded) array name
    pub async fn find_host(&self, name: &str) -> Result<Option<Host>> {
        let hosts: Vec<Host> = self.list(&format!("/host?filter=NAME::{}", enc(name))).await?;
        Ok(hosts.into_iter().find(|h| h.name == name))
    }

    /// Create a host, returning the existing one when the name is taken
    pub async fn create_host(&self, name: &str, os_type: &str, ip: &str, description: &str) -> Result<Host> {
        let body = json!({
            "NAME": name,
            "OPERATIONSYSTEM": os_type,
            "IP": ip,
            "DESCRIPTION": description,
        });
        match self.gateway.create("/host", body).await {
            Ok(value) => {
                let host: Host = decode(value)?;
                info!(array = self.array_name(), "Created host {} ({})", name, host.id);
                Ok(host)
            }
            Err(e) if e.is_already_exists() => {
                warn!("Host {} was created concurrently, using the existing one", name);
                self.find_host(name)
                    .await?
                    .ok_or_else(|| Error::not_found("host", name))
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a host
    pub async fn delete_host(&self, host_id: &str) -> Result<()> {
        self.delete_object("host", host_id).await
    }

    // =========================================================================
    // Host Groups
    // =========================================================================

    pub async fn find_host_group(&self, name: &str) -> Result<Option<HostGroup>> {
        self.find_named("hostgroup", name).await
    }

    pub async fn create_host_group(&self, name: &str) -> Result<HostGroup> {
        self.create_named("hostgroup", name).await
    }

    pub async fn delete_host_group(&self, id: &str) -> Result<()> {
        self.delete_object("hostgroup", id).await
    }

    /// Hosts contained in a host group
    pub async fn hosts_in_host_group(&self, host_group_id: &str) -> Result<Vec<Host>> {
        self.list(&format!(
            "/host/associate?ASSOCIATEOBJTYPE={}&ASSOCIATEOBJID={}",
            object_type::HOST_GROUP,
            enc(host_group_id)
        ))
        .await
    }

    /// Host groups a host belongs to
    pub async fn host_groups_of_host(&self, host_id: &str) -> Result<Vec<HostGroup>> {
        self.list(&format!(
            "/hostgroup/associate?ASSOCIATEOBJTYPE={}&ASSOCIATEOBJID={}",
            object_type::HOST,
            enc(host_id)
        ))
        .await
    }

    pub async fn is_host_in_host_group(&self, host_group_id: &str, host_id: &str) -> Result<bool> {
        let hosts = self.hosts_in_host_group(host_group_id).await?;
        let contained = hosts.iter().any(|h| h.id == host_id);
        debug!("Host group {} contains host {}: {}", host_group_id, host_id, contained);
        Ok(contained)
    }

    pub async fn add_host_to_host_group(&self, host_group_id: &str, host_id: &str) -> Result<()> {
        let result = self
            .gateway
            .create(
                "/hostgroup/associate",
                json!({
                    "ID": host_group_id,
                    "ASSOCIATEOBJTYPE": object_type::HOST,
                    "ASSOCIATEOBJID": host_id,
                }),
            )
            .await;
        self.associate(result, format!("host {} to host group {}", host_id, host_group_id))
            .await
    }

    pub async fn remove_host_from_host_group(&self, host_group_id: &str, host_id: &str) -> Result<()> {
        let path = format!(
            "/host/associate?TYPE={}&ID={}&ASSOCIATEOBJTYPE={}&ASSOCIATEOBJID={}",
            object_type::HOST_GROUP,
            enc(host_group_id),
            object_type::HOST,
            enc(host_id)
        );
        let result = self.gateway.delete(&path).await;
        self.disassociate(result, format!("host {} from host group {}", host_id, host_group_id))
            .await
    }

    // =========================================================================
    // LUN Groups
    // =========================================================================

    pub async fn find_lun_group(&self, name: &str) -> Result<Option<LunGroup>> {
        self.find_named("lungroup", name).await
    }

    pub async fn create_lun_group(&self, name: &str) -> Result<LunGroup> {
        self.create_named("lungroup", name).await
    }

    pub async fn delete_lun_group(&self, id: &str) -> Result<()> {
        self.delete_object("lungroup", id).await
    }

    /// LUNs contained in a LUN group
    pub async fn luns_in_lun_group(&self, lun_group_id: &str) -> Result<Vec<Lun>> {
        self.list(&format!(
            "/lun/associate?ASSOCIATEOBJTYPE={}&ASSOCIATEOBJID={}",
            object_type::LUN_GROUP,
            enc(lun_group_id)
        ))
        .await
    }

    pub async fn is_lun_in_lun_group(&self, lun_group_id: &str, lun_id: &str) -> Result<bool> {
        let luns = self.luns_in_lun_group(lun_group_id).await?;
        let contained = luns.iter().any(|l| l.id == lun_id);
        debug!("Lun group {} contains lun {}: {}", lun_group_id, lun_id, contained);
        Ok(contained)
    }

    pub async fn add_lun_to_lun_group(&self, lun_group_id: &str, lun_id: &str) -> Result<()> {
        let result = self
            .gateway
            .create(
                "/lungroup/associate",
                json!({
                    "ID": lun_group_id,
                    "ASSOCIATEOBJTYPE": object_type::LUN,
                    "ASSOCIATEOBJID": lun_id,
                }),
            )
            .await;
        self.associate(result, format!("lun {} to lun group {}", lun_id, lun_group_id))
            .await
    }

    pub async fn remove_lun_from_lun_group(&self, lun_group_id: &str, lun_id: &str) -> Result<()> {
        let path = format!(
            "/lungroup/associate?ID={}&ASSOCIATEOBJTYPE={}&ASSOCIATEOBJID={}",
            enc(lun_group_id),
            object_type::LUN,
            enc(lun_id)
        );
        let result = self.gateway.delete(&path).await;
        self.disassociate(result, format!("lun {} from lun group {}", lun_id, lun_group_id))
            .await
    }

    /// LUNs plus snapshots still associated with a LUN group
    pub async fn lun_group_object_count(&self, lun_group_id: &str) -> Result<u64> {
        let query = format!(
            "ASSOCIATEOBJTYPE={}&ASSOCIATEOBJID={}",
            object_type::LUN_GROUP,
            enc(lun_group_id)
        );
        let luns = self.count(&format!("/lun/count?{}", query)).await?;
        let snapshots = self.count(&format!("/snapshot/count?{}", query)).await?;
        debug!(
            "Lun group {} holds {} luns and {} snapshots",
            lun_group_id, luns, snapshots
        );
        Ok(luns + snapshots)
    }

    // =========================================================================
    // Mapping Views
    // =========================================================================

    pub async fn find_mapping_view(&self, name: &str) -> Result<Option<MappingView>> {
        self.find_named("mappingview", name).await
    }

    pub async fn create_mapping_view(&self, name: &str) -> Result<MappingView> {
        self.create_named("mappingview", name).await
    }

    pub async fn delete_mapping_view(&self, id: &str) -> Result<()> {
        self.delete_object("mappingview", id).await
    }

    async fn views_containing(&self, member: ViewMember, group_id: &str) -> Result<Vec<MappingView>> {
        self.list(&format!(
            "/mappingview/associate?ASSOCIATEOBJTYPE={}&ASSOCIATEOBJID={}",
            member.type_code(),
            enc(group_id)
        ))
        .await
    }

    /// Mapping views a host group is associated with
    pub async fn views_of_host_group(&self, host_group_id: &str) -> Result<Vec<MappingView>> {
        self.views_containing(ViewMember::HostGroup, host_group_id).await
    }

    /// Mapping views a LUN group is associated with
    pub async fn views_of_lun_group(&self, lun_group_id: &str) -> Result<Vec<MappingView>> {
        self.views_containing(ViewMember::LunGroup, lun_group_id).await
    }

    pub async fn is_host_group_in_view(&self, view_id: &str, host_group_id: &str) -> Result<bool> {
        let views = self.views_of_host_group(host_group_id).await?;
        Ok(views.iter().any(|v| v.id == view_id))
    }

    pub async fn is_lun_group_in_view(&self, view_id: &str, lun_group_id: &str) -> Result<bool> {
        let views = self.views_of_lun_group(lun_group_id).await?;
        Ok(views.iter().any(|v| v.id == view_id))
    }

    async fn associate_to_view(&self, view_id: &str, member: ViewMember, group_id: &str) -> Result<()> {
        let result = self
            .gateway
            .update(
                "/mappingview/create_associate",
                json!({
                    "ID": view_id,
                    "ASSOCIATEOBJTYPE": member.type_code(),
                    "ASSOCIATEOBJID": group_id,
                }),
            )
            .await;
        self.associate(result, format!("{:?} {} to mapping view {}", member, group_id, view_id))
            .await
    }

    async fn remove_from_view(&self, view_id: &str, member: ViewMember, group_id: &str) -> Result<()> {
        let result = self
            .gateway
            .update(
                "/mappingview/REMOVE_ASSOCIATE",
                json!({
                    "ID": view_id,
                    "TYPE": object_type::MAPPING_VIEW,
                    "ASSOCIATEOBJTYPE": member.type_code(),
                    "ASSOCIATEOBJID": group_id,
                }),
            )
            .await;
        self.disassociate(result, format!("{:?} {} from mapping view {}", member, group_id, view_id))
            .await
    }

    pub async fn add_host_group_to_view(&self, view_id: &str, host_group_id: &str) -> Result<()> {
        self.associate_to_view(view_id, ViewMember::HostGroup, host_group_id)
            .await
    }

    pub async fn add_lun_group_to_view(&self, view_id: &str, lun_group_id: &str) -> Result<()> {
        self.associate_to_view(view_id, ViewMember::LunGroup, lun_group_id)
            .await
    }

    pub async fn remove_host_group_from_view(&self, view_id: &str, host_group_id: &str) -> Result<()> {
        self.remove_from_view(view_id, ViewMember::HostGroup, host_group_id)
            .await
    }

    pub async fn remove_lun_group_from_view(&self, view_id: &str, lun_group_id: &str) -> Result<()> {
        self.remove_from_view(view_id, ViewMember::LunGroup, lun_group_id)
            .await
    }

    /// Host-visible LUN number of a mapped LUN, 1 when the array reports none
    pub async fn host_lun_id(&self, host_id: &str, lun_id: &str) -> Result<u32> {
        let path = format!(
            "/lun/associate?TYPE={}&ASSOCIATEOBJTYPE={}&ASSOCIATEOBJID={}",
            object_type::LUN,
            object_type::HOST,
            enc(host_id)
        );
        let luns: Vec<HostAssociatedLun> = self.list(&path).await?;
        if let Some(lun) = luns.into_iter().find(|l| l.id == lun_id) {
            let metadata: HostLunMetadata = serde_json::from_str(&lun.associate_metadata)?;
            return Ok(metadata.host_lun_id);
        }
        info!("Host lun id of lun {} on host {} not reported, using 1", lun_id, host_id);
        Ok(1)
    }

    // =========================================================================
    // iSCSI Initiators
    // =========================================================================

    /// Get an iSCSI initiator object, `None` when the array does not know it
    pub async fn get_iscsi_initiator(&self, iqn: &str) -> Result<Option<IscsiInitiator>> {
        match self.gateway.get(&format!("/iscsi_initiator/{}", enc(iqn))).await {
            Ok(Value::Null) => Ok(None),
            Ok(value) => {
                let initiator: IscsiInitiator = decode(value)?;
                Ok(Some(initiator).filter(|i| !i.id.is_empty()))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Register an iSCSI initiator on the array
    pub async fn create_iscsi_initiator(&self, iqn: &str) -> Result<()> {
        match self.gateway.create("/iscsi_initiator", json!({ "ID": iqn })).await {
            Ok(_) => {
                info!(array = self.array_name(), "Created iscsi initiator {}", iqn);
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Link an iSCSI initiator to a host
    pub async fn link_iscsi_initiator(&self, iqn: &str, host_id: &str) -> Result<()> {
        let result = self
            .gateway
            .update(
                &format!("/iscsi_initiator/{}", enc(iqn)),
                json!({ "ID": iqn, "PARENTID": host_id }),
            )
            .await;
        self.link_result(result, iqn, host_id)?;
        info!(array = self.array_name(), "Added iscsi initiator {} to host {}", iqn, host_id);
        Ok(())
    }

    /// iSCSI initiators linked to a host
    pub async fn iscsi_initiators_of_host(&self, host_id: &str) -> Result<Vec<IscsiInitiator>> {
        self.list(&format!("/iscsi_initiator?ISFREE=false&PARENTID={}", enc(host_id)))
            .await
    }

    /// Unlink an iSCSI initiator from its host
    pub async fn unlink_iscsi_initiator(&self, iqn: &str) -> Result<()> {
        let result = self
            .gateway
            .update(
                "/iscsi_initiator/remove_iscsi_from_host",
                json!({ "ID": iqn, "TYPE": object_type::ISCSI_INITIATOR }),
            )
            .await;
        self.disassociate(result, format!("iscsi initiator {} from its host", iqn))
            .await
    }

    /// Target portals the array exposes
    pub async fn iscsi_portals(&self) -> Result<Vec<IscsiPortal>> {
        let entries: Vec<IscsiTargetPortEntry> = self.list("/iscsi_tgt_port").await?;
        Ok(entries.iter().filter_map(IscsiTargetPortEntry::portal).collect())
    }

    // =========================================================================
    // FC Initiators
    // =========================================================================

    /// FC initiators linked to a host
    pub async fn fc_initiators_of_host(&self, host_id: &str) -> Result<Vec<FcInitiator>> {
        self.list(&format!("/fc_initiator?ISFREE=false&PARENTID={}", enc(host_id)))
            .await
    }

    /// FC initiators not claimed by any host
    pub async fn free_fc_initiators(&self) -> Result<Vec<FcInitiator>> {
        self.list("/fc_initiator?ISFREE=true").await
    }

    /// Every FC initiator the array has seen
    pub async fn all_fc_initiators(&self) -> Result<Vec<FcInitiator>> {
        self.list("/fc_initiator").await
    }

    /// Link an FC initiator to a host
    pub async fn link_fc_initiator(&self, wwn: &str, host_id: &str) -> Result<()> {
        let result = self
            .gateway
            .update(
                &format!("/fc_initiator/{}", enc(wwn)),
                json!({ "ID": wwn, "PARENTID": host_id }),
            )
            .await;
        self.link_result(result, wwn, host_id)?;
        info!(array = self.array_name(), "Added fc initiator {} to host {}", wwn, host_id);
        Ok(())
    }

    /// Unlink an FC initiator from its host
    pub async fn unlink_fc_initiator(&self, wwn: &str) -> Result<()> {
        let result = self
            .gateway
            .update(
                "/fc_initiator/remove_fc_from_host",
                json!({ "ID": wwn, "TYPE": object_type::FC_INITIATOR }),
            )
            .await;
        self.disassociate(result, format!("fc initiator {} from its host", wwn))
            .await
    }

    /// Target port WWNs an FC initiator can reach
    pub async fn fc_target_wwns(&self, initiator_wwn: &str) -> Result<Vec<String>> {
        let links: Vec<HostLink> = self
            .list(&format!(
                "/host_link?INITIATOR_TYPE={}&INITIATOR_PORT_WWN={}",
                object_type::FC_INITIATOR,
                enc(initiator_wwn)
            ))
            .await?;
        let mut wwns: Vec<String> = links.into_iter().map(|l| l.target_port_wwn).collect();
        wwns.sort();
        wwns.dedup();
        Ok(wwns)
    }

    // =========================================================================
    // Replication Pairs
    // =========================================================================

    /// Create a replication pair from raw array parameters
    pub async fn create_pair(&self, params: Value) -> Result<ReplicationPair> {
        let pair: ReplicationPair = decode(self.gateway.create("/REPLICATIONPAIR", params).await?)?;
        info!(array = self.array_name(), "Created replication pair {}", pair.id);
        Ok(pair)
    }

    /// Current state of a pair as seen from this array
    pub async fn get_pair(&self, pair_id: &str) -> Result<ReplicationPair> {
        match self.gateway.get(&format!("/REPLICATIONPAIR/{}", enc(pair_id))).await {
            Ok(value) => decode(value),
            Err(e) if e.is_not_found() => Err(Error::not_found("replication pair", pair_id)),
            Err(e) => Err(e),
        }
    }

    pub async fn pair_exists(&self, pair_id: &str) -> Result<bool> {
        match self.get_pair(pair_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_pair(&self, pair_id: &str) -> Result<()> {
        self.delete_object("REPLICATIONPAIR", pair_id).await
    }

    async fn pair_command(&self, command: &str, pair_id: &str) -> Result<()> {
        self.gateway
            .update(&format!("/REPLICATIONPAIR/{}", command), json!({ "ID": pair_id }))
            .await?;
        info!(array = self.array_name(), "Issued {} on replication pair {}", command, pair_id);
        Ok(())
    }

    pub async fn split_pair(&self, pair_id: &str) -> Result<()> {
        self.pair_command("split", pair_id).await
    }

    pub async fn sync_pair(&self, pair_id: &str) -> Result<()> {
        self.pair_command("sync", pair_id).await
    }

    pub async fn switch_pair(&self, pair_id: &str) -> Result<()> {
        self.pair_command("switch", pair_id).await
    }

    /// Set the data access mode of the pair's secondary LUN
    pub async fn set_pair_secondary_access(&self, pair_id: &str, access: SecondaryAccess) -> Result<()> {
        self.gateway
            .update(
                &format!("/REPLICATIONPAIR/{}", enc(pair_id)),
                json!({ "ID": pair_id, "SECRESACCESS": access.code() }),
            )
            .await?;
        info!(
            array = self.array_name(),
            "Set secondary access of replication pair {} to {:?}", pair_id, access
        );
        Ok(())
    }
}
