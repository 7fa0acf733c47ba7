//! Mapping orchestrator
//!
//! Builds and tears down the object graph that exposes a LUN to a host:
//!
//! ```text
//! host ─▶ host group ─▶ mapping view ◀─ lun group ◀─ lun
//! ```
//!
//! Every step is find-or-create against the array, so re-running a request
//! after a partial failure converges. Teardown checks the array for other
//! users before each destructive step and never removes an object another
//! attachment still depends on.

use crate::array::model::Host;
use crate::array::ArrayClient;
use crate::config::NamingConfig;
use crate::controlplane::naming::{os_type_code, ResourceNaming};
use crate::controlplane::protocol::ProtocolRegistry;
use crate::domain::ports::{AttachRequest, ConnectionInfo, DetachRequest, HostInfo};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Orchestrator
// =============================================================================

/// Attach/detach orchestration against one array
pub struct MappingOrchestrator {
    client: ArrayClient,
    protocols: Arc<ProtocolRegistry>,
    naming: ResourceNaming,
}

impl MappingOrchestrator {
    /// Create an orchestrator
    pub fn new(client: ArrayClient, protocols: Arc<ProtocolRegistry>, naming: NamingConfig) -> Self {
        Self {
            client,
            protocols,
            naming: ResourceNaming::new(naming),
        }
    }

    pub fn client(&self) -> &ArrayClient {
        &self.client
    }

    pub fn naming(&self) -> &ResourceNaming {
        &self.naming
    }

    /// Expose a LUN to a host and describe how the host reaches it
    #[instrument(skip(self, request), fields(host = %request.host.name, lun = %request.lun_id, protocol = %request.protocol))]
    pub async fn create_mapping(&self, request: &AttachRequest) -> Result<ConnectionInfo> {
        validate_attach(request)?;
        let handler = self.protocols.get(request.protocol)?;
        self.client.get_lun(&request.lun_id).await?;

        let host = self.ensure_host(&request.host).await?;
        let binding = handler
            .attach(&self.client, &host.id, &request.host.initiators)
            .await?;

        let host_group_id = self.ensure_host_group(&host.id).await?;
        let lun_group_id = self.ensure_lun_group(&host.id, &request.lun_id).await?;
        self.ensure_mapping_view(&host.id, &host_group_id, &lun_group_id)
            .await?;

        let host_lun_number = self.client.host_lun_id(&host.id, &request.lun_id).await?;
        info!(
            "Mapped lun {} to host {} ({}) as host lun {}",
            request.lun_id, request.host.name, host.id, host_lun_number
        );
        Ok(ConnectionInfo::from_binding(
            request.protocol,
            binding,
            host_lun_number,
        ))
    }

    /// Withdraw a LUN from a host, removing objects nothing else uses
    #[instrument(skip(self, request), fields(host = %request.host_name, lun = %request.lun_id, protocol = %request.protocol))]
    pub async fn delete_mapping(&self, request: &DetachRequest) -> Result<()> {
        if request.host_name.is_empty() || request.lun_id.is_empty() {
            return Err(Error::ApiValidation("host name and lun id are required".into()));
        }
        let handler = self.protocols.get(request.protocol)?;

        let host = match self.get_host(&request.host_name).await? {
            Some(host) => host,
            None => {
                info!("Host {} does not exist, nothing to detach", request.host_name);
                return Ok(());
            }
        };
        let lun_group = self.client.find_lun_group(&self.naming.lun_group(&host.id)).await?;
        let host_group = self.client.find_host_group(&self.naming.host_group(&host.id)).await?;
        let view = self
            .client
            .find_mapping_view(&self.naming.mapping_view(&host.id))
            .await?;

        if let Some(lun_group) = &lun_group {
            if self.client.is_lun_in_lun_group(&lun_group.id, &request.lun_id).await? {
                self.client
                    .remove_lun_from_lun_group(&lun_group.id, &request.lun_id)
                    .await?;
            }
            let remaining = self.client.lun_group_object_count(&lun_group.id).await?;
            if remaining > 0 {
                info!(
                    "Lun group {} still holds {} objects, keeping the mapping of host {}",
                    lun_group.name, remaining, host.id
                );
                return Ok(());
            }
        }

        if let Some(view) = &view {
            if let Some(lun_group) = &lun_group {
                if self.client.is_lun_group_in_view(&view.id, &lun_group.id).await? {
                    self.client.remove_lun_group_from_view(&view.id, &lun_group.id).await?;
                }
            }
            if let Some(host_group) = &host_group {
                if self.client.is_host_group_in_view(&view.id, &host_group.id).await? {
                    self.client
                        .remove_host_group_from_view(&view.id, &host_group.id)
                        .await?;
                }
            }
            self.client.delete_mapping_view(&view.id).await?;
        }
        if let Some(lun_group) = &lun_group {
            self.client.delete_lun_group(&lun_group.id).await?;
        }

        handler
            .detach(&self.client, &host.id, &request.initiators)
            .await?;
        let remaining = self.remaining_initiators(&host.id).await?;
        if remaining > 0 {
            info!("Host {} keeps {} other initiators", host.id, remaining);
            return Ok(());
        }

        if let Some(host_group) = &host_group {
            if self.client.is_host_in_host_group(&host_group.id, &host.id).await? {
                self.client
                    .remove_host_from_host_group(&host_group.id, &host.id)
                    .await?;
            }
            let hosts = self.client.hosts_in_host_group(&host_group.id).await?;
            let views = self.client.views_of_host_group(&host_group.id).await?;
            if hosts.is_empty() && views.is_empty() {
                self.client.delete_host_group(&host_group.id).await?;
            } else {
                debug!(
                    "Host group {} still has {} hosts and {} views",
                    host_group.name,
                    hosts.len(),
                    views.len()
                );
            }
        }

        let other_groups = self.client.host_groups_of_host(&host.id).await?;
        if !other_groups.is_empty() {
            warn!(
                "Host {} is still in {} host groups not managed here, keeping it",
                host.id,
                other_groups.len()
            );
            return Ok(());
        }
        self.client.delete_host(&host.id).await?;
        info!("Removed host {} ({})", request.host_name, host.id);
        Ok(())
    }

    /// Resolve a requester host name to its array host
    pub async fn get_host(&self, host_name: &str) -> Result<Option<Host>> {
        self.client.find_host(&self.naming.host_name(host_name)).await
    }

    // =========================================================================
    // Find-or-create Steps
    // =========================================================================

    async fn ensure_host(&self, info: &HostInfo) -> Result<Host> {
        let name = self.naming.host_name(&info.name);
        if let Some(host) = self.client.find_host(&name).await? {
            debug!("Found host {} ({})", name, host.id);
            return Ok(host);
        }
        self.client
            .create_host(&name, os_type_code(&info.os_type), &info.ip, &info.name)
            .await
    }

    async fn ensure_host_group(&self, host_id: &str) -> Result<String> {
        let name = self.naming.host_group(host_id);
        let group = match self.client.find_host_group(&name).await? {
            Some(group) => group,
            None => self.client.create_host_group(&name).await?,
        };
        if !self.client.is_host_in_host_group(&group.id, host_id).await? {
            self.client.add_host_to_host_group(&group.id, host_id).await?;
        }
        Ok(group.id)
    }

    async fn ensure_lun_group(&self, host_id: &str, lun_id: &str) -> Result<String> {
        let name = self.naming.lun_group(host_id);
        let group = match self.client.find_lun_group(&name).await? {
            Some(group) => group,
            None => self.client.create_lun_group(&name).await?,
        };
        if !self.client.is_lun_in_lun_group(&group.id, lun_id).await? {
            self.client.add_lun_to_lun_group(&group.id, lun_id).await?;
        }
        Ok(group.id)
    }

    async fn ensure_mapping_view(&self, host_id: &str, host_group_id: &str, lun_group_id: &str) -> Result<String> {
        let name = self.naming.mapping_view(host_id);
        let view = match self.client.find_mapping_view(&name).await? {
            Some(view) => view,
            None => self.client.create_mapping_view(&name).await?,
        };
        if !self.client.is_host_group_in_view(&view.id, host_group_id).await? {
            self.client.add_host_group_to_view(&view.id, host_group_id).await?;
        }
        if !self.client.is_lun_group_in_view(&view.id, lun_group_id).await? {
            self.client.add_lun_group_to_view(&view.id, lun_group_id).await?;
        }
        Ok(view.id)
    }

    async fn remaining_initiators(&self, host_id: &str) -> Result<usize> {
        let mut count = 0;
        for protocol in self.protocols.protocols() {
            let handler = self.protocols.get(protocol)?;
            count += handler.host_initiators(&self.client, host_id).await?.len();
        }
        Ok(count)
    }
}

fn validate_attach(request: &AttachRequest) -> Result<()> {
    if request.host.name.is_empty() {
        return Err(Error::ApiValidation("host name is required".into()));
    }
    if request.lun_id.is_empty() {
        return Err(Error::ApiValidation("lun id is required".into()));
    }
    if request.host.initiators.iter().all(|i| i.trim().is_empty()) {
        return Err(Error::ApiValidation("at least one initiator is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::SimulatedArray;
    use crate::config::DriverConfig;
    use crate::domain::ports::AccessProtocol;
    use assert_matches::assert_matches;

    const IQN: &str = "iqn.1994-05.com.redhat:node01";

    fn orchestrator() -> (Arc<SimulatedArray>, MappingOrchestrator) {
        let array = Arc::new(SimulatedArray::new("a"));
        array.add_iscsi_target_port("iqn.2006-08.com.huawei:oceanstor:2100", "192.168.10.21");
        array.add_lun("11", "vol-a");
        array.add_lun("12", "vol-b");
        let registry = Arc::new(ProtocolRegistry::with_defaults(&DriverConfig::default()));
        let orchestrator = MappingOrchestrator::new(
            ArrayClient::new(array.clone()),
            registry,
            NamingConfig::default(),
        );
        (array, orchestrator)
    }

    fn attach(lun: &str) -> AttachRequest {
        AttachRequest {
            host: HostInfo {
                name: "node01".into(),
                ip: "10.0.0.5".into(),
                os_type: "linux".into(),
                initiators: vec![IQN.into()],
            },
            lun_id: lun.into(),
            protocol: AccessProtocol::Iscsi,
        }
    }

    fn detach(lun: &str) -> DetachRequest {
        DetachRequest {
            host_name: "node01".into(),
            lun_id: lun.into(),
            protocol: AccessProtocol::Iscsi,
            initiators: vec![],
        }
    }

    #[tokio::test]
    async fn test_validation() {
        let (_, orchestrator) = orchestrator();
        let mut request = attach("11");
        request.host.initiators.clear();
        assert_matches!(
            orchestrator.create_mapping(&request).await,
            Err(Error::ApiValidation(_))
        );

        assert_matches!(
            orchestrator.create_mapping(&attach("404")).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_host_lun_numbers_distinct() {
        let (_, orchestrator) = orchestrator();
        let first = orchestrator.create_mapping(&attach("11")).await.unwrap();
        let second = orchestrator.create_mapping(&attach("12")).await.unwrap();
        assert_eq!(first.host_lun_number, 1);
        assert_eq!(second.host_lun_number, 2);
    }

    #[tokio::test]
    async fn test_detach_unknown_host_is_noop() {
        let (array, orchestrator) = orchestrator();
        orchestrator.delete_mapping(&detach("11")).await.unwrap();
        assert!(array.host_names().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_keeps_lun_group() {
        let (array, orchestrator) = orchestrator();
        orchestrator.create_mapping(&attach("11")).await.unwrap();
        let host = orchestrator.get_host("node01").await.unwrap().unwrap();
        let lun_group = orchestrator.naming().lun_group(&host.id);
        assert!(array.add_snapshot_to_lun_group(&lun_group, "snap-1"));

        orchestrator.delete_mapping(&detach("11")).await.unwrap();

        assert_eq!(array.lun_group_names(), vec![lun_group]);
        assert!(array.lun_group_members(&orchestrator.naming().lun_group(&host.id)).is_empty());
        assert_eq!(array.mapping_view_names().len(), 1);
        assert!(orchestrator.get_host("node01").await.unwrap().is_some());
    }
}
