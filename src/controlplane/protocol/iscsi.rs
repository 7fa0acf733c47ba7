//! iSCSI handler

use super::ProtocolHandler;
use crate::array::ArrayClient;
use crate::config::IscsiConfig;
use crate::domain::ports::{AccessProtocol, TargetBinding};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

/// Links IQNs to hosts and hands out the configured target portals
#[derive(Debug, Clone, Default)]
pub struct IscsiHandler {
    config: IscsiConfig,
}

impl IscsiHandler {
    pub fn new(config: IscsiConfig) -> Self {
        Self { config }
    }

    async fn ensure_linked(&self, client: &ArrayClient, host_id: &str, iqn: &str) -> Result<()> {
        let initiator = match client.get_iscsi_initiator(iqn).await? {
            Some(initiator) => initiator,
            None => {
                client.create_iscsi_initiator(iqn).await?;
                client
                    .get_iscsi_initiator(iqn)
                    .await?
                    .ok_or_else(|| Error::not_found("iscsi initiator", iqn))?
            }
        };

        if initiator.parent_id == host_id {
            debug!("Iscsi initiator {} already linked to host {}", iqn, host_id);
            return Ok(());
        }
        if !initiator.parent_id.is_empty() {
            error!(
                "Iscsi initiator {} belongs to host {}, refusing to move it to host {}",
                iqn, initiator.parent_id, host_id
            );
            return Err(Error::Conflict {
                initiator: iqn.to_string(),
                host: host_id.to_string(),
            });
        }
        client.link_iscsi_initiator(iqn, host_id).await
    }

    async fn portals(&self, client: &ArrayClient) -> Result<TargetBinding> {
        let mut binding = TargetBinding::default();
        for portal in client.iscsi_portals().await? {
            if !self.config.target_ips.is_empty() && !self.config.target_ips.contains(&portal.ip) {
                continue;
            }
            binding
                .target_addresses
                .push(format!("{}:{}", portal.ip, self.config.port));
            binding.target_identifiers.push(portal.iqn);
        }
        if binding.target_addresses.is_empty() {
            return Err(Error::Configuration(format!(
                "array exposes no iscsi portal matching {:?}",
                self.config.target_ips
            )));
        }
        Ok(binding)
    }
}

#[async_trait]
impl ProtocolHandler for IscsiHandler {
    fn protocol(&self) -> AccessProtocol {
        AccessProtocol::Iscsi
    }

    #[instrument(skip(self, client), fields(array = client.array_name()))]
    async fn attach(&self, client: &ArrayClient, host_id: &str, initiators: &[String]) -> Result<TargetBinding> {
        for iqn in initiators {
            self.ensure_linked(client, host_id, iqn).await?;
        }
        let binding = self.portals(client).await?;
        info!(
            "Host {} reaches {} iscsi portals",
            host_id,
            binding.target_addresses.len()
        );
        Ok(binding)
    }

    async fn detach(&self, client: &ArrayClient, host_id: &str, initiators: &[String]) -> Result<()> {
        let linked = self.host_initiators(client, host_id).await?;
        let targets: Vec<String> = if initiators.is_empty() {
            linked
        } else {
            for iqn in initiators.iter().filter(|iqn| !linked.contains(*iqn)) {
                warn!("Iscsi initiator {} is not linked to host {}, leaving it alone", iqn, host_id);
            }
            linked
                .into_iter()
                .filter(|iqn| initiators.contains(iqn))
                .collect()
        };
        for iqn in &targets {
            client.unlink_iscsi_initiator(iqn).await?;
        }
        Ok(())
    }

    async fn host_initiators(&self, client: &ArrayClient, host_id: &str) -> Result<Vec<String>> {
        Ok(client
            .iscsi_initiators_of_host(host_id)
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::SimulatedArray;
    use crate::domain::ports::ArrayGateway;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const IQN: &str = "iqn.1994-05.com.redhat:node01";

    async fn setup(config: IscsiConfig) -> (Arc<SimulatedArray>, ArrayClient, IscsiHandler, String) {
        let array = Arc::new(SimulatedArray::new("a"));
        array.add_iscsi_target_port("iqn.2006-08.com.huawei:oceanstor:2100", "192.168.10.21");
        array.add_iscsi_target_port("iqn.2006-08.com.huawei:oceanstor:2100", "192.168.10.22");
        let client = ArrayClient::new(array.clone());
        let host = client.create_host("node01", "0", "", "").await.unwrap();
        (array, client, IscsiHandler::new(config), host.id)
    }

    #[tokio::test]
    async fn test_attach_links_and_filters_portals() {
        let config = IscsiConfig {
            target_ips: vec!["192.168.10.22".into()],
            port: 3260,
        };
        let (array, client, handler, host_id) = setup(config).await;

        let binding = handler
            .attach(&client, &host_id, &[IQN.to_string()])
            .await
            .unwrap();
        assert_eq!(binding.target_addresses, vec!["192.168.10.22:3260".to_string()]);
        assert_eq!(
            binding.target_identifiers,
            vec!["iqn.2006-08.com.huawei:oceanstor:2100:192.168.10.22".to_string()]
        );
        assert_eq!(array.iscsi_initiator_owner(IQN), Some(host_id.clone()));

        // Second attach is a no-op on the link
        handler.attach(&client, &host_id, &[IQN.to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_initiator_of_other_host_is_conflict() {
        let (array, client, handler, host_id) = setup(IscsiConfig::default()).await;
        let other = client.create_host("node02", "0", "", "").await.unwrap();
        handler.attach(&client, &other.id, &[IQN.to_string()]).await.unwrap();

        assert_matches!(
            handler.attach(&client, &host_id, &[IQN.to_string()]).await,
            Err(Error::Conflict { .. })
        );
        assert_eq!(array.iscsi_initiator_owner(IQN), Some(other.id));
    }

    #[tokio::test]
    async fn test_detach_all_when_none_named() {
        let (array, client, handler, host_id) = setup(IscsiConfig::default()).await;
        handler.attach(&client, &host_id, &[IQN.to_string()]).await.unwrap();

        handler.detach(&client, &host_id, &[]).await.unwrap();
        assert_eq!(array.iscsi_initiator_owner(IQN), None);
        assert!(handler.host_initiators(&client, &host_id).await.unwrap().is_empty());

        // The array rejects the host while an initiator is linked; now it can go
        assert!(array.delete(&format!("/host/{}", host_id)).await.is_ok());
    }

    #[tokio::test]
    async fn test_detach_leaves_other_hosts_initiators() {
        let (array, client, handler, host_id) = setup(IscsiConfig::default()).await;
        let other = client.create_host("node02", "0", "", "").await.unwrap();
        let other_iqn = "iqn.1994-05.com.redhat:node02";
        handler.attach(&client, &host_id, &[IQN.to_string()]).await.unwrap();
        handler.attach(&client, &other.id, &[other_iqn.to_string()]).await.unwrap();

        handler
            .detach(&client, &host_id, &[other_iqn.to_string(), IQN.to_string()])
            .await
            .unwrap();

        assert_eq!(array.iscsi_initiator_owner(IQN), None);
        assert_eq!(array.iscsi_initiator_owner(other_iqn), Some(other.id));
    }
}
