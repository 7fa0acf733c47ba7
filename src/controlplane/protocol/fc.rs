//! Fibre Channel handler
//!
//! Zoning resolution: only WWNs the array currently sees online are used,
//! a WWN owned by another host is a conflict and is never moved, and a host
//! object left without initiators or groups by a failed attempt is removed.

use super::ProtocolHandler;
use crate::array::ArrayClient;
use crate::domain::ports::{AccessProtocol, TargetBinding};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, instrument, warn};

/// Split comma-separated WWN lists and normalize case
pub fn normalize_wwns(initiators: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    initiators
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(|wwn| wwn.trim().to_lowercase())
        .filter(|wwn| !wwn.is_empty())
        .filter(|wwn| seen.insert(wwn.clone()))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct FcHandler;

impl FcHandler {
    pub fn new() -> Self {
        Self
    }

    /// Remove a host that a failed attempt left with nothing attached
    async fn remove_orphan_host(&self, client: &ArrayClient, host_id: &str, had_initiators: bool) -> Result<()> {
        if had_initiators {
            return Ok(());
        }
        let iscsi = client.iscsi_initiators_of_host(host_id).await?;
        let groups = client.host_groups_of_host(host_id).await?;
        if iscsi.is_empty() && groups.is_empty() {
            warn!("Removing orphan host {} left by a failed attach", host_id);
            client.delete_host(host_id).await?;
        }
        Ok(())
    }

    async fn resolve_targets(&self, client: &ArrayClient, wwns: &[String]) -> Result<TargetBinding> {
        let mut binding = TargetBinding::default();
        let mut all_targets = BTreeSet::new();
        for wwn in wwns {
            let targets = client.fc_target_wwns(wwn).await?;
            all_targets.extend(targets.iter().cloned());
            binding.initiator_target_map.insert(wwn.clone(), targets);
        }
        binding.target_addresses = all_targets.into_iter().collect();
        binding.target_identifiers = binding.target_addresses.clone();
        Ok(binding)
    }
}

#[async_trait]
impl ProtocolHandler for FcHandler {
    fn protocol(&self) -> AccessProtocol {
        AccessProtocol::Fc
    }

    #[instrument(skip(self, client), fields(array = client.array_name()))]
    async fn attach(&self, client: &ArrayClient, host_id: &str, initiators: &[String]) -> Result<TargetBinding> {
        let requested = normalize_wwns(initiators);

        let (on_host, free, all) = futures::try_join!(
            client.fc_initiators_of_host(host_id),
            client.free_fc_initiators(),
            client.all_fc_initiators(),
        )?;
        let on_host: BTreeSet<String> = on_host.into_iter().map(|i| i.id.to_lowercase()).collect();
        let free: BTreeSet<String> = free
            .into_iter()
            .filter(|i| i.is_online())
            .map(|i| i.id.to_lowercase())
            .collect();
        let online: BTreeSet<String> = all
            .into_iter()
            .filter(|i| i.is_online())
            .map(|i| i.id.to_lowercase())
            .collect();

        let (usable, dropped): (Vec<String>, Vec<String>) =
            requested.iter().cloned().partition(|wwn| online.contains(wwn));
        for wwn in &dropped {
            warn!("Fc initiator {} is not online on the array, skipping it", wwn);
        }
        if usable.is_empty() {
            error!("None of the initiators of host {} is online: {:?}", host_id, requested);
            self.remove_orphan_host(client, host_id, !on_host.is_empty()).await?;
            return Err(Error::NoAvailableInitiator { initiators: requested });
        }

        // Every conflict is detected before the first link is made
        let to_link: Vec<&String> = usable.iter().filter(|wwn| !on_host.contains(*wwn)).collect();
        if let Some(owned) = to_link.iter().find(|wwn| !free.contains(**wwn)) {
            error!(
                "Fc initiator {} belongs to another host, refusing to move it to host {}",
                owned, host_id
            );
            self.remove_orphan_host(client, host_id, !on_host.is_empty()).await?;
            return Err(Error::Conflict {
                initiator: owned.to_string(),
                host: host_id.to_string(),
            });
        }

        for wwn in to_link {
            client.link_fc_initiator(wwn, host_id).await?;
        }

        let binding = self.resolve_targets(client, &usable).await?;
        info!(
            "Host {} reaches {} fc target ports through {} initiators",
            host_id,
            binding.target_addresses.len(),
            usable.len()
        );
        Ok(binding)
    }

    async fn detach(&self, client: &ArrayClient, host_id: &str, initiators: &[String]) -> Result<()> {
        let linked = self.host_initiators(client, host_id).await?;
        let targets = if initiators.is_empty() {
            linked
        } else {
            let requested: BTreeSet<String> = normalize_wwns(initiators).into_iter().collect();
            linked
                .into_iter()
                .filter(|wwn| requested.contains(&wwn.to_lowercase()))
                .collect()
        };
        for wwn in &targets {
            client.unlink_fc_initiator(wwn).await?;
        }
        Ok(())
    }

    async fn host_initiators(&self, client: &ArrayClient, host_id: &str) -> Result<Vec<String>> {
        Ok(client
            .fc_initiators_of_host(host_id)
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect())
    }
}

/// Initiator to target map restricted to the given initiators
pub fn restrict_target_map(
    map: &BTreeMap<String, Vec<String>>,
    initiators: &[String],
) -> BTreeMap<String, Vec<String>> {
    let wanted: BTreeSet<String> = normalize_wwns(initiators).into_iter().collect();
    map.iter()
        .filter(|(wwn, _)| wanted.contains(*wwn))
        .map(|(wwn, targets)| (wwn.clone(), targets.clone()))
        .collect()
}
