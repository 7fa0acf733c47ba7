//! Replication pair manager
//!
//! Coordinates the drivers of the two arrays of a pair: creation with
//! rollback, deletion, failover to the remote array and failback.

use super::driver::ReplicaDriver;
use crate::array::model::{object_type, RemoteDevice, REPLICATION_MODE_ASYNC, REPLICATION_MODE_SYNC};
use crate::array::ArrayClient;
use crate::config::DriverConfig;
use crate::domain::ports::{ReplicationMode, PAIR_ID_KEY};
use crate::error::{Error, Result};
use crate::wait::Waiter;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{error, info, instrument, warn};

/// Recovery policy: resume automatically after a link interruption
const RECOVERY_POLICY_AUTO: &str = "1";
/// Synchronize type: timed wait when synchronization begins
const SYNCHRONIZE_TYPE_TIMED: &str = "2";

pub struct ReplicaPairManager {
    local: ArrayClient,
    remote: ArrayClient,
    local_driver: ReplicaDriver,
    remote_driver: ReplicaDriver,
    lun_waiter: Waiter,
    speed: String,
}

impl ReplicaPairManager {
    pub fn new(local: ArrayClient, remote: ArrayClient, config: &DriverConfig) -> Self {
        let replica_waiter = Waiter::new(config.waits.replica_interval(), config.waits.replica_timeout());
        Self {
            local_driver: ReplicaDriver::new(local.clone(), replica_waiter),
            remote_driver: ReplicaDriver::new(remote.clone(), replica_waiter),
            local,
            remote,
            lun_waiter: Waiter::new(
                config.waits.lun_ready_interval(),
                config.waits.lun_ready_timeout(),
            ),
            speed: config.replication.speed.clone(),
        }
    }

    pub fn local_driver(&self) -> &ReplicaDriver {
        &self.local_driver
    }

    pub fn remote_driver(&self) -> &ReplicaDriver {
        &self.remote_driver
    }

    /// Wait for a freshly created LUN to finish formatting
    async fn wait_volume_online(&self, lun_id: &str) -> Result<()> {
        if self.local.get_lun(lun_id).await?.is_ready() {
            return Ok(());
        }
        info!("Waiting for lun {} to come online", lun_id);
        let what = format!("lun {} to come online", lun_id);
        self.lun_waiter
            .until(&what, || async move {
                match self.local.get_lun(lun_id).await {
                    Ok(lun) => Ok(lun.is_ready()),
                    Err(e) if e.is_not_found() => Err(e),
                    Err(e) => {
                        warn!("Reading lun {} failed, polling again: {}", lun_id, e);
                        Ok(false)
                    }
                }
            })
            .await
    }

    /// The remote array as registered on the local one, if replication can use it
    async fn remote_device(&self) -> Result<RemoteDevice> {
        let remote_system = self.remote.system_info().await.map_err(|e| {
            Error::RemoteDeviceUnavailable {
                reason: format!("cannot reach array {}: {}", self.remote.array_name(), e),
            }
        })?;
        let device = self
            .local
            .list_remote_devices()
            .await?
            .into_iter()
            .find(|d| d.wwn == remote_system.wwn)
            .ok_or_else(|| Error::RemoteDeviceUnavailable {
                reason: format!(
                    "array {} (wwn {}) is not registered on {}",
                    self.remote.array_name(),
                    remote_system.wwn,
                    self.local.array_name()
                ),
            })?;
        if !device.is_usable_for_replication() {
            return Err(Error::RemoteDeviceUnavailable {
                reason: format!(
                    "remote device {} is not usable (type {}, health {}, link {})",
                    device.name, device.array_type, device.health_status, device.running_status
                ),
            });
        }
        Ok(device)
    }

    /// Create a pair replicating `local_lun_id` onto `remote_lun_id` and start it
    #[instrument(skip(self))]
    pub async fn create_replication(
        &self,
        local_lun_id: &str,
        remote_lun_id: &str,
        mode: ReplicationMode,
        period_seconds: u64,
    ) -> Result<BTreeMap<String, String>> {
        self.wait_volume_online(local_lun_id).await?;
        let device = self.remote_device().await?;

        let mode_code = match mode {
            ReplicationMode::Sync => REPLICATION_MODE_SYNC,
            ReplicationMode::Async => REPLICATION_MODE_ASYNC,
        };
        let mut params = json!({
            "LOCALRESID": local_lun_id,
            "LOCALRESTYPE": object_type::LUN,
            "REMOTEDEVICEID": device.id,
            "REMOTEDEVICENAME": device.name,
            "REMOTERESID": remote_lun_id,
            "REPLICATIONMODEL": mode_code,
            "RECOVERYPOLICY": RECOVERY_POLICY_AUTO,
            "SPEED": self.speed,
        });
        if mode == ReplicationMode::Async {
            params["SYNCHRONIZETYPE"] = json!(SYNCHRONIZE_TYPE_TIMED);
            params["TIMINGVAL"] = json!(period_seconds.to_string());
        }
        let pair = self.local.create_pair(params).await?;

        if let Err(e) = self
            .local_driver
            .sync(&pair.id, mode == ReplicationMode::Sync)
            .await
        {
            error!("Initial sync of replication pair {} failed, rolling back: {}", pair.id, e);
            if let Err(rollback) = self.delete_pair(&pair.id).await {
                error!("Rollback of replication pair {} failed: {}", pair.id, rollback);
            }
            return Err(e);
        }

        info!(
            "Replicating lun {} to lun {} on {} through pair {}",
            local_lun_id,
            remote_lun_id,
            self.remote.array_name(),
            pair.id
        );
        Ok(BTreeMap::from([(PAIR_ID_KEY.to_string(), pair.id)]))
    }

    /// Split and delete a pair; a pair that no longer exists is already deleted
    #[instrument(skip(self))]
    pub async fn delete_pair(&self, pair_id: &str) -> Result<()> {
        if !self.local.pair_exists(pair_id).await? {
            info!("Replication pair {} does not exist", pair_id);
            return Ok(());
        }
        self.local_driver.split(pair_id).await?;
        self.local.delete_pair(pair_id).await
    }

    /// Hand the primary role back to the local array.
    ///
    /// The remote copy is brought in sync first so a writable, current copy
    /// exists at every point of the sequence.
    #[instrument(skip(self))]
    pub async fn failback(&self, pair_id: &str) -> Result<()> {
        self.remote_driver.enable(pair_id, true).await?;
        self.remote_driver.wait_replica_ready(pair_id).await?;
        self.local_driver.enable(pair_id, false).await?;
        info!("Replication pair {} failed back to {}", pair_id, self.local.array_name());
        Ok(())
    }

    /// Promote the remote array without contacting the local one
    #[instrument(skip(self))]
    pub async fn failover(&self, pair_id: &str) -> Result<()> {
        self.remote_driver.failover(pair_id).await
    }
}
