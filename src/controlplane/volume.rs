//! Volumes created from snapshots
//!
//! A new LUN is created in a pool and filled from a snapshot with an array
//! LUN copy. The copy task is removed once it ends; if the LUN never comes
//! online or the copy fails, the new LUN is deleted again.

use crate::array::model::{gb_to_sectors, sectors_to_gb, LunCopyStatus};
use crate::array::ArrayClient;
use crate::config::DriverConfig;
use crate::domain::ports::{CreateVolumeFromSnapshotRequest, VolumeInfo};
use crate::error::{Error, Result};
use crate::wait::Waiter;
use tracing::{debug, error, info, instrument, warn};

pub struct VolumeService {
    client: ArrayClient,
    lun_waiter: Waiter,
    copy_waiter: Waiter,
    default_pool: String,
    copy_speed: String,
    max_name_length: usize,
}

impl VolumeService {
    pub fn new(client: ArrayClient, config: &DriverConfig) -> Self {
        Self {
            client,
            lun_waiter: Waiter::new(
                config.waits.lun_ready_interval(),
                config.waits.lun_ready_timeout(),
            ),
            copy_waiter: Waiter::new(
                config.waits.lun_copy_interval(),
                config.waits.lun_copy_timeout(),
            ),
            default_pool: config.volume.default_pool.clone(),
            copy_speed: config.volume.copy_speed.clone(),
            max_name_length: config.naming.max_name_length,
        }
    }

    pub fn client(&self) -> &ArrayClient {
        &self.client
    }

    /// Create a LUN holding the contents of a snapshot
    #[instrument(skip(self, request), fields(volume = %request.name, snapshot = %request.snapshot_name))]
    pub async fn create_volume_from_snapshot(&self, request: &CreateVolumeFromSnapshotRequest) -> Result<VolumeInfo> {
        self.validate(request)?;

        let snapshot = self
            .client
            .find_snapshot(&request.snapshot_name)
            .await?
            .ok_or_else(|| Error::not_found("snapshot", &request.snapshot_name))?;
        let pool_name = if request.pool_name.is_empty() {
            self.default_pool.as_str()
        } else {
            request.pool_name.as_str()
        };
        let pool = self
            .client
            .find_storage_pool(pool_name)
            .await?
            .ok_or_else(|| Error::not_found("storage pool", pool_name))?;

        let snapshot_sectors: u64 = snapshot.user_capacity.parse().map_err(|_| {
            Error::Internal(format!(
                "snapshot {} reports capacity {:?}",
                snapshot.name, snapshot.user_capacity
            ))
        })?;
        let capacity = match request.capacity_gb {
            0 => snapshot_sectors,
            gb => gb_to_sectors(gb),
        };
        if capacity < snapshot_sectors {
            return Err(Error::ApiValidation(format!(
                "volume {} of {} GB is smaller than snapshot {} ({} GB)",
                request.name,
                sectors_to_gb(capacity),
                snapshot.name,
                sectors_to_gb(snapshot_sectors)
            )));
        }
        if self.client.find_lun(&request.name).await?.is_some() {
            return Err(Error::ApiValidation(format!("lun {} already exists", request.name)));
        }

        let lun = self
            .client
            .create_lun(&request.name, capacity, &request.description, &pool.id)
            .await?;
        if let Err(e) = self.populate(&lun.id, &snapshot.id).await {
            error!(
                "Filling lun {} from snapshot {} failed: {}",
                lun.id, snapshot.name, e
            );
            self.rollback_lun(&lun.id).await;
            return Err(e);
        }

        let lun = self.client.get_lun(&lun.id).await?;
        info!(
            "Created volume {} ({}) from snapshot {}",
            request.name, lun.id, snapshot.name
        );
        Ok(VolumeInfo {
            lun_id: lun.id,
            name: lun.name,
            wwn: lun.wwn,
            capacity_gb: sectors_to_gb(capacity),
        })
    }

    fn validate(&self, request: &CreateVolumeFromSnapshotRequest) -> Result<()> {
        if request.name.is_empty() || request.snapshot_name.is_empty() {
            return Err(Error::ApiValidation(
                "volume name and snapshot name are required".into(),
            ));
        }
        if request.name.len() > self.max_name_length {
            return Err(Error::ApiValidation(format!(
                "volume name {} is longer than {} characters",
                request.name, self.max_name_length
            )));
        }
        Ok(())
    }

    /// Wait for the new LUN, copy the snapshot onto it and drop the copy task
    async fn populate(&self, lun_id: &str, snapshot_id: &str) -> Result<()> {
        self.wait_lun_online(lun_id).await?;

        let name = format!("copy_{}", lun_id);
        let copy = self
            .client
            .create_lun_copy(&name, snapshot_id, lun_id, &self.copy_speed)
            .await?;
        let result = self.run_copy(&copy.id, &name).await;
        if let Err(e) = self.client.delete_lun_copy(&copy.id).await {
            warn!("Deleting lun copy {} failed: {}", copy.id, e);
        }
        result
    }

    async fn wait_lun_online(&self, lun_id: &str) -> Result<()> {
        if self.client.get_lun(lun_id).await?.is_online() {
            return Ok(());
        }
        let what = format!("lun {} to come online", lun_id);
        self.lun_waiter
            .until(&what, || async move {
                match self.client.get_lun(lun_id).await {
                    Ok(lun) => Ok(lun.is_online()),
                    Err(e) if e.is_not_found() => Err(e),
                    Err(e) => {
                        warn!("Reading lun {} failed, polling again: {}", lun_id, e);
                        Ok(false)
                    }
                }
            })
            .await
    }

    async fn run_copy(&self, copy_id: &str, name: &str) -> Result<()> {
        self.client.start_lun_copy(copy_id).await?;
        let what = format!("lun copy {} to complete", name);
        self.copy_waiter
            .until(&what, || async move {
                let copy = match self.client.get_lun_copy(copy_id).await {
                    Ok(copy) => copy,
                    Err(e) if e.is_not_found() => return Err(e),
                    Err(e) => {
                        warn!("Reading lun copy {} failed, polling again: {}", copy_id, e);
                        return Ok(false);
                    }
                };
                if !copy.is_healthy() {
                    return Err(Error::LunCopyFailed {
                        name: name.to_string(),
                        reason: format!("health status {}", copy.health_status),
                    });
                }
                match copy.status() {
                    LunCopyStatus::Complete => Ok(true),
                    LunCopyStatus::Queuing | LunCopyStatus::Copying => {
                        debug!("Lun copy {} at {}%", name, copy.progress);
                        Ok(false)
                    }
                    other => Err(Error::LunCopyFailed {
                        name: name.to_string(),
                        reason: format!("copy ended in state {:?}", other),
                    }),
                }
            })
            .await
    }

    async fn rollback_lun(&self, lun_id: &str) {
        match self.client.delete_lun(lun_id).await {
            Ok(()) => info!("Deleted lun {} after failed copy", lun_id),
            Err(e) => error!("Rolling back lun {} failed: {}", lun_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::model::codes;
    use crate::array::SimulatedArray;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn setup() -> (Arc<SimulatedArray>, VolumeService) {
        let array = Arc::new(SimulatedArray::new("site-a"));
        array.add_lun("11", "vol-src");
        array.add_storage_pool("0", "StoragePool001", 100);
        array.add_snapshot("s1", "snap-1", "11");
        let service = VolumeService::new(ArrayClient::new(array.clone()), &DriverConfig::default());
        (array, service)
    }

    fn request(name: &str) -> CreateVolumeFromSnapshotRequest {
        CreateVolumeFromSnapshotRequest {
            name: name.into(),
            snapshot_name: "snap-1".into(),
            pool_name: String::new(),
            capacity_gb: 0,
            description: "clone".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_from_snapshot() {
        let (array, service) = setup();

        let volume = service
            .create_volume_from_snapshot(&request("vol-clone"))
            .await
            .unwrap();
        assert_eq!(volume.name, "vol-clone");
        assert_eq!(volume.capacity_gb, 10);
        assert!(!volume.wwn.is_empty());

        let lun = service.client().get_lun(&volume.lun_id).await.unwrap();
        assert!(lun.is_online());
        assert_eq!(array.lun_ids().len(), 2);
        assert!(array.lun_copy_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_larger_volume_than_snapshot() {
        let (_, service) = setup();
        let mut req = request("vol-big");
        req.capacity_gb = 20;

        let volume = service.create_volume_from_snapshot(&req).await.unwrap();
        assert_eq!(volume.capacity_gb, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_copy_deletes_target_lun() {
        let (array, service) = setup();
        array.fail_next_lun_copy();

        let result = service.create_volume_from_snapshot(&request("vol-clone")).await;
        assert_matches!(result, Err(Error::LunCopyFailed { .. }));
        assert_eq!(array.lun_ids(), vec!["11".to_string()]);
        assert!(array.lun_copy_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_copy_start_deletes_target_lun() {
        let (array, service) = setup();
        array.inject_failure("PUT", "/LUNCOPY/start", codes::PARAMETER_ERROR);

        let result = service.create_volume_from_snapshot(&request("vol-clone")).await;
        assert_matches!(result, Err(Error::RemoteObject { code, .. }) if code == codes::PARAMETER_ERROR);
        assert_eq!(array.lun_ids(), vec!["11".to_string()]);
        assert!(array.lun_copy_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lun_never_online_is_rolled_back() {
        let (array, service) = setup();
        array.set_new_lun_init_reads(u32::MAX);

        let result = service.create_volume_from_snapshot(&request("vol-clone")).await;
        assert_matches!(result, Err(Error::Timeout { .. }));
        assert_eq!(array.lun_ids(), vec!["11".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_requests_create_nothing() {
        let (array, service) = setup();

        let mut req = request("vol-clone");
        req.snapshot_name = "snap-missing".into();
        assert_matches!(
            service.create_volume_from_snapshot(&req).await,
            Err(Error::NotFound { kind, .. }) if kind == "snapshot"
        );

        let mut req = request("vol-clone");
        req.pool_name = "pool-missing".into();
        assert_matches!(
            service.create_volume_from_snapshot(&req).await,
            Err(Error::NotFound { kind, .. }) if kind == "storage pool"
        );

        let mut req = request("vol-small");
        req.capacity_gb = 5;
        assert_matches!(
            service.create_volume_from_snapshot(&req).await,
            Err(Error::ApiValidation(_))
        );

        assert_matches!(
            service.create_volume_from_snapshot(&request("vol-src")).await,
            Err(Error::ApiValidation(_))
        );
        assert_matches!(
            service.create_volume_from_snapshot(&request("")).await,
            Err(Error::ApiValidation(_))
        );
        assert_eq!(array.lun_ids(), vec!["11".to_string()]);
    }
}
