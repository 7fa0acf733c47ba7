//! Replication entry points
//!
//! Pair operations are driven from the primary side only. A request that
//! arrives for the secondary side succeeds without touching either array.

use super::manager::ReplicaPairManager;
use crate::domain::ports::{
    CreateReplicationRequest, FailoverDirection, FailoverRequest, PairRequest, ReplicationOutcome,
};
use crate::error::{Error, Result};
use tracing::{info, instrument};

pub struct ReplicationService {
    manager: ReplicaPairManager,
}

impl ReplicationService {
    pub fn new(manager: ReplicaPairManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ReplicaPairManager {
        &self.manager
    }

    #[instrument(skip(self, request), fields(local_lun = %request.local_lun_id, remote_lun = %request.remote_lun_id))]
    pub async fn create_replication(&self, request: &CreateReplicationRequest) -> Result<ReplicationOutcome> {
        if !request.is_primary {
            info!("Not the primary side, nothing to create");
            return Ok(ReplicationOutcome::default());
        }
        if request.local_lun_id.is_empty() || request.remote_lun_id.is_empty() {
            return Err(Error::ApiValidation("local and remote lun ids are required".into()));
        }
        let metadata = self
            .manager
            .create_replication(
                &request.local_lun_id,
                &request.remote_lun_id,
                request.mode,
                request.period_seconds,
            )
            .await?;
        Ok(ReplicationOutcome { metadata })
    }

    #[instrument(skip(self, request))]
    pub async fn delete_replication(&self, request: &PairRequest) -> Result<()> {
        if !request.is_primary {
            return Ok(());
        }
        self.manager.delete_pair(request.pair_id()?).await
    }

    #[instrument(skip(self, request))]
    pub async fn enable_replication(&self, request: &PairRequest) -> Result<()> {
        if !request.is_primary {
            return Ok(());
        }
        self.manager.local_driver().enable(request.pair_id()?, true).await
    }

    #[instrument(skip(self, request))]
    pub async fn disable_replication(&self, request: &PairRequest) -> Result<()> {
        if !request.is_primary {
            return Ok(());
        }
        self.manager.local_driver().split(request.pair_id()?).await
    }

    #[instrument(skip(self, request), fields(direction = ?request.direction))]
    pub async fn failover_replication(&self, request: &FailoverRequest) -> Result<()> {
        if !request.pair.is_primary {
            return Ok(());
        }
        let pair_id = request.pair.pair_id()?;
        match request.direction {
            FailoverDirection::ToSecondary => self.manager.failover(pair_id).await,
            FailoverDirection::ToPrimary => self.manager.failback(pair_id).await,
        }
    }
}
