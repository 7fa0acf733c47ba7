//! Replica state driver
//!
//! Primitive operations on one replication pair as seen from one array, each
//! followed by a wait that confirms the array applied it. The acceptance
//! sets below are the only place the pair state vocabulary is interpreted.

use crate::array::model::{HealthStatus, ReplicationPair, RunningStatus, SecondaryAccess};
use crate::array::ArrayClient;
use crate::error::{Error, Result};
use crate::wait::Waiter;
use tracing::{error, info, instrument, warn};

/// Replication running or about to run
pub const SYNC_STARTED: &[RunningStatus] = &[
    RunningStatus::Normal,
    RunningStatus::Synchronizing,
    RunningStatus::InitialSync,
];

/// Data transfer in progress
pub const SYNCHRONIZING: &[RunningStatus] = &[RunningStatus::Synchronizing, RunningStatus::InitialSync];

/// Both copies identical
pub const SYNC_COMPLETE: &[RunningStatus] = &[RunningStatus::Normal, RunningStatus::Synced];

/// Replication stopped
pub const STOPPED: &[RunningStatus] = &[
    RunningStatus::Split,
    RunningStatus::Invalid,
    RunningStatus::Interrupted,
];

pub const HEALTHY: &[HealthStatus] = &[HealthStatus::Normal];

/// Drives one side of a replication pair
#[derive(Debug, Clone)]
pub struct ReplicaDriver {
    client: ArrayClient,
    waiter: Waiter,
}

impl ReplicaDriver {
    pub fn new(client: ArrayClient, waiter: Waiter) -> Self {
        Self { client, waiter }
    }

    pub fn client(&self) -> &ArrayClient {
        &self.client
    }

    /// Current state of the pair from this side
    pub async fn pair(&self, pair_id: &str) -> Result<ReplicationPair> {
        self.client.get_pair(pair_id).await
    }

    /// Read for a wait predicate: transient failures read as "not yet",
    /// a vanished pair ends the wait
    async fn poll_pair(&self, pair_id: &str) -> Result<Option<ReplicationPair>> {
        match self.client.get_pair(pair_id).await {
            Ok(pair) => Ok(Some(pair)),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => {
                warn!("Reading replication pair {} failed, polling again: {}", pair_id, e);
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Secondary Access
    // =========================================================================

    /// Make the secondary LUN read-only
    pub async fn protect_second(&self, pair_id: &str) -> Result<()> {
        self.set_second_access(pair_id, SecondaryAccess::ReadOnly).await
    }

    /// Make the secondary LUN writable
    pub async fn unprotect_second(&self, pair_id: &str) -> Result<()> {
        self.set_second_access(pair_id, SecondaryAccess::ReadWrite).await
    }

    async fn set_second_access(&self, pair_id: &str, access: SecondaryAccess) -> Result<()> {
        let pair = self.pair(pair_id).await?;
        if pair.secondary_access() == Some(access) {
            return Ok(());
        }
        self.client.set_pair_secondary_access(pair_id, access).await?;
        self.wait_second_access(pair_id, access).await
    }

    // =========================================================================
    // State Transitions
    // =========================================================================

    /// Start replication, optionally waiting until both copies match
    #[instrument(skip(self), fields(array = self.client.array_name()))]
    pub async fn sync(&self, pair_id: &str, wait_complete: bool) -> Result<()> {
        self.protect_second(pair_id).await?;
        let pair = self.pair(pair_id).await?;
        if pair.is_sync_mode() && pair.is_running(SYNC_STARTED) {
            info!("Replication pair {} already {}", pair_id, pair.running());
            return Ok(());
        }

        self.client.sync_pair(pair_id).await?;
        self.wait_expect_state(pair_id, SYNC_STARTED, &[]).await?;
        if wait_complete {
            self.wait_replica_ready(pair_id).await?;
        }
        Ok(())
    }

    /// Stop replication
    #[instrument(skip(self), fields(array = self.client.array_name()))]
    pub async fn split(&self, pair_id: &str) -> Result<()> {
        let pair = self.pair(pair_id).await?;
        if pair.is_running(STOPPED) {
            return Ok(());
        }
        if let Err(e) = self.client.split_pair(pair_id).await {
            error!("Splitting replication pair {} failed: {}", pair_id, e);
            return Err(e);
        }
        self.wait_expect_state(pair_id, STOPPED, &[]).await
    }

    /// Make this side the primary
    #[instrument(skip(self), fields(array = self.client.array_name()))]
    pub async fn switch(&self, pair_id: &str) -> Result<()> {
        if self.pair(pair_id).await?.is_primary() {
            info!("Replication pair {} is already primary here", pair_id);
            return Ok(());
        }
        self.split(pair_id).await?;
        self.unprotect_second(pair_id).await?;
        self.client.switch_pair(pair_id).await?;
        self.wait_primary(pair_id).await
    }

    /// Become primary if needed, then replicate
    pub async fn enable(&self, pair_id: &str, wait_sync_complete: bool) -> Result<()> {
        if !self.pair(pair_id).await?.is_primary() {
            self.switch(pair_id).await?;
        }
        self.sync(pair_id, wait_sync_complete).await
    }

    /// Take over from an unreachable primary; must run on the secondary side
    #[instrument(skip(self), fields(array = self.client.array_name()))]
    pub async fn failover(&self, pair_id: &str) -> Result<()> {
        let pair = self.pair(pair_id).await?;
        if pair.is_primary() {
            error!("Refusing to fail over replication pair {} on its primary array", pair_id);
            return Err(Error::InvalidState {
                pair_id: pair_id.to_string(),
                reason: "failover must run on the secondary array".into(),
            });
        }
        if pair.is_running(SYNCHRONIZING) {
            self.wait_replica_ready(pair_id).await?;
        }
        self.split(pair_id).await?;
        self.unprotect_second(pair_id).await?;
        self.switch(pair_id).await?;
        info!("Replication pair {} failed over to array {}", pair_id, self.client.array_name());
        Ok(())
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Wait until synchronization completes; fail as soon as it stops
    pub async fn wait_replica_ready(&self, pair_id: &str) -> Result<()> {
        info!("Waiting for replication pair {} to finish synchronizing", pair_id);
        let what = format!("replication pair {} synchronization", pair_id);
        self.waiter
            .until(&what, || async move {
                let pair = match self.poll_pair(pair_id).await? {
                    Some(pair) => pair,
                    None => return Ok(false),
                };
                if pair.is_running(SYNC_COMPLETE) && pair.is_health(HEALTHY) {
                    return Ok(true);
                }
                if !pair.is_running(SYNCHRONIZING) {
                    return Err(Error::InvalidState {
                        pair_id: pair_id.to_string(),
                        reason: format!("synchronization stopped in state {}", pair.running()),
                    });
                }
                Ok(false)
            })
            .await
    }

    /// Wait for a running status in `running` and, unless empty, a health in `health`
    pub async fn wait_expect_state(
        &self,
        pair_id: &str,
        running: &[RunningStatus],
        health: &[HealthStatus],
    ) -> Result<()> {
        let what = format!("replication pair {} to reach {:?}", pair_id, running);
        self.waiter
            .until(&what, || async move {
                Ok(self.poll_pair(pair_id).await?.map_or(false, |pair| {
                    pair.is_running(running) && (health.is_empty() || pair.is_health(health))
                }))
            })
            .await
    }

    /// Wait for the secondary LUN to report `access`
    pub async fn wait_second_access(&self, pair_id: &str, access: SecondaryAccess) -> Result<()> {
        let what = format!("replication pair {} secondary access {:?}", pair_id, access);
        self.waiter
            .until(&what, || async move {
                Ok(self
                    .poll_pair(pair_id)
                    .await?
                    .map_or(false, |pair| pair.secondary_access() == Some(access)))
            })
            .await
    }

    async fn wait_primary(&self, pair_id: &str) -> Result<()> {
        let what = format!("replication pair {} to become primary", pair_id);
        self.waiter
            .until(&what, || async move {
                Ok(self
                    .poll_pair(pair_id)
                    .await?
                    .map_or(false, |pair| pair.is_primary()))
            })
            .await
    }
}
