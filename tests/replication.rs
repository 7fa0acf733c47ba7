//! Replication lifecycle across a simulated array pair

use assert_matches::assert_matches;
use block_array_driver::array::model::{codes, RunningStatus, SecondaryAccess};
use block_array_driver::domain::ports::PAIR_ID_KEY;
use block_array_driver::{
    ArrayClient, CreateReplicationRequest, DriverConfig, Error, FailoverDirection,
    FailoverRequest, PairRequest, ReplicaPairManager, ReplicationMode, ReplicationService,
    SimulatedArray,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Sites {
    local: Arc<SimulatedArray>,
    remote: Arc<SimulatedArray>,
    service: ReplicationService,
}

fn setup() -> Sites {
    let (local, remote) = SimulatedArray::pair("site-a", "site-b");
    local.add_lun("11", "vol");
    remote.add_lun("21", "vol-replica");
    let manager = ReplicaPairManager::new(
        ArrayClient::new(local.clone()),
        ArrayClient::new(remote.clone()),
        &DriverConfig::default(),
    );
    Sites {
        local,
        remote,
        service: ReplicationService::new(manager),
    }
}

fn create_request(mode: ReplicationMode) -> CreateReplicationRequest {
    CreateReplicationRequest {
        is_primary: true,
        local_lun_id: "11".into(),
        remote_lun_id: "21".into(),
        mode,
        period_seconds: 300,
    }
}

fn pair_request(pair_id: &str) -> PairRequest {
    PairRequest {
        is_primary: true,
        metadata: BTreeMap::from([(PAIR_ID_KEY.to_string(), pair_id.to_string())]),
    }
}

async fn create(sites: &Sites) -> String {
    let outcome = sites
        .service
        .create_replication(&create_request(ReplicationMode::Sync))
        .await
        .unwrap();
    outcome.pair_id().unwrap().to_string()
}

#[tokio::test(start_paused = true)]
async fn test_create_leaves_exactly_one_primary() {
    let sites = setup();
    let pair_id = create(&sites).await;

    let manager = sites.service.manager();
    let local = manager.local_driver().pair(&pair_id).await.unwrap();
    let remote = manager.remote_driver().pair(&pair_id).await.unwrap();
    assert!(local.is_primary());
    assert!(!remote.is_primary());
    assert_eq!(local.running(), RunningStatus::Normal);
    assert_eq!(remote.secondary_access(), Some(SecondaryAccess::ReadOnly));
    assert_eq!(sites.local.pair_ids(), vec![pair_id]);
}

#[tokio::test(start_paused = true)]
async fn test_async_pair_is_started_without_waiting() {
    let sites = setup();
    sites.local.set_sync_reads(50);

    let outcome = sites
        .service
        .create_replication(&create_request(ReplicationMode::Async))
        .await
        .unwrap();
    let pair = sites
        .service
        .manager()
        .local_driver()
        .pair(outcome.pair_id().unwrap())
        .await
        .unwrap();
    assert!(!pair.is_sync_mode());
    assert_eq!(pair.running(), RunningStatus::Synchronizing);
}

#[tokio::test(start_paused = true)]
async fn test_create_waits_for_lun_to_come_online() {
    let sites = setup();
    sites.local.set_lun_initializing("11", 2);

    let started = tokio::time::Instant::now();
    create(&sites).await;
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_failover_promotes_remote_without_touching_local() {
    let sites = setup();
    let pair_id = create(&sites).await;
    let local_requests = sites.local.request_count();

    sites
        .service
        .failover_replication(&FailoverRequest {
            pair: pair_request(&pair_id),
            direction: FailoverDirection::ToSecondary,
        })
        .await
        .unwrap();

    assert_eq!(sites.local.request_count(), local_requests);
    let remote = sites
        .service
        .manager()
        .remote_driver()
        .pair(&pair_id)
        .await
        .unwrap();
    assert!(remote.is_primary());
    assert_eq!(remote.secondary_access(), Some(SecondaryAccess::ReadWrite));
}

#[tokio::test(start_paused = true)]
async fn test_failback_returns_primary_role() {
    let sites = setup();
    let pair_id = create(&sites).await;
    let failover = |direction| FailoverRequest {
        pair: pair_request(&pair_id),
        direction,
    };

    sites
        .service
        .failover_replication(&failover(FailoverDirection::ToSecondary))
        .await
        .unwrap();
    sites
        .service
        .failover_replication(&failover(FailoverDirection::ToPrimary))
        .await
        .unwrap();

    let manager = sites.service.manager();
    let local = manager.local_driver().pair(&pair_id).await.unwrap();
    let remote = manager.remote_driver().pair(&pair_id).await.unwrap();
    assert!(local.is_primary());
    assert!(!remote.is_primary());
    assert!(local.is_running(&[RunningStatus::Normal, RunningStatus::Synchronizing]));
    assert_eq!(local.secondary_access(), Some(SecondaryAccess::ReadOnly));
}

#[tokio::test(start_paused = true)]
async fn test_failed_initial_sync_deletes_pair() {
    let sites = setup();
    sites
        .local
        .inject_failure("PUT", "/REPLICATIONPAIR/sync", codes::PARAMETER_ERROR);

    let result = sites
        .service
        .create_replication(&create_request(ReplicationMode::Sync))
        .await;

    assert_matches!(result, Err(Error::RemoteObject { code, .. }) if code == codes::PARAMETER_ERROR);
    assert!(sites.local.pair_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_enable_disable_and_delete() {
    let sites = setup();
    let pair_id = create(&sites).await;
    let request = pair_request(&pair_id);
    let driver = sites.service.manager().local_driver();

    sites.service.disable_replication(&request).await.unwrap();
    assert_eq!(driver.pair(&pair_id).await.unwrap().running(), RunningStatus::Split);

    sites.service.enable_replication(&request).await.unwrap();
    assert_eq!(driver.pair(&pair_id).await.unwrap().running(), RunningStatus::Normal);

    sites.service.delete_replication(&request).await.unwrap();
    assert!(sites.local.pair_ids().is_empty());

    // Already gone
    sites.service.delete_replication(&request).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_secondary_side_requests_are_noops() {
    let sites = setup();
    let before = (sites.local.request_count(), sites.remote.request_count());

    let mut request = create_request(ReplicationMode::Sync);
    request.is_primary = false;
    let outcome = sites.service.create_replication(&request).await.unwrap();
    assert!(outcome.metadata.is_empty());

    let pair = PairRequest {
        is_primary: false,
        metadata: BTreeMap::new(),
    };
    sites.service.delete_replication(&pair).await.unwrap();
    sites.service.enable_replication(&pair).await.unwrap();
    sites.service.disable_replication(&pair).await.unwrap();
    sites
        .service
        .failover_replication(&FailoverRequest {
            pair,
            direction: FailoverDirection::ToSecondary,
        })
        .await
        .unwrap();

    assert_eq!(
        (sites.local.request_count(), sites.remote.request_count()),
        before
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_pair_id_is_reported() {
    let sites = setup();
    let request = PairRequest {
        is_primary: true,
        metadata: BTreeMap::new(),
    };
    assert_matches!(
        sites.service.delete_replication(&request).await,
        Err(Error::MissingMetadata { .. })
    );
    assert_matches!(
        sites.service.enable_replication(&request).await,
        Err(Error::MissingMetadata { .. })
    );
}
