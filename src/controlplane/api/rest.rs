//! REST API Handlers
//!
//! Exposes the mapping orchestrator, the replication service and the volume
//! service over HTTP.
//! Bodies are the camelCase request types of [`crate::domain::ports`].

use crate::controlplane::mapping::MappingOrchestrator;
use crate::controlplane::replication::ReplicationService;
use crate::controlplane::volume::VolumeService;
use crate::domain::ports::{
    AttachRequest, CreateReplicationRequest, CreateVolumeFromSnapshotRequest, DetachRequest,
    FailoverRequest, PairRequest,
};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<MappingOrchestrator>,
    replication: Option<Arc<ReplicationService>>,
    volumes: Arc<VolumeService>,
    metrics: Metrics,
}

impl RestRouter {
    /// Create a new REST router; replication routes answer with an error
    /// when no remote array is configured
    pub fn new(
        orchestrator: Arc<MappingOrchestrator>,
        replication: Option<Arc<ReplicationService>>,
        volumes: Arc<VolumeService>,
        metrics: Metrics,
    ) -> Self {
        Self {
            orchestrator,
            replication,
            volumes,
            metrics,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
            replication: self.replication,
            volumes: self.volumes,
            metrics: self.metrics,
        };

        Router::new()
            // Attachment endpoints
            .route("/v1/attachments", post(create_attachment).delete(delete_attachment))
            // Replication endpoints
            .route("/v1/replications", post(create_replication).delete(delete_replication))
            .route("/v1/replications/enable", post(enable_replication))
            .route("/v1/replications/disable", post(disable_replication))
            .route("/v1/replications/failover", post(failover_replication))
            // Volume endpoints
            .route("/v1/volumes/from-snapshot", post(create_volume_from_snapshot))
            // Health and metrics endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(export_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<MappingOrchestrator>,
    replication: Option<Arc<ReplicationService>>,
    volumes: Arc<VolumeService>,
    metrics: Metrics,
}

impl AppState {
    fn replication(&self) -> Result<&ReplicationService> {
        self.replication
            .as_deref()
            .ok_or_else(|| Error::Configuration("no remote array configured".into()))
    }

    /// Run an operation, recording its outcome and duration
    async fn observe<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.metrics.observe(operation, result.is_ok(), started.elapsed());
        if let Err(e) = &result {
            error!("{} failed: {}", operation, e);
        }
        result
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Expose a LUN to a host
async fn create_attachment(
    State(state): State<AppState>,
    Json(request): Json<AttachRequest>,
) -> Response {
    info!("Attaching lun {} to host {}", request.lun_id, request.host.name);
    match state
        .observe("create_mapping", state.orchestrator.create_mapping(&request))
        .await
    {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Withdraw a LUN from a host
async fn delete_attachment(
    State(state): State<AppState>,
    Json(request): Json<DetachRequest>,
) -> Response {
    info!("Detaching lun {} from host {}", request.lun_id, request.host_name);
    match state
        .observe("delete_mapping", state.orchestrator.delete_mapping(&request))
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn create_replication(
    State(state): State<AppState>,
    Json(request): Json<CreateReplicationRequest>,
) -> Response {
    let service = match state.replication() {
        Ok(service) => service,
        Err(e) => return error_response(&e),
    };
    match state
        .observe("create_replication", service.create_replication(&request))
        .await
    {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_replication(
    State(state): State<AppState>,
    Json(request): Json<PairRequest>,
) -> Response {
    let service = match state.replication() {
        Ok(service) => service,
        Err(e) => return error_response(&e),
    };
    no_content(
        state
            .observe("delete_replication", service.delete_replication(&request))
            .await,
    )
}

async fn enable_replication(
    State(state): State<AppState>,
    Json(request): Json<PairRequest>,
) -> Response {
    let service = match state.replication() {
        Ok(service) => service,
        Err(e) => return error_response(&e),
    };
    no_content(
        state
            .observe("enable_replication", service.enable_replication(&request))
            .await,
    )
}

async fn disable_replication(
    State(state): State<AppState>,
    Json(request): Json<PairRequest>,
) -> Response {
    let service = match state.replication() {
        Ok(service) => service,
        Err(e) => return error_response(&e),
    };
    no_content(
        state
            .observe("disable_replication", service.disable_replication(&request))
            .await,
    )
}

async fn failover_replication(
    State(state): State<AppState>,
    Json(request): Json<FailoverRequest>,
) -> Response {
    let service = match state.replication() {
        Ok(service) => service,
        Err(e) => return error_response(&e),
    };
    no_content(
        state
            .observe("failover_replication", service.failover_replication(&request))
            .await,
    )
}

/// Create a LUN filled from a snapshot
async fn create_volume_from_snapshot(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeFromSnapshotRequest>,
) -> Response {
    info!("Creating volume {} from snapshot {}", request.name, request.snapshot_name);
    match state
        .observe(
            "create_volume_from_snapshot",
            state.volumes.create_volume_from_snapshot(&request),
        )
        .await
    {
        Ok(volume) => (StatusCode::CREATED, Json(volume)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check: the local array answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.client().system_info().await {
        Ok(_) => (StatusCode::OK, "ready".to_string()),
        Err(e) => {
            warn!("Array not reachable: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, format!("array not reachable: {}", e))
        }
    }
}

async fn export_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok((content_type, body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn no_content(result: Result<()>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// HTTP status and error tag for a driver error
fn classify(e: &Error) -> (StatusCode, &'static str) {
    match e {
        Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        Error::RemoteObject { .. } if e.is_not_found() => (StatusCode::NOT_FOUND, "not_found"),
        Error::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        Error::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        Error::ApiValidation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        Error::MissingMetadata { .. } => (StatusCode::BAD_REQUEST, "missing_metadata"),
        Error::UnsupportedProtocol { .. } => (StatusCode::BAD_REQUEST, "unsupported_protocol"),
        Error::RemoteObject { .. } => (StatusCode::BAD_GATEWAY, "array_error"),
        Error::Http(_) => (StatusCode::BAD_GATEWAY, "array_unreachable"),
        Error::Authentication(_) => (StatusCode::BAD_GATEWAY, "array_authentication"),
        Error::RemoteDeviceUnavailable { .. } => (StatusCode::BAD_GATEWAY, "remote_device_unavailable"),
        Error::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
        Error::NoAvailableInitiator { .. } => (StatusCode::CONFLICT, "no_available_initiator"),
        Error::LunCopyFailed { .. } => (StatusCode::BAD_GATEWAY, "lun_copy_failed"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

fn error_response(e: &Error) -> Response {
    let (status, tag) = classify(e);
    (
        status,
        Json(ApiErrorResponse {
            error: tag.into(),
            message: e.to_string(),
            details: e.remote_code().map(|code| format!("array error code {}", code)),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::model::codes;
    use crate::array::{ArrayClient, SimulatedArray};
    use crate::config::{DriverConfig, NamingConfig};
    use crate::controlplane::protocol::ProtocolRegistry;
    use crate::controlplane::replication::ReplicaPairManager;
    use crate::domain::ports::{ConnectionInfo, VolumeInfo};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn router(with_replication: bool) -> (Arc<SimulatedArray>, Metrics, Router) {
        let (local, remote) = SimulatedArray::pair("site-a", "site-b");
        local.add_iscsi_target_port("iqn.2006-08.com.huawei:oceanstor:2100", "192.168.10.21");
        local.add_lun("11", "vol-a");
        local.add_storage_pool("0", "StoragePool001", 100);
        local.add_snapshot("s1", "snap-a", "11");
        let config = DriverConfig::default();
        let orchestrator = Arc::new(MappingOrchestrator::new(
            ArrayClient::new(local.clone()),
            Arc::new(ProtocolRegistry::with_defaults(&config)),
            NamingConfig::default(),
        ));
        let replication = with_replication.then(|| {
            Arc::new(ReplicationService::new(ReplicaPairManager::new(
                ArrayClient::new(local.clone()),
                ArrayClient::new(remote.clone()),
                &config,
            )))
        });
        let volumes = Arc::new(VolumeService::new(ArrayClient::new(local.clone()), &config));
        let metrics = Metrics::new().unwrap();
        let app = RestRouter::new(orchestrator, replication, volumes, metrics.clone()).build();
        (local, metrics, app)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn attachment() -> Value {
        json!({
            "host": {
                "name": "node01",
                "ip": "10.0.0.5",
                "osType": "linux",
                "initiators": ["iqn.1994-05.com.redhat:node01"]
            },
            "lunId": "11",
            "protocol": "iscsi"
        })
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let (array, metrics, app) = router(false);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/v1/attachments", attachment()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info: ConnectionInfo = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(info.host_lun_number, 1);
        assert_eq!(info.target_addresses, vec!["192.168.10.21:3260".to_string()]);

        let detach = json!({
            "hostName": "node01",
            "lunId": "11",
            "protocol": "iscsi"
        });
        let response = app
            .oneshot(json_request("DELETE", "/v1/attachments", detach))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(array.host_names().is_empty());
        assert_eq!(metrics.count("create_mapping", "success"), 1);
        assert_eq!(metrics.count("delete_mapping", "success"), 1);
    }

    #[tokio::test]
    async fn test_unknown_lun_is_not_found() {
        let (_, metrics, app) = router(false);
        let mut body = attachment();
        body["lunId"] = json!("404");

        let response = app
            .oneshot(json_request("POST", "/v1/attachments", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let error: ApiErrorResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(error.error, "not_found");
        assert_eq!(metrics.count("create_mapping", "failure"), 1);
    }

    #[tokio::test]
    async fn test_missing_pair_id_is_bad_request() {
        let (_, _, app) = router(true);
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/replications/enable",
                json!({"isPrimary": true, "metadata": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_replication_requires_remote_array() {
        let (_, _, app) = router(false);
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/replications/disable",
                json!({"isPrimary": true, "metadata": {"pair_id": "1"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_secondary_side_create_is_noop() {
        let (array, _, app) = router(true);
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/replications",
                json!({"isPrimary": false, "localLunId": "11", "remoteLunId": "21", "mode": "sync"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await, json!({"metadata": {}}));
        assert!(array.pair_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_from_snapshot() {
        let (array, metrics, app) = router(false);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/volumes/from-snapshot",
                json!({"name": "vol-a-clone", "snapshotName": "snap-a"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let volume: VolumeInfo = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(volume.name, "vol-a-clone");
        assert_eq!(volume.capacity_gb, 10);
        assert!(array.lun_ids().contains(&volume.lun_id));

        array.fail_next_lun_copy();
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/volumes/from-snapshot",
                json!({"name": "vol-a-clone2", "snapshotName": "snap-a"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let error: ApiErrorResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(error.error, "lun_copy_failed");
        assert_eq!(metrics.count("create_volume_from_snapshot", "success"), 1);
        assert_eq!(metrics.count("create_volume_from_snapshot", "failure"), 1);
    }

    #[tokio::test]
    async fn test_health_ready_and_metrics() {
        let (array, _, app) = router(false);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        array.inject_failure("GET", "/system", codes::PARAMETER_ERROR);
        let response = app
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_error_status_mapping() {
        let timeout = Error::Timeout {
            what: "lun 11 to come online".into(),
            after: Duration::from_secs(300),
        };
        assert_eq!(classify(&timeout).0, StatusCode::GATEWAY_TIMEOUT);

        let conflict = Error::Conflict {
            initiator: "21000024ff000001".into(),
            host: "3".into(),
        };
        assert_eq!(classify(&conflict).0, StatusCode::CONFLICT);

        assert_eq!(
            classify(&Error::remote(codes::PARAMETER_ERROR, "bad")).0,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            classify(&Error::remote(codes::OBJECT_NOT_FOUND, "gone")).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            classify(&Error::Internal("boom".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
