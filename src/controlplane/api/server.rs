//! API Server
//!
//! Serves the REST API until a shutdown is triggered.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::rest::RestRouter;
use crate::controlplane::mapping::MappingOrchestrator;
use crate::controlplane::replication::ReplicationService;
use crate::controlplane::volume::VolumeService;
use crate::metrics::Metrics;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    orchestrator: Arc<MappingOrchestrator>,
    replication: Option<Arc<ReplicationService>>,
    volumes: Arc<VolumeService>,
    metrics: Metrics,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(
        config: ApiServerConfig,
        orchestrator: Arc<MappingOrchestrator>,
        replication: Option<Arc<ReplicationService>>,
        volumes: Arc<VolumeService>,
        metrics: Metrics,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            orchestrator,
            replication,
            volumes,
            metrics,
            shutdown_tx,
        }
    }

    /// Run the API server until shutdown
    pub async fn run(&self) -> Result<()> {
        info!("Starting API server on {}", self.config.rest_addr);

        let rest_handle = self.spawn_rest_server();

        match rest_handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("REST server task failed: {:?}", e);
                Err(Error::Internal(format!("REST server task failed: {}", e)))
            }
        }
    }

    fn spawn_rest_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let addr = self.config.rest_addr;
        let router = RestRouter::new(
            self.orchestrator.clone(),
            self.replication.clone(),
            self.volumes.clone(),
            self.metrics.clone(),
        );
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move { run_rest_server(addr, router, shutdown_rx).await })
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Handle that can trigger shutdown from another task
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

/// Run the REST API server
async fn run_rest_server(
    addr: SocketAddr,
    router: RestRouter,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let app = router.build();

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        Error::Internal(format!("Failed to bind REST server: {}", e))
    })?;

    info!("REST API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayClient, SimulatedArray};
    use crate::config::{DriverConfig, NamingConfig};
    use crate::controlplane::protocol::ProtocolRegistry;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let client = ArrayClient::new(Arc::new(SimulatedArray::new("a")));
        let config = DriverConfig::default();
        let orchestrator = Arc::new(MappingOrchestrator::new(
            client.clone(),
            Arc::new(ProtocolRegistry::with_defaults(&config)),
            NamingConfig::default(),
        ));
        let volumes = Arc::new(VolumeService::new(client, &config));
        let server = Arc::new(ApiServer::new(
            ApiServerConfig {
                rest_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            },
            orchestrator,
            None,
            volumes,
            Metrics::new().unwrap(),
        ));
        let shutdown = server.shutdown_handle();

        let running = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        // Retry until the server task has subscribed and received the signal
        let stopped = async {
            loop {
                let _ = shutdown.send(());
                if running.is_finished() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), stopped)
            .await
            .unwrap();
    }
}
