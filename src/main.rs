//! Block Array Driver
//!
//! Serves host attachments and cross-array replication for a block-storage
//! array pair over a REST API.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use block_array_driver::{
    ApiServer, ApiServerConfig, ArrayClient, ArrayGatewayRef, DriverConfig, Error,
    MappingOrchestrator, Metrics, ProtocolRegistry, ReplicaPairManager, ReplicationService,
    RestGateway, Result, SimulatedArray, VolumeService,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Block Array Driver - host attachment and replication control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Driver configuration file (YAML)
    #[arg(long, env = "DRIVER_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Serve against an in-process simulated array pair
    #[arg(long, env = "SIMULATE")]
    simulate: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Block Array Driver");
    info!("  Version: {}", block_array_driver::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Simulated arrays: {}", args.simulate);

    let config = match &args.config {
        Some(path) => DriverConfig::from_file(path)?,
        None if args.simulate => DriverConfig::default(),
        None => {
            return Err(Error::Configuration(
                "--config is required unless --simulate is set".into(),
            ))
        }
    };

    let mut sessions = Vec::new();
    let (local, remote): (ArrayGatewayRef, Option<ArrayGatewayRef>) = if args.simulate {
        let (local, remote) = simulated_arrays();
        (local, Some(remote))
    } else {
        let local = Arc::new(RestGateway::connect("local", config.array.clone()).await?);
        sessions.push(local.clone());
        let remote = match &config.remote_array {
            Some(remote_config) => {
                let remote = Arc::new(RestGateway::connect("remote", remote_config.clone()).await?);
                sessions.push(remote.clone());
                Some(remote as ArrayGatewayRef)
            }
            None => None,
        };
        (local as ArrayGatewayRef, remote)
    };

    let local_client = ArrayClient::new(local);
    let protocols = Arc::new(ProtocolRegistry::with_defaults(&config));
    info!("Access protocols: {:?}", protocols.protocols());

    let orchestrator = Arc::new(MappingOrchestrator::new(
        local_client.clone(),
        protocols,
        config.naming.clone(),
    ));

    let volumes = Arc::new(VolumeService::new(local_client.clone(), &config));

    let replication = match remote {
        Some(remote) => Some(Arc::new(ReplicationService::new(ReplicaPairManager::new(
            local_client,
            ArrayClient::new(remote),
            &config,
        )))),
        None => {
            warn!("No remote array configured, replication is disabled");
            None
        }
    };

    let metrics = Metrics::new()?;

    let api_config = ApiServerConfig {
        rest_addr: args.api_addr.parse().map_err(|e| {
            Error::Configuration(format!("Invalid REST API address: {}", e))
        })?,
    };
    let api_server = ApiServer::new(api_config, orchestrator, replication, volumes, metrics);

    let shutdown = api_server.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown.send(());
    });

    api_server.run().await?;

    for session in sessions {
        if let Err(e) = session.logout().await {
            warn!("Logout failed: {}", e);
        }
    }

    info!("Driver shutdown complete");
    Ok(())
}

/// A replicating array pair with a few LUNs and an iSCSI portal on each side,
/// plus a pool and a snapshot on the local array
fn simulated_arrays() -> (ArrayGatewayRef, ArrayGatewayRef) {
    let (local, remote) = SimulatedArray::pair("sim-local", "sim-remote");
    for (id, name) in [("11", "vol-1"), ("12", "vol-2"), ("13", "vol-3")] {
        local.add_lun(id, name);
    }
    local.add_storage_pool("0", "StoragePool001", 1024);
    local.add_snapshot("101", "vol-1-snap", "11");
    for (id, name) in [("21", "vol-1-replica"), ("22", "vol-2-replica"), ("23", "vol-3-replica")] {
        remote.add_lun(id, name);
    }
    local.add_iscsi_target_port("iqn.2006-08.com.huawei:oceanstor:2100000000000001", "192.168.10.21");
    remote.add_iscsi_target_port("iqn.2006-08.com.huawei:oceanstor:2100000000000002", "192.168.20.21");
    (local as ArrayGatewayRef, remote as ArrayGatewayRef)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
