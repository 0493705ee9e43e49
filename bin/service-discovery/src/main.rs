use anyhow::{Context, Result};
use router_api::DiscoveryConfig;
use router_consul::ConsulClient;
use router_core::{Discovery, DiscoveryMetrics};
use router_proxy::{AdminServer, HttpPushSink};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod telemetry;

/// Environment variable naming the YAML config when no path argument is given.
const CONFIG_ENV: &str = "DISCOVERY_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    telemetry::init(&config.telemetry)?;

    info!("Starting service-discovery daemon...");

    let metrics = DiscoveryMetrics::new().context("creating metrics registry")?;

    let consul = ConsulClient::new(&config.registry, metrics.clone())?;
    info!(
        address = %config.registry.address,
        datacenters = ?config.registry.datacenters,
        services = ?config.registry.services,
        "Consul client initialized"
    );

    let cancel = CancellationToken::new();
    let mut builder = Discovery::builder(config.clone())
        .registry(Arc::new(consul))
        .metrics(metrics)
        .cancel_token(cancel.clone());

    match HttpPushSink::from_config(&config.publisher)? {
        Some(sink) => {
            info!(url = %sink.url(), "Snapshot push enabled");
            builder = builder.sink(Arc::new(sink));
        }
        None => info!("No push_url configured, snapshot push disabled"),
    }

    let discovery = Arc::new(builder.start()?);

    let listener = TcpListener::bind(config.admin.listen_addr)
        .await
        .with_context(|| format!("binding admin listener on {}", config.admin.listen_addr))?;
    let admin = Arc::new(AdminServer::new(Arc::clone(&discovery)));
    let admin_task = tokio::spawn(admin.serve(listener, cancel.clone()));

    shutdown_signal().await;
    info!("Shutting down...");

    cancel.cancel();
    discovery.shutdown().await;
    if let Err(e) = admin_task.await {
        warn!("Admin server task failed: {}", e);
    }

    info!("service-discovery stopped");
    Ok(())
}

/// Config from the first argument, then `DISCOVERY_CONFIG`, else defaults.
fn load_config() -> Result<DiscoveryConfig> {
    let path = std::env::args().nth(1).or_else(|| std::env::var(CONFIG_ENV).ok());
    match path {
        Some(path) => DiscoveryConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path)),
        None => {
            let config = DiscoveryConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
