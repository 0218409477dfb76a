//! NFS Volume Broker daemon
//!
//! Loads configuration, restores the instance registry and runs the broker
//! with health and metrics endpoints until interrupted.

use clap::Parser;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nfs_volume_broker::config::parse_addr;
use nfs_volume_broker::{
    BackendFactory, Broker, BrokerConfig, BrokerMetrics, Error, InstanceRegistry, Result,
    StoreFactory, StoreKind,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// NFS Volume Broker - provisions NFS volumes and binds applications to them
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Registry state file
    #[arg(long, env = "STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Keep registry state in memory only
    #[arg(long, env = "IN_MEMORY_STATE", conflicts_with = "state_file")]
    in_memory: bool,

    /// Comma-separated mount options callers may set
    #[arg(long, env = "ALLOWED_OPTIONS")]
    allowed_options: Option<String>,

    /// Comma-separated key:value default mount options
    #[arg(long, env = "DEFAULT_OPTIONS")]
    default_options: Option<String>,

    /// Drop unknown mount options instead of rejecting them
    #[arg(long, env = "PERMISSIVE")]
    permissive: bool,

    /// Service name in the catalog
    #[arg(long, env = "SERVICE_NAME")]
    service_name: Option<String>,

    /// Service id in the catalog
    #[arg(long, env = "SERVICE_ID")]
    service_id: Option<String>,

    /// Parent directory for container mount paths
    #[arg(long, env = "CONTAINER_BASE")]
    container_base: Option<String>,

    /// NFS server name used in export locators
    #[arg(long, env = "NFS_SERVER")]
    nfs_server: Option<String>,

    /// Directory volumes are created under
    #[arg(long, env = "EXPORT_ROOT")]
    export_root: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Layer command-line values over the file configuration
    fn apply(self, config: &mut BrokerConfig) {
        if let Some(path) = self.state_file {
            config.store.kind = StoreKind::File;
            config.store.path = Some(path);
        }
        if self.in_memory {
            config.store.kind = StoreKind::Memory;
        }
        if let Some(allowed) = self.allowed_options {
            config.policy.allowed_options = allowed;
        }
        if let Some(defaults) = self.default_options {
            config.policy.default_options = defaults;
        }
        config.policy.permissive |= self.permissive;
        if let Some(name) = self.service_name {
            config.service.name = name;
        }
        if let Some(id) = self.service_id {
            config.service.id = id;
        }
        if let Some(base) = self.container_base {
            config.container_base = base;
        }
        if let Some(server) = self.nfs_server {
            config.backend.simulated.server = server;
        }
        if let Some(root) = self.export_root {
            config.backend.simulated.export_root = root;
        }
        if let Some(addr) = self.health_addr {
            config.server.health_addr = addr;
        }
        if let Some(addr) = self.metrics_addr {
            config.server.metrics_addr = addr;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        config.logging.json |= self.log_json;
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_yaml_file(path)?,
        None => BrokerConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    init_logging(&config.logging.level, config.logging.json)?;

    info!("Starting NFS Volume Broker");
    info!("  Version: {}", nfs_volume_broker::VERSION);
    info!("  Service: {} ({})", config.service.name, config.service.id);
    info!("  State store: {:?}", config.store.kind);
    info!("  Backend: {}", config.backend.kind);

    // Restore registry state; a corrupt store stops startup
    let store = StoreFactory::create(&config.store)?;
    let registry = InstanceRegistry::new(store);
    registry.restore()?;
    let stats = registry.stats();
    info!(
        "Registry ready: {} instances, {} bindings",
        stats.instances, stats.bindings
    );

    let mut events = registry.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!("Registry event: {:?}", event);
        }
    });

    let policy = Arc::new(config.merge_policy()?);
    info!(
        "Mount policy: {} allowed keys, {} defaults, permissive={}",
        policy.allowed_keys().len(),
        policy.default_entries().len(),
        policy.is_permissive()
    );

    let provisioner = BackendFactory::create(&config.backend.kind, config.backend.clone())?;
    let broker = Broker::new(
        config.broker_settings(),
        policy,
        registry.clone(),
        provisioner,
    );
    let metrics = Arc::new(BrokerMetrics::new()?);

    // Start health server
    let health_addr = config.server.health_addr.clone();
    let health_broker = broker.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_broker).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = config.server.metrics_addr.clone();
    let metrics_broker = broker.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_broker, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let flush_registry = registry.clone();
    match tokio::task::spawn_blocking(move || flush_registry.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Final registry flush failed: {}", e),
        Err(e) => warn!("Final registry flush task failed: {}", e),
    }

    info!("Broker shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let hyper_directive = "hyper=warn"
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?;
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(hyper_directive);

    if json {
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
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, broker: Arc<Broker>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let broker = broker.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let broker = broker.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            if broker.backend_healthy().await {
                                text_response(StatusCode::OK, "ok")
                            } else {
                                text_response(StatusCode::SERVICE_UNAVAILABLE, "backend unavailable")
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr = parse_addr("health", addr)?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    broker: Arc<Broker>,
    metrics: Arc<BrokerMetrics>,
) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let broker = broker.clone();
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let broker = broker.clone();
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            metrics.observe(&broker.stats(), &broker.registry_stats());
                            match metrics.render() {
                                Ok(buffer) => {
                                    let mut response = Response::new(Body::from(buffer));
                                    if let Ok(value) = metrics.content_type().parse() {
                                        response.headers_mut().insert(CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => {
                                    error!("Failed to render metrics: {}", e);
                                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "error")
                                }
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr = parse_addr("metrics", addr)?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
