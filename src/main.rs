//! Layer Stack Operator
//!
//! Satellite binary: loads the node configuration and the stack
//! descriptions, applies them through the stack worker, prints the
//! consolidated response and keeps serving health and metrics endpoints.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use layerstack::devmgr::DEFAULT_QUEUE_DEPTH;
use layerstack::exec::CommandRunnerRef;
use layerstack::{
    DeviceHandler, DryRunRunner, Error, LayerRegistry, LayerServices, LayerStackSpec,
    LayerTreeBuilder, MemoryLayerStore, ObserverBridge, Result, SatelliteConfig, StackMetrics,
    StackWorker, StaticKeyProvider, StoragePoolRegistry, SystemCommandRunner,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Layer Stack Operator - sizes and applies layered block-device stacks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Satellite configuration file (YAML)
    #[arg(long, env = "LAYERSTACK_CONFIG")]
    config: Option<PathBuf>,

    /// Stack description files (YAML lists), applied as one batch
    #[arg(long, env = "LAYERSTACK_STACKS", value_delimiter = ',')]
    stacks: Vec<PathBuf>,

    /// Encryption keys as KEY_REF=PATH
    #[arg(long = "key", env = "LAYERSTACK_KEYS", value_delimiter = ',')]
    keys: Vec<String>,

    /// Log external commands instead of running them
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Apply the stacks and exit
    #[arg(long)]
    once: bool,

    /// Follow `drbdsetup events2` and feed the replication observer
    #[arg(long, env = "WATCH_EVENTS")]
    watch_events: bool,

    /// Overrides the configured node name
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Overrides the configured health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Overrides the configured metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = load_config(&args)?;

    info!("Starting Layer Stack Operator");
    info!("  Version: {}", layerstack::VERSION);
    info!("  Node: {}", config.node_name);
    info!("  Dry run: {}", args.dry_run);
    info!("  Storage pools: {}", config.storage_pools.len());

    let metrics = Arc::new(StackMetrics::new()?);
    let pools = Arc::new(StoragePoolRegistry::with_pools(
        config.storage_pools.iter().cloned(),
    ));
    let runner: CommandRunnerRef = if args.dry_run {
        Arc::new(DryRunRunner::new())
    } else {
        Arc::new(SystemCommandRunner::new(config.command_timeout()).with_metrics(metrics.clone()))
    };
    let keys = load_keys(&args.keys).await?;
    let observer = Arc::new(ObserverBridge::new(256));

    let config = Arc::new(config);
    let services = LayerServices {
        config: config.clone(),
        runner,
        pools: pools.clone(),
        keys: Arc::new(keys),
        observer: observer.clone(),
        dry_run: args.dry_run,
    };
    let registry = Arc::new(LayerRegistry::new(services));
    let store = Arc::new(MemoryLayerStore::new());
    let handler = Arc::new(DeviceHandler::new(registry, store, metrics.clone()));
    handler.clear_caches();
    let worker = StackWorker::spawn(handler, DEFAULT_QUEUE_DEPTH);
    let shutdown = worker.cancellation_token();

    if args.watch_events && !args.dry_run {
        let observer = observer.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_events(observer, token).await {
                error!("Event watcher error: {}", e);
            }
        });
    }

    // Apply the stack descriptions
    if !args.stacks.is_empty() {
        let builder = LayerTreeBuilder::new(pools.clone(), &config);
        let mut batch = Vec::new();
        for path in &args.stacks {
            let specs = LayerStackSpec::load_all(path)?;
            info!(file = %path.display(), stacks = specs.len(), "Loaded stack descriptions");
            for spec in &specs {
                batch.push(builder.build(spec)?);
            }
        }

        let outcome = worker.submit(batch).await?;
        if outcome.response.has_errors() {
            warn!(
                entries = outcome.response.entries().len(),
                "Some stacks could not be applied"
            );
        }
        println!("{}", serde_json::to_string_pretty(&outcome.response)?);
    }

    if args.once {
        worker.shutdown().await;
        return Ok(());
    }

    // Start health server
    let health_addr = config.health_addr.clone();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, token).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = config.metrics_addr.clone();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics, token).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    worker.shutdown().await;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?);

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
    Ok(())
}

fn directive(value: &str) -> Result<Directive> {
    value
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", value, e)))
}

fn load_config(args: &Args) -> Result<SatelliteConfig> {
    let mut config = match &args.config {
        Some(path) => SatelliteConfig::load(path)?,
        None => SatelliteConfig::default(),
    };
    if let Some(node_name) = &args.node_name {
        config.node_name = node_name.clone();
    }
    if let Some(addr) = &args.health_addr {
        config.health_addr = addr.clone();
    }
    if let Some(addr) = &args.metrics_addr {
        config.metrics_addr = addr.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn load_keys(entries: &[String]) -> Result<StaticKeyProvider> {
    let mut keys = StaticKeyProvider::new();
    for entry in entries {
        let (key_ref, path) = entry.split_once('=').ok_or_else(|| {
            Error::Configuration(format!("Invalid key {}, expected KEY_REF=PATH", entry))
        })?;
        let material = tokio::fs::read(path).await?;
        debug!(key_ref, "Loaded encryption key");
        keys = keys.with_key(key_ref, material);
    }
    Ok(keys)
}

// =============================================================================
// Replication Events
// =============================================================================

async fn watch_events(observer: Arc<ObserverBridge>, shutdown: CancellationToken) -> Result<()> {
    let mut child = tokio::process::Command::new("drbdsetup")
        .args(["events2", "--now", "all"])
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("drbdsetup events2 has no stdout".into()))?;
    let mut lines = BufReader::new(stdout).lines();

    info!("Following drbdsetup events2");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => {
                    observer.ingest_line(&line);
                }
                None => {
                    warn!("drbdsetup events2 exited");
                    break;
                }
            },
        }
    }
    Ok(())
}

// =============================================================================
// Health and Metrics Servers
// =============================================================================

fn reply(
    status: hyper::StatusCode,
    content_type: &str,
    body: impl Into<hyper::Body>,
) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn run_health_server(addr: &str, shutdown: CancellationToken) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let ready = shutdown.clone();
    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => reply(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" if !ready.is_cancelled() => {
                            reply(StatusCode::OK, "text/plain", "ok")
                        }
                        "/readyz" => {
                            reply(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "stopping")
                        }
                        _ => reply(StatusCode::NOT_FOUND, "text/plain", "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

async fn run_metrics_server(
    addr: &str,
    metrics: Arc<StackMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.render() {
                            Ok(text) => reply(StatusCode::OK, "text/plain; version=0.0.4", text),
                            Err(e) => reply(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "text/plain",
                                e.to_string(),
                            ),
                        },
                        _ => reply(StatusCode::NOT_FOUND, "text/plain", "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
