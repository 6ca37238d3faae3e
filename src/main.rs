//! cachemgr - synthetic workload driver
//!
//! Starts a cache manager on a tokio runtime, creates a mix of plain and
//! transactional caches and hammers them with a skewed workload while the
//! rebalancer redistributes memory. Memory statistics are served on
//! `/metrics` and printed as JSON when the run completes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            cachemgr                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Workload   │───▶│   Manager    │◀───│  Rebalancer  │       │
//! │  │  (blocking)  │    │   + caches   │    │   (tokio)    │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                             ▼                                   │
//! │                  Prometheus exporter (/metrics)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cachemgr::cache::{
    BinaryKeyHasher, Cache, CacheStats, CacheType, CompositeEventSink, EventSink,
    LoggingEventSink, Manager, MemoryStats, MetricsSnapshot, PrometheusExporter, Rebalancer,
    StructuredKeyHasher, TokioExecutor,
};
use cachemgr::ManagerConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// cachemgr - multi-cache manager workload driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML manager configuration
    #[arg(long, env = "CACHEMGR_CONFIG")]
    config: Option<PathBuf>,

    /// Global memory limit in bytes (overrides the config file)
    #[arg(long, env = "CACHEMGR_GLOBAL_LIMIT")]
    global_limit: Option<u64>,

    /// Number of caches to create
    #[arg(long, env = "CACHEMGR_CACHES", default_value = "4")]
    caches: usize,

    /// Maximum size of each cache in bytes
    #[arg(long, env = "CACHEMGR_CACHE_MAX_SIZE", default_value = "67108864")]
    cache_max_size: u64,

    /// Operations per worker
    #[arg(long, env = "CACHEMGR_OPERATIONS", default_value = "200000")]
    operations: u64,

    /// Concurrent workload threads
    #[arg(long, env = "CACHEMGR_WORKERS", default_value = "4")]
    workers: usize,

    /// Distinct keys per cache
    #[arg(long, env = "CACHEMGR_KEY_SPACE", default_value = "50000")]
    key_space: u64,

    /// Value size in bytes
    #[arg(long, env = "CACHEMGR_VALUE_SIZE", default_value = "256")]
    value_size: usize,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9464")]
    metrics_addr: String,

    /// Keep serving metrics after the workload until Ctrl-C
    #[arg(long, env = "CACHEMGR_SERVE")]
    serve: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// Final report printed to stdout
#[derive(Debug, Serialize)]
struct Report {
    elapsed_ms: u64,
    memory: MemoryStats,
    metrics: MetricsSnapshot,
    hit_rate_lifetime: f64,
    hit_rate_windowed: f64,
    caches: Vec<CacheStats>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => ManagerConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    if let Some(limit) = args.global_limit {
        config.global_limit = limit;
    }
    config.validate()?;

    info!("Starting cachemgr");
    info!("  Global limit: {} bytes", config.global_limit);
    info!("  Caches: {}", args.caches);
    info!("  Workers: {}", args.workers);
    info!("  Operations per worker: {}", args.operations);

    let exporter = Arc::new(PrometheusExporter::new("cachemgr")?);
    let events: Arc<dyn EventSink> = Arc::new(
        CompositeEventSink::new()
            .with_sink(Arc::new(LoggingEventSink))
            .with_sink(exporter.clone()),
    );
    let executor = Arc::new(TokioExecutor::new(tokio::runtime::Handle::current()));
    let manager = Manager::with_event_sink(config.clone(), executor, events)?;

    let mut caches = Vec::with_capacity(args.caches);
    for i in 0..args.caches {
        let cache = match i % 3 {
            0 => manager.create_cache::<BinaryKeyHasher>(CacheType::Plain, args.cache_max_size, true),
            1 => manager.create_cache::<BinaryKeyHasher>(
                CacheType::Transactional,
                args.cache_max_size,
                true,
            ),
            _ => manager.create_cache::<StructuredKeyHasher>(
                CacheType::Plain,
                args.cache_max_size,
                false,
            ),
        }
        .with_context(|| format!("creating cache {}", i))?;
        caches.push(cache);
    }

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_manager = Arc::clone(&manager);
    let metrics_exporter = Arc::clone(&exporter);
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_manager, metrics_exporter).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    // Start rebalancer
    let rebalancer = Rebalancer::new(Arc::clone(&manager), config.rebalance_interval());
    let (cancel, rebalancer_handle) = rebalancer.spawn();

    // Run the workload
    let started = Instant::now();
    let mut workers = Vec::with_capacity(args.workers);
    for worker in 0..args.workers {
        let manager = Arc::clone(&manager);
        let caches = caches.clone();
        let plan = Workload {
            operations: args.operations,
            key_space: args.key_space.max(1),
            value_size: args.value_size,
        };
        workers.push(tokio::task::spawn_blocking(move || {
            plan.run(worker, &manager, &caches)
        }));
    }
    let mut completed = 0u64;
    for handle in workers {
        completed += handle.await.context("workload thread panicked")?;
    }
    let elapsed = started.elapsed();
    info!(
        completed,
        elapsed_ms = elapsed.as_millis() as u64,
        "Workload finished"
    );

    if args.serve {
        info!("Serving metrics until Ctrl-C");
        tokio::signal::ctrl_c().await?;
    }

    cancel.cancel();
    let rounds = rebalancer_handle.await?;
    info!(rounds, "Rebalancer stopped");

    let (hit_rate_lifetime, hit_rate_windowed) = manager.global_hit_rates();
    let report = Report {
        elapsed_ms: elapsed.as_millis() as u64,
        memory: manager.memory_stats(),
        metrics: manager.metrics().snapshot(),
        hit_rate_lifetime,
        hit_rate_windowed,
        caches: caches.iter().map(|c| c.stats()).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    drop(caches);
    let shutdown_manager = Arc::clone(&manager);
    tokio::task::spawn_blocking(move || shutdown_manager.shutdown()).await?;

    info!("cachemgr shutdown complete");
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

/// Skewed read-mostly mix: lower-numbered caches are hit more often
#[derive(Debug, Clone, Copy)]
struct Workload {
    operations: u64,
    key_space: u64,
    value_size: usize,
}

impl Workload {
    fn run(&self, worker: usize, manager: &Manager, caches: &[Arc<dyn Cache>]) -> u64 {
        if caches.is_empty() {
            return 0;
        }
        let mut rng = rand::rng();
        let value = vec![worker as u8; self.value_size];
        let mut done = 0;

        for _ in 0..self.operations {
            if manager.is_shutting_down() {
                break;
            }
            let pick = rng.random::<f64>().powi(2) * caches.len() as f64;
            let index = (pick as usize).min(caches.len() - 1);
            let cache = &caches[index];
            let key = self.key(index, rng.random_range(0..self.key_space));

            match rng.random_range(0..100u32) {
                0..=69 => {
                    if cache.find(&key).is_none() {
                        cache.insert(&key, &value);
                    }
                }
                70..=89 => {
                    cache.insert(&key, &value);
                }
                90..=96 => {
                    cache.remove(&key);
                }
                _ => {
                    if cache.cache_type() == CacheType::Transactional {
                        let tx = manager.begin_transaction(false);
                        cache.blacklist(&key);
                        manager.end_transaction(tx);
                    } else {
                        cache.blacklist(&key);
                    }
                }
            }
            done += 1;
        }
        debug!(worker, done, "Worker finished");
        done
    }

    fn key(&self, cache_index: usize, n: u64) -> Vec<u8> {
        let id = n.to_be_bytes();
        // every third cache uses the structured hasher and multi-part keys
        if cache_index % 3 == 2 {
            StructuredKeyHasher::encode(&[b"tenant".as_slice(), id.as_slice()])
        } else {
            id.to_vec()
        }
    }
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
    for directive in ["hyper=warn", "tokio=warn"] {
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

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    manager: Arc<Manager>,
    exporter: Arc<PrometheusExporter>,
) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server on {}", addr))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);
        let manager = Arc::clone(&manager);
        let exporter = Arc::clone(&exporter);

        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let manager = Arc::clone(&manager);
            let exporter = Arc::clone(&exporter);
            async move {
                let response = match req.uri().path() {
                    "/metrics" => {
                        exporter.update(&manager.memory_stats(), manager.global_hit_rates());
                        match exporter.encode() {
                            Ok(text) => {
                                let mut response = respond(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    HeaderValue::from_static("text/plain; version=0.0.4"),
                                );
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        }
                    }
                    "/healthz" => {
                        if manager.is_shutting_down() {
                            respond(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
                        } else {
                            respond(StatusCode::OK, "ok")
                        }
                    }
                    _ => respond(StatusCode::NOT_FOUND, "not found"),
                };
                Ok::<_, std::convert::Infallible>(response)
            }
        });

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
