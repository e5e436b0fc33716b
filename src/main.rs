//! Volume Orchestrator
//!
//! Loads backend sections from a YAML file, registers their drivers and
//! keeps capability reports, reconciliation and metrics running until
//! interrupted.

use anyhow::Context;
use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_orchestrator::{ServiceConfig, VolumeService};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Orchestrator - Block storage backend driver core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service configuration file (YAML)
    #[arg(long, short, env = "VOLUME_CONFIG", default_value = "/etc/volume-orchestrator/config.yaml")]
    config: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Capability refresh interval, overriding the config file
    #[arg(long, env = "REFRESH_INTERVAL")]
    refresh_interval_secs: Option<u64>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Volume Orchestrator");
    info!("  Version: {}", volume_orchestrator::VERSION);
    info!("  Config: {}", args.config);

    let mut config = ServiceConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;
    if let Some(secs) = args.refresh_interval_secs {
        anyhow::ensure!(secs > 0, "refresh interval must be > 0");
        config.registry.refresh_interval_secs = secs;
    }
    info!(
        "  Driver call timeout: {}s, lock mode: {:?}",
        config.driver_call_timeout_secs, config.lock_mode
    );

    let service = VolumeService::new(config)?;
    service.initialize().await?;

    if args.check {
        let status = service.status();
        println!("{}", serde_json::to_string_pretty(&status)?);
        if !status.excluded_backends.is_empty() {
            anyhow::bail!("{} backend(s) excluded", status.excluded_backends.len());
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let background = service.spawn_background(cancel.clone());

    let health_addr: SocketAddr = args
        .health_addr
        .parse()
        .with_context(|| format!("invalid health server address {}", args.health_addr))?;
    let health_service = service.clone();
    let health_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_service, health_cancel).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", args.metrics_addr))?;
    let metrics_service = service.clone();
    let metrics_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_service, metrics_cancel).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    cancel.cancel();
    service.shutdown();
    for handle in background {
        let _ = handle.await;
    }

    info!("Volume orchestrator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
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
        .add_directive("hyper=warn".parse()?);

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

// =============================================================================
// Health Server
// =============================================================================

fn plain(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: SocketAddr,
    service: Arc<VolumeService>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let service = service.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let service = service.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => plain(StatusCode::OK, "ok"),
                        "/readyz" if service.is_ready() => plain(StatusCode::OK, "ok"),
                        "/readyz" => plain(StatusCode::SERVICE_UNAVAILABLE, "no schedulable backend"),
                        "/status" => match serde_json::to_vec(&service.status()) {
                            Ok(body) => {
                                let mut response = hyper::Response::new(Body::from(body));
                                response.headers_mut().insert(
                                    hyper::header::CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static("application/json"),
                                );
                                response
                            }
                            Err(_) => plain(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed"),
                        },
                        _ => plain(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    service: Arc<VolumeService>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let service = service.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let service = service.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            service.update_metrics();
                            match service.metrics().encode() {
                                Ok((content_type, buffer)) => {
                                    let mut response = hyper::Response::new(Body::from(buffer));
                                    if let Ok(value) =
                                        hyper::header::HeaderValue::from_str(&content_type)
                                    {
                                        response
                                            .headers_mut()
                                            .insert(hyper::header::CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => {
                                    error!("Metrics encoding failed: {}", e);
                                    plain(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                                }
                            }
                        }
                        _ => plain(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
