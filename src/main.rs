//! NfsPvc Operator
//!
//! Runs the NfsPvc controller, its validating admission webhook and the
//! health and metrics endpoints.

use clap::Parser;
use kube::{Client, CustomResourceExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nfspvc_operator::webhook::{self, TlsFiles};
use nfspvc_operator::{
    controller, ClusterStoreRef, Error, KubeStore, Metrics, NfsPvc, NfsPvcValidator,
    OperatorConfig, Result, WebhookConfig, WebhookState,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// NfsPvc Operator - NFS PersistentVolumes and claims from NfsPvc resources
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Storage class set on generated volumes and claims
    #[arg(long, env = "STORAGE_CLASS")]
    storage_class: Option<String>,

    /// Reclaim policy set on generated volumes (Retain, Delete, Recycle)
    #[arg(long, env = "RECLAIM_POLICY")]
    reclaim_policy: Option<String>,

    /// Admission webhook bind address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    webhook_addr: String,

    /// TLS certificate for the webhook
    #[arg(long, env = "TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    /// TLS private key for the webhook
    #[arg(long, env = "TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,

    /// Do not start the admission webhook
    #[arg(long, env = "DISABLE_WEBHOOK")]
    disable_webhook: bool,

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

    /// Print the NfsPvc CustomResourceDefinition as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        let crd = serde_yaml::to_string(&NfsPvc::crd())
            .map_err(|e| Error::Internal(format!("Failed to render CRD: {}", e)))?;
        print!("{}", crd);
        return Ok(());
    }

    // Initialize logging
    init_logging(&args);

    let config = Arc::new(operator_config(&args)?);

    info!("Starting NfsPvc Operator");
    info!("  Version: {}", nfspvc_operator::VERSION);
    info!("  Storage class: {}", config.storage_class);
    info!("  Reclaim policy: {}", config.reclaim_policy);
    info!("  Webhook: {}", if args.disable_webhook { "disabled" } else { args.webhook_addr.as_str() });

    let metrics = Arc::new(Metrics::new()?);
    let client = Client::try_default().await?;

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health server")?;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics server")?;
    let server_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, server_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Start admission webhook
    if !args.disable_webhook {
        let webhook_config = WebhookConfig {
            addr: parse_addr(&args.webhook_addr, "webhook")?,
            tls: tls_files(&args)?,
        };
        let store: ClusterStoreRef = Arc::new(KubeStore::new(client.clone()));
        let state = Arc::new(WebhookState {
            validator: NfsPvcValidator::new(store),
            metrics: metrics.clone(),
        });
        tokio::spawn(async move {
            if let Err(e) = webhook::serve(webhook_config, state).await {
                error!("Webhook server error: {}", e);
            }
        });
    }

    controller::run(client, config, metrics).await?;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

fn operator_config(args: &Args) -> Result<OperatorConfig> {
    let storage_class = args
        .storage_class
        .clone()
        .ok_or_else(|| Error::Configuration("STORAGE_CLASS must be set".into()))?;
    let reclaim_policy = args
        .reclaim_policy
        .as_deref()
        .ok_or_else(|| Error::Configuration("RECLAIM_POLICY must be set".into()))?;

    OperatorConfig::new(storage_class, reclaim_policy)
}

fn tls_files(args: &Args) -> Result<Option<TlsFiles>> {
    match (&args.tls_cert_file, &args.tls_key_file) {
        (Some(cert), Some(key)) => Ok(Some(TlsFiles {
            cert: cert.clone(),
            key: key.clone(),
        })),
        (None, None) => Ok(None),
        _ => Err(Error::Configuration(
            "TLS_CERT_FILE and TLS_KEY_FILE must be set together".into(),
        )),
    }
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {}: {}", what, addr, e)))
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
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info", "rustls=warn"] {
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
// Health Server
// =============================================================================

fn plain_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => plain_response(StatusCode::OK, "ok"),
                _ => plain_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, metrics: Arc<Metrics>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = plain_response(StatusCode::OK, buffer);
                                if let Ok(value) = header::HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                            }
                        },
                        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
