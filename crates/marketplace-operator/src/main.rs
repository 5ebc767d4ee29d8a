//! Marketplace operator
//!
//! Publishes operator catalogs from remote app-registries as OLM
//! CatalogSources.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use marketplace_operator::appregistry::HttpClientFactory;
use marketplace_operator::config::{release_version, OperatorConfig, DEFAULT_REGISTRY_IMAGE};
use marketplace_operator::controller;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Marketplace operator
#[derive(Parser, Debug)]
#[command(name = "marketplace-operator")]
#[command(about = "Kubernetes operator publishing operator catalogs from app-registries")]
#[command(version)]
struct Args {
    /// Namespace the operator runs in; owned resources must live here
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "openshift-marketplace")]
    watch_namespace: String,

    /// Image running appregistry-server
    #[arg(long, env = "REGISTRY_SERVER_IMAGE", default_value = DEFAULT_REGISTRY_IMAGE)]
    registry_image: String,

    /// Directory holding the default sources
    #[arg(long, env = "DEFAULTS_DIR", default_value = "/defaults")]
    defaults_dir: PathBuf,

    /// Seconds between update polls of the remote registries
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "900")]
    poll_interval_secs: u64,

    /// Seconds between ClusterOperator status reports
    #[arg(long, env = "STATUS_REPORT_INTERVAL_SECS", default_value = "20")]
    status_report_interval_secs: u64,

    /// registryPoll interval put on CatalogSources of OperatorSources, e.g. 15m
    #[arg(long, env = "CATALOG_POLL_INTERVAL")]
    catalog_poll_interval: Option<String>,

    /// Name of the ClusterOperator to report to
    #[arg(long, env = "CLUSTER_OPERATOR_NAME", default_value = "marketplace")]
    cluster_operator_name: String,

    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8383")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    health_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            namespace: self.watch_namespace.clone(),
            registry_image: self.registry_image.clone(),
            defaults_dir: self.defaults_dir.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            status_interval: Duration::from_secs(self.status_report_interval_secs),
            cluster_operator_name: self.cluster_operator_name.clone(),
            release_version: release_version(|key| std::env::var(key).ok()),
            catalog_poll_interval: self.catalog_poll_interval.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print_crds()?;
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        release = %config.release_version,
        namespace = %config.namespace,
        "Starting marketplace operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    controller::run(client, config, Arc::new(HttpClientFactory::default()))
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
///
/// `RUST_LOG` overrides `--log-level` when set.
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str().to_lowercase()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Response to a raw HTTP request on the health port
fn health_response(request: &[u8]) -> &'static str {
    let request = String::from_utf8_lossy(request);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or_default();
    if path == "/healthz" {
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK"
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found"
    }
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if let Ok(n) = socket.read(&mut buf).await {
                let _ = socket.write_all(health_response(&buf[..n]).as_bytes()).await;
            }
        });
    }
}

/// Print the owned CRDs as a multi-document YAML stream
fn print_crds() -> Result<()> {
    use kube::CustomResourceExt;
    use marketplace_operator::crd::{CatalogSourceConfig, OperatorSource};

    for crd in [OperatorSource::crd(), CatalogSourceConfig::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }

    Ok(())
}
