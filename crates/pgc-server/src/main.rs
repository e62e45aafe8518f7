//! PGC Server
//!
//! Serves authorization decisions over HTTP against governance rules
//! refreshed from the upstream rule store.

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use pgc_policy::PolicyManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use pgc_server::config::UpstreamKind;
use pgc_server::{create_router, AppState, PgcConfig};

#[derive(Parser, Debug)]
#[command(name = "pgc-server")]
#[command(about = "Policy Governance Compiler decision service", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "PGC_CONFIG", default_value = "pgc.yaml")]
    config: String,

    /// Rule store endpoint (selects the http upstream)
    #[arg(short, long)]
    upstream: Option<String>,

    /// Rule file or directory (selects the file upstream)
    #[arg(short, long)]
    rules: Option<String>,

    /// Listen address
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Listen port
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Debug-level logging for pgc crates
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut PgcConfig) {
        if let Some(endpoint) = &self.upstream {
            config.upstream.kind = UpstreamKind::Http;
            config.upstream.endpoint = Some(endpoint.clone());
        }
        if let Some(rules) = &self.rules {
            config.upstream.kind = UpstreamKind::File;
            config.upstream.directory = rules.clone();
        }
        if let Some(listen) = &self.listen {
            config.server.listen = listen.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    info!("Starting Policy Governance Compiler");

    let mut config = PgcConfig::load(Some(cli.config.as_str()))?;
    cli.apply(&mut config);
    info!(
        upstream = ?config.upstream.kind,
        target = %config.policy.target_predicate,
        refresh_interval_secs = config.policy.refresh_interval_secs,
        "Configuration loaded"
    );

    let metrics_handle = init_metrics()?;

    let addr: SocketAddr = format!("{}:{}", config.server.listen, config.server.port).parse()?;
    let refresh_interval = Duration::from_secs(config.policy.refresh_interval_secs);
    let state = AppState::from_config(config, Some(metrics_handle))?;

    match state.manager().refresh(true).await {
        Ok(rule_set) => {
            metrics::gauge!("pgc_rule_set_version").set(rule_set.version() as f64);
            info!(version = rule_set.version(), rules = rule_set.len(), "Initial rule set published");
        }
        Err(e) => warn!("Initial refresh failed, not ready until a refresh succeeds: {}", e),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = tokio::spawn(refresh_loop(
        Arc::clone(state.manager()),
        refresh_interval,
        shutdown_rx,
    ));

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    let shutdown = async move {
        shutdown_signal().await;
        warn!("Shutting down, draining in-flight requests");
        let _ = shutdown_tx.send(true);
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    if let Err(e) = refresher.await {
        warn!("Refresh loop ended abnormally: {}", e);
    }

    info!("Stopped");
    Ok(())
}

/// Re-check the rule store every interval until shutdown
async fn refresh_loop(manager: Arc<PolicyManager>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match manager.refresh(false).await {
                    Ok(rule_set) => metrics::gauge!("pgc_rule_set_version").set(rule_set.version() as f64),
                    Err(e) => warn!("Background refresh failed, keeping previous rule set: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Install the fmt subscriber, filtered by RUST_LOG when set
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("pgc_policy=debug,pgc_enforcement=debug,pgc_server=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("pgc_policy=info,pgc_enforcement=info,pgc_server=info")
        })
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install the Prometheus recorder backing `/metrics`
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    pgc_telemetry::describe_metrics();

    info!("Prometheus recorder installed");
    Ok(handle)
}
