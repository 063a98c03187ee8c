use anyhow::{Context, Result};
use axum::{routing::get, Router};
use backup_orchestrator::config::{AppConfig, CliConfig, Config, FileConfig};
use backup_orchestrator::hook::CommandHookExecutor;
use backup_orchestrator::metrics;
use backup_orchestrator::oplog::OpLog;
use backup_orchestrator::orchestrator::Orchestrator;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to the TOML configuration file with repos and plans.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the operation log database.
    #[clap(long, value_parser = parse_path)]
    pub data_dir: Option<PathBuf>,

    /// Path to the restic binary. Defaults to the first restic on PATH.
    #[clap(long, value_parser = parse_path)]
    pub restic_binary: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long)]
    pub metrics_port: Option<u16>,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            config_path: args.config.clone(),
            data_dir: args.data_dir.clone(),
            restic_binary: args.restic_binary.clone(),
            metrics_port: args.metrics_port,
        }
    }
}

async fn run_metrics_server(port: u16) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics::metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!("Serving metrics on port {}", port);
    Ok(axum::serve(listener, app).await?)
}

/// Re-reads the config file on every SIGHUP and applies it.
#[cfg(unix)]
async fn reload_on_sighup(orchestrator: Arc<Orchestrator>, config_path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Config reload on SIGHUP unavailable: {}", e);
            return;
        }
    };
    while hangups.recv().await.is_some() {
        info!("Reloading configuration from {:?}", config_path);
        match reload(&orchestrator, &config_path) {
            Ok(()) => info!("Configuration reloaded"),
            Err(e) => error!("Keeping previous configuration: {:#}", e),
        }
    }
}

#[cfg(unix)]
fn reload(orchestrator: &Orchestrator, config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    orchestrator.apply_config(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let cli_config = CliConfig::from(&cli_args);
    let file_config = match &cli_config.config_path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&cli_config, file_config)?;
    info!(
        "Using restic at {:?}, {} repo(s), {} plan(s)",
        app_config.restic_binary,
        app_config.config.repos.len(),
        app_config.config.plans.len()
    );

    info!("Initializing metrics...");
    metrics::init_metrics();

    let db_path = app_config.oplog_db_path();
    info!("Opening operation log at {:?}...", db_path);
    let oplog = Arc::new(OpLog::open(&db_path)?);

    let orchestrator = Arc::new(Orchestrator::new(
        app_config.config.clone(),
        oplog,
        Arc::new(CommandHookExecutor),
        app_config.restic_binary.clone(),
    )?);
    orchestrator.schedule_startup_index();

    if let Some(port) = app_config.metrics_port {
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(port).await {
                error!("Metrics server stopped: {:#}", e);
            }
        });
    }

    #[cfg(unix)]
    if let Some(path) = cli_config.config_path.clone() {
        tokio::spawn(reload_on_sighup(orchestrator.clone(), path));
    }

    let shutdown = CancellationToken::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        ctrl_c_shutdown.cancel();
    });

    orchestrator.run(shutdown).await;
    info!("Backup orchestrator stopped");
    Ok(())
}
