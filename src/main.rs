use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camstream::camera::{BaseStationClient, CameraRegistry};
use camstream::config::{ConfigStore, SqliteDeviceStorage};
use camstream::events::EventBus;
use camstream::state::AppState;
use camstream::stream::{ControllerDeps, PortAllocator, ProcessLauncher};
use camstream::utils::bind_tcp_listener;
use camstream::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// camstream command line arguments
#[derive(Parser, Debug)]
#[command(name = "camstream")]
#[command(version, about = "On-demand stream sessions for battery cameras", long_about = None)]
struct CliArgs {
    /// Listen address (overrides database config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides database config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Data directory path (default: /etc/camstream)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camstream v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_store = ConfigStore::new(&data_dir.join("camstream.db")).await?;
    let mut config = (*config_store.get()).clone();

    // CLI overrides apply to this run only
    if let Some(addr) = args.address {
        config.web.bind_address = addr;
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }

    let events = Arc::new(EventBus::new());
    let ports = Arc::new(PortAllocator::from_config(&config.stream)?);
    let activator = BaseStationClient::activator(&config.base_station)?;
    if config.base_station.url.is_none() {
        tracing::warn!("No base station configured, wake signals are disabled");
    }

    let deps = ControllerDeps {
        ports,
        launcher: Arc::new(ProcessLauncher),
        activator,
        events: events.clone(),
    };
    let storage = Arc::new(SqliteDeviceStorage::new(config_store.pool().clone()));
    let cameras = Arc::new(CameraRegistry::new(storage, config_store.shared(), deps));
    tracing::info!("{} camera(s) registered", cameras.list().await?.len());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = AppState::new(
        config_store,
        cameras,
        events,
        shutdown_tx.clone(),
        data_dir,
    );

    let app = web::create_router(state.clone());

    let bind_ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", config.web.bind_address, e))?;
    let listener = bind_tcp_listener(SocketAddr::new(bind_ip, config.web.http_port))?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    tokio::select! {
        _ = shutdown_signal => {}
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
    }

    cleanup(&state).await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camstream=error,tower_http=error",
        LogLevel::Warn => "camstream=warn,tower_http=warn",
        LogLevel::Info => "camstream=info,tower_http=info",
        LogLevel::Verbose => "camstream=debug,tower_http=info",
        LogLevel::Debug => "camstream=debug,tower_http=debug",
        LogLevel::Trace => "camstream=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("CAMSTREAM_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/camstream")
}

/// Stop every stream so no pipeline outlives the service
async fn cleanup(state: &Arc<AppState>) {
    state.cameras.stop_all().await;
}
