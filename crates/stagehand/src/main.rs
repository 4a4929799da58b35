//! stagehand: scene manager daemon for Behringer X32 consoles.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stageconf::StageConfig;
use stagehand::bus::EventBus;
use stagehand::store::SceneStore;
use stagehand::web::{self, AppState};
use x32osc::mock::MockConsole;
use x32osc::SessionConfig;

#[derive(Debug, Parser)]
#[command(name = "stagehand", about = "Scene manager for Behringer X32 consoles")]
struct Args {
    /// Config file path (overrides ./stagehand.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Console IP (overrides config)
    #[arg(long)]
    console_ip: Option<String>,

    /// Run against the in-process console emulator
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        StageConfig::load_from(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(ip) = args.console_ip {
        config.console_ip = ip;
    }
    if args.mock {
        config.mock_mode = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run(config).await
}

async fn run(config: StageConfig) -> Result<()> {
    info!("🎚 stagehand starting");
    info!("   HTTP port: {}", config.listen_port);
    info!("   Scene dir: {}", config.scene_dir.display());

    let bus = EventBus::new();

    // Mock mode swaps the console for the loopback emulator; the session
    // itself is unchanged and reports the `mock` state.
    let mut mock_handle = None;
    let (console_ip, console_port) = if config.mock_mode {
        let handle = x32osc::mock::spawn(MockConsole::new())
            .await
            .context("failed to start mock console")?;
        info!("   Mock console: {}", handle.addr);
        let target = ("127.0.0.1".to_string(), handle.addr.port());
        mock_handle = Some(handle);
        target
    } else {
        info!("   Console: {}:{}", config.console_ip, config.console_port);
        (config.console_ip.clone(), config.console_port)
    };

    let mut session_config = SessionConfig::new("x32", &console_ip)
        .with_port(console_port)
        .with_idle_window(Duration::from_secs(config.idle_window_secs))
        .with_mock(config.mock_mode);
    session_config.max_probe_failures = config.max_probe_failures;

    let session = x32osc::X32Session::connect(session_config, bus.sender())
        .await
        .context("failed to open console session")?;
    let session = stagehand::shared_session(session);

    let store = SceneStore::open(&config.scene_dir, session.clone(), bus.clone())
        .context("failed to open scene store")?;

    std::fs::create_dir_all(&config.backup_dir).context("failed to create backup directory")?;
    let backup_dir = config
        .backup_dir
        .canonicalize()
        .context("failed to resolve backup directory")?;

    let state = AppState {
        session,
        store: Arc::new(store),
        bus,
        backup_dir,
        config: config.clone(),
    };

    let app = web::router(state);
    let addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!("🎚 stagehand ready!");
    info!("   API: http://{}/scenes", addr);
    info!("   WS:  ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(handle) = mock_handle {
        handle.shutdown();
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("received SIGTERM, shutting down...");
        }
    }
}
