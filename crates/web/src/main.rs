//! Browsercast Daemon
//!
//! Operates a pool of virtual-display browser sessions and streams
//! their frames to viewers.

use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use browsercast_core::{DaemonConfig, NoopPolicy, SessionRegistry};
use browsercast_web::{serve, AppState};

#[derive(Parser)]
#[command(name = "browsercastd")]
#[command(about = "Browsercast daemon - virtual-display browser orchestration")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.browsercast/config.toml")]
    config: PathBuf,

    /// Listen address (overrides configuration)
    #[arg(short, long)]
    listen: Option<String>,

    /// Run browsers headless, without Xvfb or VNC
    #[arg(long)]
    headless: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("browsercast daemon v{}", browsercast_common::VERSION);

    let mut config = DaemonConfig::load(&expand_home(&cli.config))?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if cli.headless {
        config.browser.headless = true;
    }

    let addr: SocketAddr = config.listen.parse()?;
    let registry = SessionRegistry::new(config);
    let state = AppState {
        registry: registry.clone(),
        policy: Arc::new(NoopPolicy),
    };

    serve(addr, state).await?;

    // Explicit teardown: stop every session before exiting.
    registry.shutdown_all().await;
    info!("daemon shutdown complete");
    Ok(())
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
