use anyhow::{anyhow, Context};
use satpwn_core::{logging, now_ms, EngineConfig, EpochScheduler};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

mod error;
mod handlers;
mod runtime;
mod state;

use runtime::{EngineRuntime, Persister};

const NODE_API_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersion {
    version: &'static str,
    api_version: u32,
    memory_schema_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let version = NodeVersion {
            version: env!("CARGO_PKG_VERSION"),
            api_version: NODE_API_VERSION,
            memory_schema_version: satpwn_core::MEMORY_SCHEMA_VERSION,
        };
        println!("{}", serde_json::to_string(&version)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = EngineConfig::from_file(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    logging::init_with(config.log_format);
    info!(
        config = %config_path.display(),
        channels = ?config.supported_channels,
        mode = %config.initial_mode,
        memory = %config.memory_path.display(),
        "Starting satpwn-node"
    );

    let bind = config.dashboard.bind;
    let persister = Persister::spawn(config.memory_path.clone());
    let scheduler = EpochScheduler::open(config, now_ms())?;
    let (runtime, state) = EngineRuntime::new(scheduler, persister);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = tokio::spawn(runtime.run(shutdown_rx.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    let app = handlers::router(Arc::new(state));
    let listener = TcpListener::bind(bind).await?;
    info!("Dashboard listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await?;
    engine.await?;
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

fn parse_config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow!("--config was provided without a path"));
        }
    }

    Err(anyhow!("missing required --config <path> argument"))
}
