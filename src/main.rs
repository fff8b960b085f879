use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use cortex_bridge::bridge::backend::MockBackend;
use cortex_bridge::bridge::config::{self, BridgeConfig, LoggingConfig};
use cortex_bridge::bridge::worker::worker_main::run_worker;
use cortex_bridge::bridge::{host, logger, runtime};

/// Bridge between a JSON-lines foreground and a long-lived model worker.
#[derive(Debug, Parser)]
#[command(name = "cortex-bridge", version)]
struct Cli {
    /// JSON configuration file (defaults apply when absent)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run as the model worker on stdin/stdout
    #[arg(long, hide = true)]
    worker: bool,

    /// Delay per model operation in the mock backend (worker mode)
    #[arg(long, value_name = "MS")]
    mock_latency_ms: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config =
        config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    // The worker blocks on stdin and must not run inside a tokio runtime
    if cli.worker {
        run_worker_mode(&cli, &config);
        return Ok(());
    }

    let _log_handle = match logger::setup_logging(&config.logging) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to set up logging: {e}");
            None
        }
    };

    // A self-spawned worker reads the same configuration file
    if let (Some(path), None) = (&cli.config, &config.worker.program) {
        config
            .worker
            .args
            .extend(["--config".to_string(), path.display().to_string()]);
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(serve(config))
}

async fn serve(config: BridgeConfig) -> Result<()> {
    let bridge = runtime::init(config).context("Failed to start bridge")?;
    info!("[HOST] Serving calls on stdin");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let served = host::run_host(bridge, stdin, tokio::io::stdout()).await;

    runtime::shutdown().await;
    served.context("Host loop failed")?;
    info!("[HOST] Input closed, exiting");
    Ok(())
}

fn run_worker_mode(cli: &Cli, config: &BridgeConfig) {
    let logging = LoggingConfig {
        file: false,
        ..config.logging.clone()
    };
    if let Err(e) = logger::setup_logging(&logging) {
        eprintln!("Failed to set up worker logging: {e}");
    }

    let latency = cli
        .mock_latency_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.worker.mock_latency());
    run_worker(MockBackend::new(latency));
}
