//! The `shoal` binary: flags, config file, signals, and wiring.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shoal_proxy::metrics::{self, MetricsSink, NoopSink, RecorderSink};
use shoal_proxy::{Multiplexer, ProxyConfig};

#[derive(Debug, Parser)]
#[command(name = "shoal", about = "Transparent multiplexing proxy for RESP shards")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "SHOAL_CONFIG")]
    config: std::path::PathBuf,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Log filter, e.g. `info` or `shoal_proxy=debug`.
    #[arg(long, env = "SHOAL_LOG", default_value = "info")]
    log: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(serve(config))
}

fn load_config(args: &Args) -> Result<ProxyConfig, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(&args.config)
        .map_err(|e| format!("{}: {e}", args.config.display()))?;
    let mut config = ProxyConfig::from_json(&raw)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    Ok(config)
}

async fn serve(config: ProxyConfig) -> ExitCode {
    let sink: Arc<dyn MetricsSink> = match config.metrics_addr {
        Some(addr) => {
            if let Err(e) = metrics::install_prometheus(addr) {
                error!(error = %e, "metrics exporter failed to start");
                return ExitCode::FAILURE;
            }
            info!(addr = %addr, "metrics exporter listening");
            Arc::new(RecorderSink)
        }
        None => Arc::new(NoopSink),
    };

    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.listen_addr, error = %e, "failed to bind listen address");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %config.listen_addr, shards = config.shards.len(), "proxy starting");

    let mux = Multiplexer::new(&config, sink).await;

    // ctrl-c flips the active flag; loops wind down at their next boundary
    {
        let mux = Arc::clone(&mux);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                mux.initiate_shutdown();
            }
        });
    }

    Arc::clone(&mux).run(listener).await;
    mux.wait_drained(config.shutdown_grace()).await;
    info!("proxy stopped");
    ExitCode::SUCCESS
}
