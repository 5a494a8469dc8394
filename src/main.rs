//! echo-bench: TCP echo round-trip latency and throughput benchmark
//!
//! Two roles share one binary:
//! - `server`: echoes length-prefixed frames, one per connection
//! - `client`: drives concurrent echo sessions against a server and reports
//!   per-sample latency plus aggregate throughput on stdout
//!
//! Configuration comes from CLI arguments and an optional TOML file.

mod client;
mod config;
mod protocol;
mod server;
mod shutdown;

use client::orchestrator::{ExperimentError, ExperimentResult};
use client::{report, Experiment};
use config::{ClientConfig, Config, Role, ServerConfig};
use server::Server;
use tokio::runtime::{Builder, Runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout is reserved for measurements
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.role {
        Role::Server(server) => run_server(server),
        Role::Client(client) => run_client(client),
    }
}

/// One runtime worker thread per configured unit of concurrency.
fn build_runtime(threads: usize) -> std::io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
}

fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        concurrency = config.concurrency,
        backlog = config.backlog,
        "Starting echo server"
    );

    let runtime = build_runtime(config.concurrency)?;
    runtime.block_on(async {
        let (trigger, shutdown) = shutdown::channel();
        shutdown::on_ctrl_c(trigger);
        Server::new(config).run(shutdown).await
    })?;
    Ok(())
}

fn run_client(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        concurrency = config.concurrency,
        payload_size = config.payload_size,
        client_id = %config.client_id,
        "Starting load generator"
    );

    let client_id = config.client_id.clone();
    report::write_header(&mut std::io::stdout(), config.payload_size)?;

    let runtime = build_runtime(config.concurrency)?;
    let outcome = runtime.block_on(async {
        let (trigger, shutdown) = shutdown::channel();
        shutdown::on_ctrl_c(trigger);
        Experiment::new(config).run(shutdown).await
    });

    if let Some(result) = completed(outcome)? {
        report::write_report(&mut std::io::stdout().lock(), &client_id, &result)?;
    }
    Ok(())
}

/// An interrupted experiment ends the client normally, without a report.
fn completed(
    outcome: Result<ExperimentResult, ExperimentError>,
) -> Result<Option<ExperimentResult>, ExperimentError> {
    match outcome {
        Ok(result) => Ok(Some(result)),
        Err(ExperimentError::Interrupted) => {
            info!("Terminating");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
