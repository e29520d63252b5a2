//! dj - run a container as a Docker Swarm job.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use docker_job::cli::Args;
use docker_job::docker::{DockerClient, Endpoint};
use docker_job::frame::StdioSink;
use docker_job::tunnel::SshTunnel;
use docker_job::{ServiceManager, run};
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the service ID and job output.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docker_job=warn,dj=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match execute(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every task succeeded.
async fn execute(args: Args) -> Result<bool> {
    let (config, connection) = args.into_config().context("Invalid arguments")?;

    // Keep the tunnel alive until the run is over.
    let tunnel = match &connection.ssh {
        Some(target) => Some(SshTunnel::open(target).await?),
        None => None,
    };
    let endpoint = match (&tunnel, connection.endpoint) {
        (Some(tunnel), _) => Endpoint::Unix(tunnel.socket().to_path_buf()),
        (None, Some(endpoint)) => endpoint,
        (None, None) => anyhow::bail!("No docker host to connect to"),
    };
    debug!(endpoint = ?endpoint, api_version = %connection.api_version, "Connecting to Docker");

    let client = DockerClient::new(endpoint, connection.api_version);
    let manager = ServiceManager::new(Arc::new(client), config.lifecycle);

    let mut stdout = std::io::stdout();
    let report = run(&manager, &config, &mut stdout, &mut StdioSink).await?;

    if !report.success() {
        error!(
            service_id = %report.service_id,
            failed = report.failures.len(),
            "Some tasks failed"
        );
    }
    Ok(report.success())
}
