//! Machine controller
//!
//! Kubernetes operator managing KVM virtual machines: the VirtualMachine
//! state machine, the MachineImage pipeline, settings, and live migration.
//! The same binary doubles as the QMP migration driver when started with
//! `--migrate` inside a migration job.

mod config;
mod controller;
mod error;
mod helpers;
mod labels;
mod leader;
mod queue;
mod reconciler;
mod routers;
mod store;
mod templates;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Cli;
use controller::Controller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.migrate {
        let sock_path = cli
            .sock_path
            .as_deref()
            .context("--sock-path is required with --migrate")?;
        let target_uri = cli
            .target_uri
            .as_deref()
            .context("--target-uri is required with --migrate")?;
        info!(sock_path, target_uri, "running migration driver");
        qmp_client::migrate::run(sock_path, target_uri)
            .await
            .map_err(error::ControllerError::Qmp)?;
        return Ok(());
    }

    if !cli.vm {
        bail!("nothing to run: pass --vm to run the controllers or --migrate for the driver");
    }

    let controller = Controller::new(cli.options()).await?;
    controller.run().await?;
    Ok(())
}
