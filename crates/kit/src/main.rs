//! Cloud VM Kit (cvk) - provision KVM guests from a cloud base image

use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod command_run;
mod config;
mod disk;
mod image;
mod launcher;
mod network;
mod payload;
mod pipeline;
mod progress;
mod prompt;
mod utils;
mod validate;

/// Provision KVM guests from a cloud base image.
///
/// cvk validates a request, derives the guest's static address from the
/// host's network, fetches and caches the base image, prepares a per-VM
/// disk and first-boot volume, and hands the result to libvirt.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start a new VM, prompting for anything not given
    Create(pipeline::CreateOpts),

    /// Check a provisioning request without acting on it
    Validate(validate::RequestArgs),

    /// Print the first-boot documents for a guest
    #[clap(name = "render-payload")]
    RenderPayload(payload::RenderPayloadOpts),

    /// Download the base image into the local cache if missing
    #[clap(name = "fetch-image")]
    FetchImage(image::FetchImageOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs go to stderr, filtered by RUST_LOG, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Create(opts) => pipeline::run(opts)?,
        Commands::Validate(args) => validate::run(args)?,
        Commands::RenderPayload(opts) => payload::run_render(opts)?,
        Commands::FetchImage(opts) => image::run(opts)?,
    }
    tracing::debug!("exiting");
    Ok(())
}
