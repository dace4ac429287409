//! `vpsd` — ephemeral QEMU/KVM sandbox VMs behind a REST control plane.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

mod api;
mod auth;
mod cloudinit;
mod error;
mod hypervisor;
mod images;
mod metrics;
mod procfs;
mod qmp;
mod server;
mod templates;
mod vm;
mod vnc;

#[derive(Parser)]
#[command(
    name = "vpsd",
    about = "Ephemeral VM sandbox service over QEMU/KVM",
    version
)]
struct Cli {
    /// Address to bind the HTTP API to
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Service data directory (base images, per-VM disks, logs)
    #[arg(long, default_value = "/var/lib/vps-service")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    server::serve(cli.bind, cli.data_dir).await
}
