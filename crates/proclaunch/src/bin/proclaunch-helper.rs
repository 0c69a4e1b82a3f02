//! proclaunch-helper - runs processes on behalf of a launcher.
//!
//! Started by the launcher with the socket address to connect back to.

use anyhow::Context;
use clap::Parser;

use proclaunch::bridge::transport::{HelperAddress, connect};

/// Process launcher helper
#[derive(Parser)]
#[command(name = "proclaunch-helper")]
#[command(about = "Out-of-process helper for proclaunch", long_about = None)]
struct Cli {
    /// Launcher socket address (a path, or `abstract:<name>` on Linux)
    address: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    proclaunch::init_tracing();
    let cli = Cli::parse();

    let address = HelperAddress::parse_arg(&cli.address)
        .with_context(|| format!("invalid launcher address {:?}", cli.address))?;
    let stream = connect(&address)
        .await
        .with_context(|| format!("failed to connect to launcher at {address}"))?;
    tracing::debug!(%address, "Connected to launcher");

    proclaunch::helper::serve(stream)
        .await
        .context("helper connection failed")?;
    tracing::debug!("Helper exiting");
    Ok(())
}
