//! Tollgate CLI
//!
//! Injects block and delay rules into ingress controller snippet annotations.

use clap::Parser;

use tollgate_cli::{Cli, Result};
use tollgate_common::telemetry::{init_logging, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(TelemetryConfig {
        format: cli.log_format.parse()?,
        ..Default::default()
    })?;

    cli.run().await
}
