//! Tollgate CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// Tollgate - transient traffic perturbations through ingress annotations
#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format: text or json
    #[arg(long, global = true, env = "TOLLGATE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Answer matching requests with a fixed status code for a while
    Block(commands::inject::BlockArgs),
    /// Hold matching requests for a fixed time for a while
    Delay(commands::inject::DelayArgs),
    /// Print the configuration a rule would add, without touching a cluster
    Render(commands::render::RenderArgs),
    /// List rule blocks present on an ingress
    List(commands::list::ListArgs),
    /// Remove a rule block left behind by an interrupted execution
    Clear(commands::clear::ClearArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Block(args) => commands::inject::run_block(args).await,
            Commands::Delay(args) => commands::inject::run_delay(args).await,
            Commands::Render(args) => commands::render::run(args),
            Commands::List(args) => commands::list::run(args).await,
            Commands::Clear(args) => commands::clear::run(args).await,
        }
    }
}
