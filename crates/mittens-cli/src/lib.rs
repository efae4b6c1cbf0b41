//! mittens CLI library

pub mod commands;
pub mod config;
pub mod error;

use std::path::PathBuf;

pub use error::{Error, Result};

use clap::{Args, Parser, Subcommand};

/// mittens - tap a Kubernetes Service with an intercepting proxy
#[derive(Parser, Debug)]
#[command(name = "mittens")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Path to the kubeconfig file
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// JSON file overriding names, images and timings
    #[arg(long, global = true, env = "MITTENS_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Tap a Service and attach to the proxy
    Tap(commands::tap::TapArgs),
    /// Remove a tap and everything it created
    Untap(commands::untap::UntapArgs),
    /// Print the version
    Version,
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Tap(args) => commands::tap::run(args, &self.global).await,
            Commands::Untap(args) => commands::untap::run(args, &self.global).await,
            Commands::Version => {
                commands::version::run();
                Ok(())
            }
        }
    }
}
