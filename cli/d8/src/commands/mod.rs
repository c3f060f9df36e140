//! CLI commands.

mod mirror;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{Config, Credentials};
use crate::output::OutputFormat;

/// d8 CLI - Mirror platform images for offline installation.
#[derive(Debug, Parser)]
#[command(name = "d8")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Print debug progress and logs.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Mirror images into local OCI layouts.
    Mirror(mirror::MirrorCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };

        let config = Config::load()?;
        let credentials = Credentials::load()?;

        let ctx = CommandContext {
            config,
            credentials,
            format,
            verbose: self.verbose,
        };

        match self.command {
            Commands::Mirror(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("d8 {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: Config,
    pub credentials: Option<Credentials>,
    pub format: OutputFormat,
    pub verbose: bool,
}
