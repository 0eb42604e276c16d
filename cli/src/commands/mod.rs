//! CLI command definitions and dispatch.

mod build;
mod images;
mod rmi;
mod version;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stratum_core::BuilderConfig;

/// Stratum: layered image builder with a content-addressed build cache.
#[derive(Parser)]
#[command(name = "stratum", version, about)]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Storage root, overriding the configuration
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a build file
    Build(build::BuildArgs),
    /// List stored images
    Images(images::ImagesArgs),
    /// Remove one or more image names
    Rmi(rmi::RmiArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Global options every command needs to open the stores.
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub config: Option<PathBuf>,
    pub root: Option<PathBuf>,
}

impl GlobalOpts {
    /// Configuration file, then environment, then `--root`.
    pub fn load_config(&self) -> Result<BuilderConfig, Box<dyn std::error::Error>> {
        let mut config = BuilderConfig::load(self.config.as_deref())?;
        if let Some(root) = &self.root {
            config.tmp_dir = root.join("tmp");
            config.root_dir = root.clone();
        }
        Ok(config)
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let global = GlobalOpts {
        config: cli.config,
        root: cli.root,
    };

    match cli.command {
        Command::Build(args) => build::execute(args, &global).await,
        Command::Images(args) => images::execute(args, &global).await,
        Command::Rmi(args) => rmi::execute(args, &global).await,
        Command::Version(args) => version::execute(args).await,
    }
}
