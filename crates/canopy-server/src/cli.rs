use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "canopy-server", version)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Serve,
    Migrate,
    ProvisionTenant {
        #[arg(long)]
        name: String,
    },
    /// Runs one cache sweep for a tenant and exits.
    Sweep {
        #[arg(long)]
        tenant_id: Option<String>,
    },
}
