//! # entlink CLI Module
//!
//! ## Available Commands
//!
//! - `run` - Run a scenario file and print its report
//! - `encode` - Encode a link reference (base64)
//! - `decode` - Decode a base64 link reference
//! - `inspect` - List images held by the configured redb store
//! - `check-config` - Validate and print the effective configuration

mod commands;

use clap::{Parser, Subcommand};
use entlink_core::LinkError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// entlink - entity link scenario runner
///
/// Drives the link engine from TOML scenarios and converts link references
/// to and from their wire form.
#[derive(Parser, Debug)]
#[command(name = "entlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "entlink.toml")]
    pub config: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scenario file
    Run {
        /// Path to the scenario (TOML)
        scenario: PathBuf,
    },

    /// Encode a link reference
    Encode {
        /// Entity type id
        #[arg(short, long, default_value = "1")]
        type_id: u32,

        /// Primary id (integers are encoded narrow when they fit)
        #[arg(short, long)]
        key: String,

        /// Residence site
        #[arg(short, long)]
        site: Option<u32>,

        /// Distribution role (owner, replica, forwarder)
        #[arg(short, long, default_value = "owner")]
        role: String,
    },

    /// Decode a base64 link reference
    Decode {
        /// Base64 of the encoded reference
        data: String,
    },

    /// List images in the configured redb store
    Inspect,

    /// Validate and print the effective configuration
    CheckConfig,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), LinkError> {
    let json_mode = cli.json_mode;

    match cli.command {
        Commands::Run { scenario } => cmd_run(&cli.config, &scenario, json_mode),
        Commands::Encode {
            type_id,
            key,
            site,
            role,
        } => cmd_encode(type_id, &key, site, &role, json_mode),
        Commands::Decode { data } => cmd_decode(&data, json_mode),
        Commands::Inspect => cmd_inspect(&cli.config, json_mode),
        Commands::CheckConfig => cmd_check_config(&cli.config, json_mode),
    }
}
