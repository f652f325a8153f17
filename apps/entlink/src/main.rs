//! # entlink - Entity Link Scenario Runner
//!
//! The binary for the entlink engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            apps/entlink (THE BINARY)         │
//! │                                              │
//! │   ┌──────────────┐      ┌────────────────┐   │
//! │   │     CLI      │      │ scenario runner│   │
//! │   │   (clap)     │─────▶│  (TOML files)  │   │
//! │   └──────────────┘      └───────┬────────┘   │
//! │                                 ▼            │
//! │                        ┌────────────────┐    │
//! │                        │  entlink-core  │    │
//! │                        │  (THE ENGINE)  │    │
//! │                        └────────────────┘    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! entlink run demos/migration.toml
//! entlink encode --type-id 3 --key 17 --site 2 --role replica
//! entlink decode <base64>
//! entlink --config entlink.toml inspect
//! ```

use clap::Parser;
use entlink::cli;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = cli::Cli::parse();

    // ENTLINK_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("ENTLINK_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let default_filter = if cli.verbose {
        "entlink=debug,entlink_core=debug"
    } else {
        "entlink=info,entlink_core=info"
    };
    let filter = EnvFilter::try_from_env("ENTLINK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| default_filter.into());

    // Logs go to stderr so report output stays clean on stdout.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
