//! # entlink - Scenario Runner Library
//!
//! Library half of the `entlink` binary, exposed so integration tests can
//! drive configuration loading and scenario runs directly.
//!
//! ## Modules
//!
//! - [`config`]: `entlink.toml` loading and service wiring
//! - [`scenario`]: TOML scenarios and the runner that applies them
//! - [`cli`]: clap command surface

pub mod cli;
pub mod config;
pub mod scenario;
