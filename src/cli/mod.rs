//! # CLI Module
//!
//! Command-line entry points for the `brrtrpc` binary.
//!
//! ## Commands
//!
//! ### `serve`
//!
//! Runs the demo echo service over TCP until SIGINT or SIGTERM:
//!
//! ```bash
//! brrtrpc serve --listen 127.0.0.1:50051 --threads 4
//! ```
//!
//! ### `check-config`
//!
//! Prints the fully resolved configuration (file, environment, flags) as JSON
//! and exits non-zero if it is invalid:
//!
//! ```bash
//! BRRTRPC_THREADS=8 brrtrpc --config server.toml check-config
//! ```
//!
//! ## Usage from Code
//!
//! ```rust,ignore
//! use brrtrpc::cli::{run_cli, Cli};
//! use clap::Parser;
//!
//! run_cli(Cli::parse())?;
//! ```

mod commands;


pub use commands::{config_warnings, resolve_config, run_cli, Cli, Commands, ConfigOverrides};
