use crate::config::{parse_size, ServerConfig};
use crate::logging::{init_logging, LogConfig};
use crate::server::{RpcServer, ThreadStartHook};
use crate::echo;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Command-line interface for brrtrpc
#[derive(Parser, Debug)]
#[command(name = "brrtrpc", version)]
#[command(about = "Multi-queue RPC dispatch server", long_about = None)]
pub struct Cli {
    /// Config file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "BRRTRPC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the demo echo service until SIGINT/SIGTERM
    Serve {
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Print the resolved configuration as JSON
    CheckConfig {
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
}

/// Flags that win over the config file and the environment.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Listen address, e.g. 127.0.0.1:50051
    #[arg(long)]
    pub listen: Option<String>,

    /// Number of completion queues / worker threads
    #[arg(long)]
    pub threads: Option<usize>,

    /// Worker stack size in bytes (decimal or 0x hex)
    #[arg(long, value_parser = parse_stack_size)]
    pub stack_size: Option<usize>,

    /// PEM private key
    #[arg(long)]
    pub ssl_key: Option<PathBuf>,

    /// PEM certificate chain
    #[arg(long)]
    pub ssl_cert: Option<PathBuf>,

    /// Panic on lifecycle usage errors
    #[arg(long)]
    pub strict_usage: Option<bool>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = &self.listen {
            config.listen_addr.clone_from(listen);
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(stack_size) = self.stack_size {
            config.stack_size = stack_size;
        }
        if let Some(key) = &self.ssl_key {
            config.ssl_key = Some(key.clone());
        }
        if let Some(cert) = &self.ssl_cert {
            config.ssl_cert = Some(cert.clone());
        }
        if let Some(strict) = self.strict_usage {
            config.strict_usage = strict;
        }
    }
}

fn parse_stack_size(raw: &str) -> Result<usize, String> {
    parse_size(raw).ok_or_else(|| format!("invalid size '{raw}': expected decimal or 0x hex"))
}

/// Defaults, then `config_path`, then environment, then `overrides`.
pub fn resolve_config(config_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<ServerConfig> {
    let mut config = match config_path {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid BRRTRPC_* environment variable")?;
    overrides.apply(&mut config);
    config.validate().context("Invalid server configuration")?;
    Ok(config)
}

pub fn run_cli(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Serve { overrides } => {
            let config = resolve_config(cli.config.as_deref(), overrides)?;
            let _logging = init_logging(&LogConfig::from_env())?;
            serve(config)
        }
        Commands::CheckConfig { overrides } => {
            let config = resolve_config(cli.config.as_deref(), overrides)?;
            let rendered =
                serde_json::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{rendered}");
            for warning in config_warnings(&config) {
                eprintln!("warning: {warning}");
            }
            Ok(())
        }
    }
}

/// Settings that resolve but won't behave as written with the built-in
/// TCP transport `serve` uses.
#[must_use]
pub fn config_warnings(config: &ServerConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.tls_enabled() {
        warnings.push(
            "ssl_key/ssl_cert are set but the tcp transport does not support TLS; `serve` will refuse to start"
                .to_string(),
        );
    } else if config.ssl_key.is_some() || config.ssl_cert.is_some() {
        warnings.push("only one of ssl_key/ssl_cert is set; TLS settings are ignored".to_string());
    }
    warnings
}

fn serve(config: ServerConfig) -> Result<()> {
    let server = RpcServer::make(config).context("Failed to create RPC server")?;
    echo::register_service(&server).context("Failed to register echo service")?;

    let hook: ThreadStartHook = Arc::new(|queue| debug!(queue, "Queue worker thread started"));
    server.run(Some(hook)).context("Failed to start RPC server")?;
    echo::register_methods(&server).context("Failed to register echo methods")?;

    info!(
        listen_addr = ?server.local_addr(),
        methods = ?server.method_names(),
        "Serving demo echo service"
    );
    wait_for_signal()?;

    server.shutdown().context("Shutdown failed")?;
    for metrics in server.queue_metrics() {
        info!(
            queue = metrics.queue,
            accepted = metrics.accepted,
            completed = metrics.completed,
            failed = metrics.failed,
            cancelled = metrics.cancelled,
            "Queue totals"
        );
    }
    Ok(())
}

#[cfg(unix)]
fn wait_for_signal() -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
    if let Some(signal) = signals.forever().next() {
        info!(signal, "Received shutdown signal");
    }
    Ok(())
}

#[cfg(not(unix))]
fn wait_for_signal() -> Result<()> {
    loop {
        std::thread::park();
    }
}
