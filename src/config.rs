//! # Server Configuration
//!
//! [`ServerConfig`] is resolved in layers, later layers winning:
//!
//! 1. built-in defaults
//! 2. a TOML, YAML or JSON file (picked by extension)
//! 3. `BRRTRPC_*` environment variables
//! 4. command-line flags (see the `brrtrpc` binary)
//!
//! ## Environment Variables
//!
//! | Variable | Field | Example |
//! |----------|-------|---------|
//! | `BRRTRPC_LISTEN_ADDR` | `listen_addr` | `127.0.0.1:7000` |
//! | `BRRTRPC_THREADS` | `threads` | `4` |
//! | `BRRTRPC_SSL_KEY` | `ssl_key` | `/etc/brrtrpc/key.pem` |
//! | `BRRTRPC_SSL_CERT` | `ssl_cert` | `/etc/brrtrpc/cert.pem` |
//! | `BRRTRPC_STACK_SIZE` | `stack_size` | `0x200000` or `2097152` |
//! | `BRRTRPC_STRICT_USAGE` | `strict_usage` | `true` / `0` |
//!
//! `BRRTRPC_STACK_SIZE` accepts decimal or `0x`-prefixed hexadecimal. A stack
//! size of `0` leaves the platform default in place.
//!
//! ## Example
//!
//! ```toml
//! listen_addr = "0.0.0.0:50051"
//! threads = 4
//! stack_size = 0x400000
//! ```

use crate::transport::TlsMaterial;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:50051";
const DEFAULT_STACK_SIZE: usize = 0x20_0000;

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the default TCP transport binds
    pub listen_addr: String,
    /// Number of completion queues, each with its own worker thread
    pub threads: usize,
    /// PEM private key; only used together with `ssl_cert`
    pub ssl_key: Option<PathBuf>,
    /// PEM certificate chain; only used together with `ssl_key`
    pub ssl_cert: Option<PathBuf>,
    /// Worker thread stack size in bytes
    pub stack_size: usize,
    /// Panic on lifecycle usage errors instead of only returning them
    pub strict_usage: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            threads: 1,
            ssl_key: None,
            ssl_cert: None,
            stack_size: DEFAULT_STACK_SIZE,
            strict_usage: cfg!(debug_assertions),
        }
    }
}

impl ServerConfig {
    /// Reads a config file. The format follows the extension: `.toml`,
    /// `.yaml`/`.yml` or `.json`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let parsed = match ext.as_deref() {
            Some("toml") => toml::from_str(&text).map_err(|e| e.to_string()),
            Some("yaml" | "yml") => serde_yaml::from_str(&text).map_err(|e| e.to_string()),
            Some("json") => serde_json::from_str(&text).map_err(|e| e.to_string()),
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    path: path.to_path_buf(),
                })
            }
        };
        let config = parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        debug!(path = %path.display(), "Loaded server config file");
        Ok(config)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("BRRTRPC_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(raw) = lookup("BRRTRPC_THREADS") {
            self.threads = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid_env("BRRTRPC_THREADS", &raw, "expected an integer"))?;
        }
        if let Some(key) = lookup("BRRTRPC_SSL_KEY") {
            self.ssl_key = non_empty_path(key);
        }
        if let Some(cert) = lookup("BRRTRPC_SSL_CERT") {
            self.ssl_cert = non_empty_path(cert);
        }
        if let Some(raw) = lookup("BRRTRPC_STACK_SIZE") {
            self.stack_size = parse_size(&raw).ok_or_else(|| {
                ConfigError::invalid_env("BRRTRPC_STACK_SIZE", &raw, "expected decimal or 0x hex")
            })?;
        }
        if let Some(raw) = lookup("BRRTRPC_STRICT_USAGE") {
            self.strict_usage = parse_bool(&raw).ok_or_else(|| {
                ConfigError::invalid_env("BRRTRPC_STRICT_USAGE", &raw, "expected true or false")
            })?;
        }
        Ok(())
    }

    /// Defaults plus environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then `path` if given, then environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::EmptyListenAddr);
        }
        Ok(())
    }

    /// True when both TLS files are configured.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.ssl_key.is_some() && self.ssl_cert.is_some()
    }

    /// Reads the TLS key and certificate. A single configured path is ignored
    /// with a warning.
    pub fn tls_material(&self) -> Result<Option<TlsMaterial>, ConfigError> {
        match (&self.ssl_key, &self.ssl_cert) {
            (Some(key), Some(cert)) => {
                let key_pem = read_pem(key)?;
                let cert_pem = read_pem(cert)?;
                Ok(Some(TlsMaterial::from_pem(key_pem, cert_pem)))
            }
            (None, None) => Ok(None),
            (key, cert) => {
                warn!(
                    ssl_key = ?key,
                    ssl_cert = ?cert,
                    "Only one of ssl_key/ssl_cert is set; serving without TLS"
                );
                Ok(None)
            }
        }
    }

    #[must_use]
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, key: impl Into<PathBuf>, cert: impl Into<PathBuf>) -> Self {
        self.ssl_key = Some(key.into());
        self.ssl_cert = Some(cert.into());
        self
    }

    #[must_use]
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    #[must_use]
    pub fn with_strict_usage(mut self, strict: bool) -> Self {
        self.strict_usage = strict;
        self
    }
}

fn non_empty_path(raw: String) -> Option<PathBuf> {
    if raw.trim().is_empty() {
        None
    } else {
        Some(PathBuf::from(raw))
    }
}

fn read_pem(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::TlsFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses a byte size written in decimal or as `0x` hexadecimal.
#[must_use]
pub fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        usize::from_str_radix(&hex.replace('_', ""), 16).ok()
    } else {
        raw.replace('_', "").parse().ok()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration loading and validation errors.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read
    Read { path: PathBuf, source: io::Error },
    /// The config file is not valid for its format
    Parse { path: PathBuf, message: String },
    /// The config file extension is not toml, yaml, yml or json
    UnsupportedFormat { path: PathBuf },
    /// An environment variable holds an unusable value
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    /// `threads` is zero
    ZeroThreads,
    /// `listen_addr` is empty
    EmptyListenAddr,
    /// A TLS key or certificate file could not be read
    TlsFile { path: PathBuf, source: io::Error },
}

impl ConfigError {
    fn invalid_env(var: &'static str, value: &str, reason: &'static str) -> Self {
        ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
            reason,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file '{}': {source}", path.display())
            }
            ConfigError::Parse { path, message } => {
                write!(f, "invalid config file '{}': {message}", path.display())
            }
            ConfigError::UnsupportedFormat { path } => write!(
                f,
                "unsupported config file '{}': expected .toml, .yaml, .yml or .json",
                path.display()
            ),
            ConfigError::InvalidEnv { var, value, reason } => {
                write!(f, "invalid value '{value}' for {var}: {reason}")
            }
            ConfigError::ZeroThreads => write!(f, "threads must be at least 1"),
            ConfigError::EmptyListenAddr => write!(f, "listen_addr must not be empty"),
            ConfigError::TlsFile { path, source } => {
                write!(f, "failed to read TLS file '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } | ConfigError::TlsFile { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_size_decimal_and_hex() {
        assert_eq!(parse_size("16384"), Some(16384));
        assert_eq!(parse_size("0x4000"), Some(0x4000));
        assert_eq!(parse_size(" 0X20_0000 "), Some(0x20_0000));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn test_env_overrides_defaults() {
        let mut config = ServerConfig::default();
        config
            .apply_env_from(env(&[
                ("BRRTRPC_LISTEN_ADDR", "127.0.0.1:9000"),
                ("BRRTRPC_THREADS", "4"),
                ("BRRTRPC_STACK_SIZE", "0x8000"),
                ("BRRTRPC_STRICT_USAGE", "off"),
            ]))
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.threads, 4);
        assert_eq!(config.stack_size, 0x8000);
        assert!(!config.strict_usage);
    }

    #[test]
    fn test_bad_env_value_names_variable() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env_from(env(&[("BRRTRPC_THREADS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("BRRTRPC_THREADS"));
    }

    #[test]
    fn test_validate_rejects_zero_threads_and_empty_addr() {
        let config = ServerConfig::default().with_threads(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroThreads)));
        let config = ServerConfig::default().with_listen_addr("  ");
        assert!(matches!(config.validate(), Err(ConfigError::EmptyListenAddr)));
    }

    #[test]
    fn test_single_tls_path_is_ignored() {
        let mut config = ServerConfig::default();
        config.ssl_key = Some(PathBuf::from("/nonexistent/key.pem"));
        assert!(!config.tls_enabled());
        assert!(config.tls_material().unwrap().is_none());
    }
}
