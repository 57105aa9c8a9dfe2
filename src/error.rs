//! Errors returned by the server lifecycle and registration calls.

use crate::config::ConfigError;
use crate::state::ServerState;
use crate::transport::TransportError;
use std::fmt;
use std::io;

/// Lifecycle failures: construction, `run` and `shutdown`.
#[derive(Debug)]
pub enum ServerError {
    /// The operation is not allowed in the server's current state.
    InvalidState {
        /// The operation that was attempted
        operation: &'static str,
        /// The state the server is in
        actual: ServerState,
    },
    /// The transport could not be built or started.
    Transport(TransportError),
    /// The configuration is invalid or its TLS files are unreadable.
    Config(ConfigError),
    /// A queue worker thread could not be spawned.
    Spawn {
        /// Queue index of the worker
        index: usize,
        source: io::Error,
    },
    /// `shutdown` was called from one of the server's own queue workers,
    /// which would have to join itself.
    ShutdownFromWorker,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidState { operation, actual } => {
                write!(f, "cannot {operation} while the server is {actual}")
            }
            ServerError::Transport(e) => write!(f, "transport error: {e}"),
            ServerError::Config(e) => write!(f, "configuration error: {e}"),
            ServerError::Spawn { index, source } => {
                write!(f, "failed to spawn worker for queue {index}: {source}")
            }
            ServerError::ShutdownFromWorker => {
                write!(f, "shutdown cannot be called from a queue worker thread")
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Transport(e) => Some(e),
            ServerError::Config(e) => Some(e),
            ServerError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<TransportError> for ServerError {
    fn from(e: TransportError) -> Self {
        ServerError::Transport(e)
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

/// Failures of `register_service` and `register_method`.
#[derive(Debug)]
pub enum RegistrationError {
    /// The operation is not allowed in the server's current state.
    InvalidState {
        operation: &'static str,
        /// The state the operation requires
        expected: ServerState,
        actual: ServerState,
    },
    /// A service with this name is already registered.
    DuplicateService(String),
    /// The method's service was never registered.
    UnknownService(String),
    /// The service already has a method with this name.
    DuplicateMethod { service: String, method: String },
    /// The transport refused the service.
    Transport(TransportError),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::InvalidState {
                operation,
                expected,
                actual,
            } => write!(
                f,
                "cannot {operation} while the server is {actual} (requires {expected})"
            ),
            RegistrationError::DuplicateService(name) => {
                write!(f, "service '{name}' is already registered")
            }
            RegistrationError::UnknownService(name) => {
                write!(f, "service '{name}' has not been registered")
            }
            RegistrationError::DuplicateMethod { service, method } => {
                write!(f, "method '{service}/{method}' is already registered")
            }
            RegistrationError::Transport(e) => write!(f, "transport refused service: {e}"),
        }
    }
}

impl std::error::Error for RegistrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistrationError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_messages_name_both_states() {
        let err = RegistrationError::InvalidState {
            operation: "register a method",
            expected: ServerState::Running,
            actual: ServerState::Inited,
        };
        assert_eq!(
            err.to_string(),
            "cannot register a method while the server is INITED (requires RUNNING)"
        );
        let err = ServerError::InvalidState {
            operation: "run",
            actual: ServerState::Terminated,
        };
        assert_eq!(err.to_string(), "cannot run while the server is TERMINATED");
    }

    #[test]
    fn test_transport_error_is_the_source() {
        use std::error::Error;
        let err = ServerError::from(TransportError::TlsUnsupported { transport: "tcp" });
        assert!(err.source().is_some());
    }
}
