//! # Transport Module
//!
//! The dispatch core never touches sockets. It talks to a transport through two
//! traits:
//!
//! - [`TransportBuilder`] collects service objects while the server is
//!   `INITED` and is consumed by `run` to produce a started [`Transport`].
//! - [`Transport`] arms pending accepts (`request_call`), rejects new work
//!   on `shutdown` and releases its connections on `close` once every queue
//!   has drained.
//!
//! Inbound calls reach the engine as [`IncomingCall`]s carried by
//! [`Event::Accepted`](crate::queue::Event::Accepted) on the queue named in the
//! matching `request_call`. Replies go back through the call's [`ReplySink`].
//!
//! Two transports ship with the crate:
//!
//! - [`tcp`]: newline-delimited JSON frames over TCP
//! - [`local`]: in-process calls, used by tests and embedders
//!
//! Both pair inbound calls with pending accepts through [`CallMatcher`].

pub mod local;
mod matcher;
pub mod tcp;

pub use matcher::CallMatcher;

use crate::queue::{CallTag, CompletionQueue};
use crate::status::Status;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Encoded response payload, or the failure status to send instead.
pub type Reply = Result<Vec<u8>, Status>;

/// Write side of one inbound call.
pub trait ReplySink: Send {
    /// Writes the reply. Returns `true` when the transport accepted the write.
    fn send(self: Box<Self>, reply: Reply) -> bool;
}

/// An inbound request waiting for (or just handed to) a call instance.
pub struct IncomingCall {
    service: String,
    method: String,
    payload: Vec<u8>,
    peer: String,
    sink: Box<dyn ReplySink>,
}

impl IncomingCall {
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        payload: Vec<u8>,
        peer: impl Into<String>,
        sink: Box<dyn ReplySink>,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            payload,
            peer: peer.into(),
            sink,
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends the reply and consumes the call.
    pub fn finish(self, reply: Reply) -> bool {
        self.sink.send(reply)
    }

    /// Fails the call without it ever reaching a handler.
    pub fn reject(self, status: Status) -> bool {
        self.finish(Err(status))
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, String, Box<dyn ReplySink>) {
        (self.payload, self.peer, self.sink)
    }
}

impl fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingCall")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("payload_len", &self.payload.len())
            .field("peer", &self.peer)
            .finish()
    }
}

/// Transport-level service object, created once per registered service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    name: Arc<str>,
    id: usize,
}

impl ServiceHandle {
    #[must_use]
    pub fn new(name: &str, id: usize) -> Self {
        Self {
            name: Arc::from(name),
            id,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }
}

/// PEM key and certificate handed to the transport when encryption is wanted.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    key_pem: String,
    cert_pem: String,
}

impl TlsMaterial {
    #[must_use]
    pub fn from_pem(key_pem: impl Into<String>, cert_pem: impl Into<String>) -> Self {
        Self {
            key_pem: key_pem.into(),
            cert_pem: cert_pem.into(),
        }
    }

    #[must_use]
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("key_pem", &"<REDACTED>")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish()
    }
}

/// Collects services before the server runs.
pub trait TransportBuilder: Send {
    /// Short transport name for logs.
    fn kind(&self) -> &'static str;

    /// Creates the transport-level object for a service.
    fn register_service(&mut self, name: &'static str) -> Result<ServiceHandle, TransportError>;

    /// Starts the transport. `queues` are the completion queues accepts may be
    /// armed on.
    fn build(
        self: Box<Self>,
        queues: &[Arc<CompletionQueue>],
    ) -> Result<Arc<dyn Transport>, TransportError>;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// A started transport.
pub trait Transport: Send + Sync {
    /// Arms one pending accept for `service/method`. When a request arrives
    /// the transport posts `Event::Accepted { tag, .. }` on `queue`; on
    /// shutdown it posts `Event::Completed { tag, ok: false }` instead.
    ///
    /// Returns `false` if the accept could not be armed (transport shut down
    /// or service unknown); nothing is posted in that case.
    fn request_call(
        &self,
        service: &ServiceHandle,
        method: &str,
        queue: &Arc<CompletionQueue>,
        tag: CallTag,
    ) -> bool;

    /// Rejects new inbound work and cancels every pending accept.
    fn shutdown(&self);

    /// Called after every queue worker has exited. Replies handed to a sink
    /// before this point may still be flushed; anything left is dropped.
    fn close(&self) {}

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Transport construction and registration failures.
#[derive(Debug)]
pub enum TransportError {
    /// The listen address could not be bound.
    Bind { addr: String, source: io::Error },
    /// The transport cannot encrypt connections.
    TlsUnsupported { transport: &'static str },
    /// The service name is already known to the transport.
    DuplicateService(String),
    /// Any other I/O failure while starting the transport.
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Bind { addr, source } => {
                write!(f, "failed to bind listen address '{addr}': {source}")
            }
            TransportError::TlsUnsupported { transport } => {
                write!(f, "the {transport} transport does not support TLS")
            }
            TransportError::DuplicateService(name) => {
                write!(f, "service '{name}' is already registered with the transport")
            }
            TransportError::Io(e) => write!(f, "transport I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Bind { source, .. } => Some(source),
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}
