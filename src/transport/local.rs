//! In-process transport.
//!
//! [`channel`] returns a builder for the server side and a [`LocalClient`]
//! that submits calls straight into the server's [`CallMatcher`]. Replies come
//! back over `may` mpsc channels, so a client can be driven from plain threads
//! or from coroutines.
//!
//! ```rust,ignore
//! let (builder, client) = brrtrpc::transport::local::channel();
//! let server = RpcServer::with_transport(config, Box::new(builder))?;
//! // register, run, register methods...
//! let reply: EchoReply = client.call("demo.Echo", "Say", &EchoRequest { text })?;
//! ```

use super::{CallMatcher, IncomingCall, Reply, ReplySink, ServiceHandle, Transport, TransportBuilder, TransportError};
use crate::queue::{CallTag, CompletionQueue};
use crate::status::Status;
use may::sync::mpsc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Creates a connected builder/client pair.
#[must_use]
pub fn channel() -> (LocalTransportBuilder, LocalClient) {
    let matcher = Arc::new(CallMatcher::new());
    let builder = LocalTransportBuilder {
        matcher: Arc::clone(&matcher),
        services: 0,
    };
    let client = LocalClient {
        matcher,
        next_peer: Arc::new(AtomicU64::new(0)),
    };
    (builder, client)
}

pub struct LocalTransportBuilder {
    matcher: Arc<CallMatcher>,
    services: usize,
}

impl TransportBuilder for LocalTransportBuilder {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn register_service(&mut self, name: &'static str) -> Result<ServiceHandle, TransportError> {
        if !self.matcher.add_service(name) {
            return Err(TransportError::DuplicateService(name.to_string()));
        }
        let handle = ServiceHandle::new(name, self.services);
        self.services += 1;
        Ok(handle)
    }

    fn build(
        self: Box<Self>,
        _queues: &[Arc<CompletionQueue>],
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(LocalTransport {
            matcher: self.matcher,
        }))
    }
}

struct LocalTransport {
    matcher: Arc<CallMatcher>,
}

impl Transport for LocalTransport {
    fn request_call(
        &self,
        service: &ServiceHandle,
        method: &str,
        queue: &Arc<CompletionQueue>,
        tag: CallTag,
    ) -> bool {
        self.matcher.request_call(service.name(), method, queue, tag)
    }

    fn shutdown(&self) {
        self.matcher.shutdown();
    }
}

struct ChannelSink {
    tx: mpsc::Sender<Reply>,
}

impl ReplySink for ChannelSink {
    fn send(self: Box<Self>, reply: Reply) -> bool {
        self.tx.send(reply).is_ok()
    }
}

/// A reply that has not necessarily arrived yet.
pub struct PendingReply {
    rx: mpsc::Receiver<Reply>,
}

impl PendingReply {
    /// Blocks until the server replies.
    pub fn wait(self) -> Reply {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(Status::unavailable("reply channel closed")))
    }

    /// Blocks until the server replies and decodes the payload.
    pub fn wait_for<Resp: DeserializeOwned>(self) -> Result<Resp, Status> {
        let bytes = self.wait()?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Status::internal(format!("failed to decode reply: {e}")))
    }
}

/// Submits calls to a server built on the local transport.
#[derive(Clone)]
pub struct LocalClient {
    matcher: Arc<CallMatcher>,
    next_peer: Arc<AtomicU64>,
}

impl LocalClient {
    /// Submits an already-encoded request.
    pub fn submit_raw(&self, service: &str, method: &str, payload: Vec<u8>) -> PendingReply {
        let (tx, rx) = mpsc::channel();
        let peer = format!("local:{}", self.next_peer.fetch_add(1, Ordering::Relaxed));
        self.matcher.deliver(IncomingCall::new(
            service,
            method,
            payload,
            peer,
            Box::new(ChannelSink { tx }),
        ));
        PendingReply { rx }
    }

    /// Encodes and submits a request without waiting for the reply.
    pub fn submit<Req: Serialize>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<PendingReply, Status> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| Status::invalid_argument(format!("failed to encode request: {e}")))?;
        Ok(self.submit_raw(service, method, payload))
    }

    /// Round trip: encode, submit, wait, decode.
    pub fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Resp, Status> {
        self.submit(service, method, request)?.wait_for()
    }

    /// The matcher shared with the server side.
    #[must_use]
    pub fn matcher(&self) -> &Arc<CallMatcher> {
        &self.matcher
    }
}
