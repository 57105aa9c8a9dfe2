//! Newline-delimited JSON over TCP.
//!
//! Every line a client writes is one request frame:
//!
//! ```json
//! {"id": 7, "service": "demo.Echo", "method": "Say", "payload": {"text": "hi"}}
//! ```
//!
//! and every reply is one line carrying the same `id`:
//!
//! ```json
//! {"id": 7, "code": "ok", "message": "", "payload": {"text": "hi"}}
//! ```
//!
//! Replies may come back in any order. The listener is bound in
//! [`TcpTransportBuilder::bind`] so bind failures surface at construction.
//! Each connection gets a reader thread and a writer thread. Queue workers
//! only hand reply frames to the writer over a channel, so a peer that stops
//! reading stalls its own connection and nothing else.

use super::{CallMatcher, IncomingCall, Reply, ReplySink, ServiceHandle, TlsMaterial, Transport, TransportBuilder, TransportError};
use crate::queue::{CallTag, CompletionQueue};
use crate::status::{Status, StatusCode};
use may::sync::mpsc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long `close` waits for connection writers to flush queued replies.
pub const WRITER_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// One request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: u64,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub payload: Value,
}

/// One reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireReply {
    pub id: u64,
    pub code: StatusCode,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Value,
}

impl WireReply {
    fn from_reply(id: u64, reply: Reply) -> Self {
        match reply {
            Ok(bytes) => WireReply {
                id,
                code: StatusCode::Ok,
                message: String::new(),
                payload: serde_json::from_slice(&bytes).unwrap_or(Value::Null),
            },
            Err(status) => WireReply {
                id,
                code: status.code,
                message: status.message,
                payload: Value::Null,
            },
        }
    }

    /// The reply as a `Result`, for clients.
    pub fn into_result(self) -> Result<Value, Status> {
        if self.code == StatusCode::Ok {
            Ok(self.payload)
        } else {
            Err(Status::new(self.code, self.message))
        }
    }
}

/// Frames queued for one connection's writer thread.
type FrameSender = mpsc::Sender<WireReply>;

/// Writes queued frames until every sender is gone or the peer stops
/// accepting bytes. Dropping the receiver makes later sends fail.
fn write_frames(connection: u64, stream: TcpStream, frames: mpsc::Receiver<WireReply>) {
    let mut writer = BufWriter::new(stream);
    while let Ok(reply) = frames.recv() {
        let mut line = match serde_json::to_vec(&reply) {
            Ok(line) => line,
            Err(e) => {
                error!(connection, id = reply.id, error = %e, "Failed to encode reply frame");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).and_then(|()| writer.flush()) {
            debug!(connection, id = reply.id, error = %e, "Reply write failed");
            break;
        }
    }
}

struct TcpReplySink {
    id: u64,
    frames: FrameSender,
}

impl ReplySink for TcpReplySink {
    /// Queues the frame for the connection's writer; never blocks.
    fn send(self: Box<Self>, reply: Reply) -> bool {
        self.frames
            .send(WireReply::from_reply(self.id, reply))
            .is_ok()
    }
}

/// Binds the listener and collects services.
pub struct TcpTransportBuilder {
    listener: TcpListener,
    local_addr: SocketAddr,
    matcher: Arc<CallMatcher>,
    services: usize,
}

impl TcpTransportBuilder {
    /// Binds `addr`. TLS material is refused: this transport only speaks
    /// plaintext.
    pub fn bind(addr: &str, tls: Option<&TlsMaterial>) -> Result<Self, TransportError> {
        if tls.is_some() {
            return Err(TransportError::TlsUnsupported { transport: "tcp" });
        }
        let listener = TcpListener::bind(addr).map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        info!(listen_addr = %local_addr, "TCP transport bound");
        Ok(Self {
            listener,
            local_addr,
            matcher: Arc::new(CallMatcher::new()),
            services: 0,
        })
    }
}

impl TransportBuilder for TcpTransportBuilder {
    fn kind(&self) -> &'static str {
        "tcp"
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
        let shared = Arc::new(TcpShared {
            matcher: self.matcher,
            local_addr: self.local_addr,
            stopping: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
        });
        let listener = self.listener;
        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("brrtrpc-accept".to_string())
                .spawn(move || accept_loop(&listener, &shared))?
        };
        Ok(Arc::new(TcpTransport {
            shared,
            acceptor: Mutex::new(Some(acceptor)),
        }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

struct TcpShared {
    matcher: Arc<CallMatcher>,
    local_addr: SocketAddr,
    stopping: AtomicBool,
    connections: Mutex<HashMap<u64, Connection>>,
    next_connection: AtomicU64,
}

/// A live connection: a handle on the socket for closing it, and its writer.
struct Connection {
    stream: TcpStream,
    writer: JoinHandle<()>,
}

fn accept_loop(listener: &TcpListener, shared: &Arc<TcpShared>) {
    for stream in listener.incoming() {
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => {
                let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
                let conn_shared = Arc::clone(shared);
                let spawned = thread::Builder::new()
                    .name(format!("brrtrpc-conn-{id}"))
                    .spawn(move || serve_connection(&conn_shared, id, stream));
                if let Err(e) = spawned {
                    error!(connection = id, error = %e, "Failed to spawn connection thread");
                }
            }
            Err(e) => warn!(error = %e, "Failed to accept connection"),
        }
    }
    debug!("TCP accept loop exiting");
}

/// Starts the writer thread for connection `id` and records the connection.
/// Returns the sender replies are queued on, or `None` when the transport is
/// stopping or the writer could not be started.
fn open_connection(shared: &Arc<TcpShared>, id: u64, stream: &TcpStream) -> Option<FrameSender> {
    let (write_half, closer) = match (stream.try_clone(), stream.try_clone()) {
        (Ok(write_half), Ok(closer)) => (write_half, closer),
        (Err(e), _) | (_, Err(e)) => {
            warn!(connection = id, error = %e, "Failed to clone connection");
            return None;
        }
    };

    // Held across the spawn so the writer's own removal can't overtake the insert.
    let mut connections = shared.connections.lock();
    if shared.stopping.load(Ordering::Acquire) {
        let _ = closer.shutdown(Shutdown::Both);
        return None;
    }
    let (frames, queued) = mpsc::channel();
    let writer_shared = Arc::clone(shared);
    let writer = thread::Builder::new()
        .name(format!("brrtrpc-conn-{id}-w"))
        .spawn(move || {
            write_frames(id, write_half, queued);
            writer_shared.connections.lock().remove(&id);
        });
    match writer {
        Ok(writer) => {
            connections.insert(
                id,
                Connection {
                    stream: closer,
                    writer,
                },
            );
            Some(frames)
        }
        Err(e) => {
            error!(connection = id, error = %e, "Failed to spawn connection writer");
            None
        }
    }
}

fn serve_connection(shared: &Arc<TcpShared>, id: u64, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
    let Some(frames) = open_connection(shared, id, &stream) else {
        return;
    };
    debug!(connection = id, peer = %peer, "Connection opened");

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!(connection = id, error = %e, "Connection read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<WireRequest>(line) {
            Ok(frame) => {
                let payload = match serde_json::to_vec(&frame.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        let status = Status::invalid_argument(format!("bad payload: {e}"));
                        let _ = frames.send(WireReply::from_reply(frame.id, Err(status)));
                        continue;
                    }
                };
                shared.matcher.deliver(IncomingCall::new(
                    frame.service,
                    frame.method,
                    payload,
                    peer.clone(),
                    Box::new(TcpReplySink {
                        id: frame.id,
                        frames: frames.clone(),
                    }),
                ));
            }
            Err(e) => {
                warn!(connection = id, peer = %peer, error = %e, "Malformed request frame");
                let status = Status::invalid_argument(format!("malformed frame: {e}"));
                let _ = frames.send(WireReply::from_reply(0, Err(status)));
            }
        }
    }

    // The writer keeps running until the last in-flight reply is queued.
    debug!(connection = id, peer = %peer, "Connection read side closed");
}

struct TcpTransport {
    shared: Arc<TcpShared>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Address to connect to in order to wake the blocked accept call.
    fn wake_addr(&self) -> SocketAddr {
        let mut addr = self.shared.local_addr;
        if addr.ip().is_unspecified() {
            let loopback = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
        }
        addr
    }
}

impl Transport for TcpTransport {
    fn request_call(
        &self,
        service: &ServiceHandle,
        method: &str,
        queue: &Arc<CompletionQueue>,
        tag: CallTag,
    ) -> bool {
        self.shared
            .matcher
            .request_call(service.name(), method, queue, tag)
    }

    fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.matcher.shutdown();

        // Stop reading new frames; in-flight replies can still be written.
        for conn in self.shared.connections.lock().values() {
            let _ = conn.stream.shutdown(Shutdown::Read);
        }

        if let Err(e) = TcpStream::connect(self.wake_addr()) {
            debug!(error = %e, "Wake-up connect to acceptor failed");
        }
        if let Some(acceptor) = self.acceptor.lock().take() {
            if acceptor.join().is_err() {
                error!("TCP accept thread panicked");
            }
        }
        info!(listen_addr = %self.shared.local_addr, "TCP transport shut down");
    }

    /// Gives writers [`WRITER_DRAIN_GRACE`] to flush, then closes every
    /// connection so a peer that stopped reading can't hold a writer forever.
    fn close(&self) {
        let connections: Vec<_> = self.shared.connections.lock().drain().collect();
        let deadline = Instant::now() + WRITER_DRAIN_GRACE;
        while Instant::now() < deadline
            && connections.iter().any(|(_, conn)| !conn.writer.is_finished())
        {
            thread::sleep(Duration::from_millis(5));
        }
        for (id, conn) in connections {
            if !conn.writer.is_finished() {
                warn!(connection = id, "Peer is not reading replies; dropping connection");
            }
            let _ = conn.stream.shutdown(Shutdown::Both);
            if conn.writer.join().is_err() {
                error!(connection = id, "Connection writer panicked");
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.shared.local_addr)
    }
}
