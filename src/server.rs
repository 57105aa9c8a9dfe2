//! # Server Lifecycle
//!
//! [`RpcServer`] owns the registry, the completion queues and their workers,
//! and the lifecycle state:
//!
//! ```text
//! make / with_transport      -> INITED        register_service
//! run                        -> RUNNING       register_method
//! shutdown                   -> SHUTTING_DOWN -> TERMINATED
//! ```
//!
//! Services must be registered before `run` because the transport is built
//! from them; methods can only be registered after `run` because registering a
//! method arms accepts on the live transport.
//!
//! ## Example
//!
//! ```rust,no_run
//! use brrtrpc::{RpcServer, RpcService, ServerConfig};
//! use serde::{Deserialize, Serialize};
//!
//! struct Echo;
//! impl RpcService for Echo {
//!     const NAME: &'static str = "demo.Echo";
//! }
//!
//! #[derive(Deserialize, Serialize)]
//! struct Msg {
//!     text: String,
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = RpcServer::make(ServerConfig::default().with_threads(2))?;
//! server.register_service::<Echo>()?;
//! server.run(None)?;
//! server.register_method::<Echo, Msg, Msg>(
//!     "Say",
//!     |_| {},
//!     |call| {
//!         let text = call.request().text.clone();
//!         call.respond(Msg { text });
//!     },
//!     None,
//! )?;
//! // ... later
//! server.shutdown()?;
//! # Ok(())
//! # }
//! ```

use crate::call;
use crate::config::ServerConfig;
use crate::error::{RegistrationError, ServerError};
use crate::method::{DoneCallback, MethodDescriptor, RpcCall, RpcService};
use crate::registry::{Registry, ServiceDescriptor};
use crate::state::{AtomicServerState, ServerState};
use crate::transport::tcp::TcpTransportBuilder;
use crate::transport::{Transport, TransportBuilder, TransportError};
use crate::worker::{self, Lane, QueueMetricsSnapshot};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{error, info, warn};

/// Called on each queue worker thread, with the queue index, before the
/// worker starts draining its queue.
pub type ThreadStartHook = Arc<dyn Fn(usize) + Send + Sync>;

/// State shared between the controller and its queue workers.
pub(crate) struct ServerShared {
    pub(crate) state: AtomicServerState,
    pub(crate) config: ServerConfig,
    pub(crate) registry: Registry,
    pub(crate) transport: OnceCell<Arc<dyn Transport>>,
    pub(crate) lanes: Vec<Lane>,
}

/// The server lifecycle controller.
pub struct RpcServer {
    shared: Arc<ServerShared>,
    builder: Mutex<Option<Box<dyn TransportBuilder>>>,
    /// Worker handles. Also serializes `run` against `shutdown`.
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Mutex<Vec<ThreadId>>,
}

impl RpcServer {
    /// Builds a server on the TCP transport bound to `config.listen_addr`.
    ///
    /// TLS material is loaded when both `ssl_key` and `ssl_cert` are set.
    pub fn make(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let tls = config.tls_material()?;
        let builder = TcpTransportBuilder::bind(&config.listen_addr, tls.as_ref())?;
        Self::with_transport(config, Box::new(builder))
    }

    /// Builds a server on any transport.
    pub fn with_transport(
        config: ServerConfig,
        builder: Box<dyn TransportBuilder>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let lanes = (0..config.threads).map(Lane::new).collect();
        let kind = builder.kind();
        let shared = Arc::new(ServerShared {
            state: AtomicServerState::new(),
            config,
            registry: Registry::new(),
            transport: OnceCell::new(),
            lanes,
        });
        shared.state.advance(ServerState::Void, ServerState::Inited);
        info!(
            transport = kind,
            threads = shared.lanes.len(),
            stack_size = shared.config.stack_size,
            "RPC server initialized"
        );
        Ok(Self {
            shared,
            builder: Mutex::new(Some(builder)),
            workers: Mutex::new(Vec::new()),
            worker_ids: Mutex::new(Vec::new()),
        })
    }

    /// Registers the service `S`. Only allowed while INITED.
    pub fn register_service<S: RpcService>(&self) -> Result<(), RegistrationError> {
        let mut builder = self.builder.lock();
        let state = self.shared.state.load();
        let Some(transport) = builder.as_mut().filter(|_| state == ServerState::Inited) else {
            return Err(self.usage_error(RegistrationError::InvalidState {
                operation: "register a service",
                expected: ServerState::Inited,
                actual: state,
            }));
        };

        if self.shared.registry.contains_service(S::NAME) {
            error!(service = S::NAME, "Service is already registered");
            return Err(RegistrationError::DuplicateService(S::NAME.to_string()));
        }
        let handle = transport.register_service(S::NAME).map_err(|e| {
            error!(service = S::NAME, error = %e, "Transport refused service");
            match e {
                TransportError::DuplicateService(name) => RegistrationError::DuplicateService(name),
                other => RegistrationError::Transport(other),
            }
        })?;
        self.shared
            .registry
            .insert_service(ServiceDescriptor::new(S::NAME, handle))?;
        info!(service = S::NAME, "Service registered");
        Ok(())
    }

    /// Starts the transport and one worker per queue. Only allowed while
    /// INITED; returns once every worker has been spawned.
    pub fn run(&self, thread_start_hook: Option<ThreadStartHook>) -> Result<(), ServerError> {
        let mut workers = self.workers.lock();
        let state = self.shared.state.load();
        if state != ServerState::Inited {
            return Err(self.usage_error(ServerError::InvalidState {
                operation: "run",
                actual: state,
            }));
        }
        let Some(builder) = self.builder.lock().take() else {
            return Err(self.usage_error(ServerError::InvalidState {
                operation: "run",
                actual: state,
            }));
        };

        let queues: Vec<_> = self
            .shared
            .lanes
            .iter()
            .map(|lane| Arc::clone(&lane.queue))
            .collect();
        let transport = builder.build(&queues)?;
        if self.shared.transport.set(Arc::clone(&transport)).is_err() {
            warn!("Transport was already started");
        }

        if !self
            .shared
            .state
            .advance(ServerState::Inited, ServerState::Running)
        {
            transport.shutdown();
            return Err(ServerError::InvalidState {
                operation: "run",
                actual: self.shared.state.load(),
            });
        }

        let mut spawn_error = None;
        for index in 0..self.shared.lanes.len() {
            match worker::spawn(Arc::clone(&self.shared), index, thread_start_hook.clone()) {
                Ok(handle) => {
                    self.worker_ids.lock().push(handle.thread().id());
                    workers.push(handle);
                }
                Err(source) => {
                    error!(queue = index, error = %source, "Failed to spawn queue worker");
                    spawn_error = Some(ServerError::Spawn { index, source });
                    break;
                }
            }
        }
        drop(workers);

        if let Some(e) = spawn_error {
            self.shutdown()?;
            return Err(e);
        }
        info!(
            threads = self.shared.lanes.len(),
            listen_addr = ?transport.local_addr(),
            "RPC server running"
        );
        Ok(())
    }

    /// Registers a method of the already registered service `S` and arms one
    /// accept for it on every queue. Only allowed while RUNNING.
    ///
    /// `on_request` runs when a request arrives, `on_handle` right after it
    /// and must respond, fail or defer. `on_done` runs once the reply was
    /// written (or failed to be). Returns the method's registry index.
    pub fn register_method<S, Req, Resp>(
        &self,
        name: &str,
        on_request: impl Fn(&RpcCall<Req, Resp>) + Send + Sync + 'static,
        on_handle: impl Fn(&mut RpcCall<Req, Resp>) + Send + Sync + 'static,
        on_done: Option<DoneCallback>,
    ) -> Result<usize, RegistrationError>
    where
        S: RpcService,
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
    {
        let state = self.shared.state.load();
        if state != ServerState::Running {
            return Err(self.usage_error(RegistrationError::InvalidState {
                operation: "register a method",
                expected: ServerState::Running,
                actual: state,
            }));
        }

        // Checked again under the registry lock: `shutdown` leaves RUNNING
        // under the same lock, so nothing is appended once it has begun.
        let admit = || {
            let state = self.shared.state.load();
            if state == ServerState::Running {
                Ok(())
            } else {
                Err(RegistrationError::InvalidState {
                    operation: "register a method",
                    expected: ServerState::Running,
                    actual: state,
                })
            }
        };
        let descriptor = self
            .shared
            .registry
            .add_method(S::NAME, name, admit, |service, index| {
                MethodDescriptor::new::<Req, Resp, _, _>(
                    service, name, index, on_request, on_handle, on_done,
                )
            })
            .map_err(|e| {
                error!(service = S::NAME, method = name, error = %e, "Method registration failed");
                e
            })?;

        let mut armed = 0;
        if let Some(transport) = self.shared.transport.get() {
            for lane in &self.shared.lanes {
                if call::arm(transport.as_ref(), lane, &descriptor) {
                    armed += 1;
                }
            }
        }
        info!(
            method = %descriptor.full_name(),
            index = descriptor.index(),
            armed_queues = armed,
            "Method registered"
        );
        Ok(descriptor.index())
    }

    /// Stops the server: rejects new work, drains every queue, joins the
    /// workers. Calls still processing are answered with `UNAVAILABLE`.
    ///
    /// Idempotent. Must not be called from a queue worker thread.
    pub fn shutdown(&self) -> Result<(), ServerError> {
        if self.is_worker_thread() {
            error!("shutdown called from a queue worker thread");
            return Err(ServerError::ShutdownFromWorker);
        }
        let mut workers = self.workers.lock();
        match self.shared.state.load() {
            ServerState::Terminated => return Ok(()),
            ServerState::ShuttingDown => {}
            state => {
                let advanced = self
                    .shared
                    .registry
                    .exclusive(|| self.shared.state.advance(state, ServerState::ShuttingDown));
                if !advanced {
                    return Err(self.usage_error(ServerError::InvalidState {
                        operation: "shut down",
                        actual: self.shared.state.load(),
                    }));
                }
            }
        }
        info!(workers = workers.len(), "RPC server shutting down");

        if let Some(transport) = self.shared.transport.get() {
            transport.shutdown();
        }
        self.builder.lock().take();
        for lane in &self.shared.lanes {
            lane.queue.shutdown();
        }
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                error!("Queue worker panicked");
            }
        }
        self.worker_ids.lock().clear();
        if let Some(transport) = self.shared.transport.get() {
            transport.close();
        }

        self.shared
            .state
            .advance(ServerState::ShuttingDown, ServerState::Terminated);
        info!("RPC server terminated");
        Ok(())
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.state.load() == ServerState::Terminated
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.shared.state.load()
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Armed accepts for `method_index`, one entry per queue.
    #[must_use]
    pub fn accept_slots(&self, method_index: usize) -> Vec<usize> {
        self.shared
            .lanes
            .iter()
            .map(|lane| lane.armed_slots(method_index))
            .collect()
    }

    /// Calls between accept and completion, one entry per queue.
    #[must_use]
    pub fn active_calls(&self) -> Vec<usize> {
        self.shared.lanes.iter().map(Lane::active_calls).collect()
    }

    #[must_use]
    pub fn method_count(&self) -> usize {
        self.shared.registry.method_count()
    }

    #[must_use]
    pub fn service_names(&self) -> Vec<&'static str> {
        self.shared.registry.service_names()
    }

    /// `service/method` of every registered method, by index.
    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        self.shared
            .registry
            .methods()
            .iter()
            .map(|m| m.full_name())
            .collect()
    }

    #[must_use]
    pub fn queue_metrics(&self) -> Vec<QueueMetricsSnapshot> {
        self.shared
            .lanes
            .iter()
            .map(|lane| lane.metrics.snapshot(lane.index))
            .collect()
    }

    /// Address the transport listens on, if it has one.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(transport) = self.shared.transport.get() {
            return transport.local_addr();
        }
        self.builder.lock().as_ref().and_then(|b| b.local_addr())
    }

    fn is_worker_thread(&self) -> bool {
        let current = thread::current().id();
        self.worker_ids.lock().contains(&current)
    }

    /// Logs a usage error and, under `strict_usage`, panics with it.
    #[allow(clippy::panic)]
    fn usage_error<E: fmt::Display>(&self, err: E) -> E {
        error!(state = %self.shared.state.load(), error = %err, "RPC server usage error");
        if self.shared.config.strict_usage {
            panic!("RPC server usage error: {err}");
        }
        err
    }
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("state", &self.state())
            .field("threads", &self.shared.lanes.len())
            .field("services", &self.service_names())
            .field("methods", &self.method_count())
            .finish()
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if self.is_terminated() {
            return;
        }
        if self.is_worker_thread() {
            warn!("RPC server dropped on one of its own workers; skipping shutdown");
            return;
        }
        if let Err(e) = self.shutdown() {
            error!(error = %e, "Shutdown on drop failed");
        }
    }
}
