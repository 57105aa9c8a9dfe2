//! # brrtrpc
//!
//! **brrtrpc** is a multi-queue RPC dispatch engine. It sits on top of a
//! completion-based transport and turns its event notifications into a
//! framework for registering services and request handlers.
//!
//! ## Architecture
//!
//! - **[`server`]** - lifecycle controller: VOID → INITED → RUNNING →
//!   SHUTTING_DOWN → TERMINATED
//! - **[`registry`]** - service descriptors and the append-only method list
//! - **[`method`]** - per-method descriptors and the typed call surface
//!   ([`RpcCall`], [`Responder`])
//! - **`call`** - the per-call state machine (crate-private)
//! - **[`worker`]** - one worker thread per completion queue
//! - **[`queue`]** - completion queues, tags and events
//! - **[`transport`]** - transport traits plus TCP and in-process transports
//! - **[`config`]** / **[`logging`]** - configuration layering and tracing setup
//!
//! ### Request Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client
//!     participant Transport
//!     participant Queue as CompletionQueue
//!     participant Worker
//!     participant Call as CallInstance
//!     participant Handler
//!
//!     Worker->>Transport: request_call(method, queue, tag)
//!     Client->>Transport: request frame
//!     Transport->>Queue: Accepted { tag, call }
//!     Queue-->>Worker: next()
//!     Worker->>Call: on_accepted
//!     Call->>Transport: arm replacement
//!     Call->>Handler: on_request, on_handle
//!     Handler-->>Call: response
//!     Call->>Client: reply
//!     Call->>Queue: Completed { tag, ok }
//!     Queue-->>Worker: next()
//!     Worker->>Call: on_completed → on_done
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use brrtrpc::transport::local;
//! use brrtrpc::{RpcServer, RpcService, ServerConfig};
//! use serde::{Deserialize, Serialize};
//!
//! struct Math;
//! impl RpcService for Math {
//!     const NAME: &'static str = "demo.Math";
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct Pair {
//!     a: i64,
//!     b: i64,
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (builder, client) = local::channel();
//! let server = RpcServer::with_transport(ServerConfig::default(), Box::new(builder))?;
//! server.register_service::<Math>()?;
//! server.run(None)?;
//! server.register_method::<Math, Pair, i64>(
//!     "Add",
//!     |_| {},
//!     |call| {
//!         let sum = call.request().a + call.request().b;
//!         call.respond(sum);
//!     },
//!     None,
//! )?;
//!
//! let sum: i64 = client.call("demo.Math", "Add", &Pair { a: 2, b: 3 })?;
//! assert_eq!(sum, 5);
//! server.shutdown()?;
//! # Ok(())
//! # }
//! ```

mod arena;
mod call;
pub mod cli;
pub mod config;
pub mod echo;
pub mod error;
pub mod logging;
pub mod method;
pub mod queue;
pub mod registry;
pub mod server;
pub mod state;
pub mod status;
pub mod transport;
pub mod worker;

pub use config::{ConfigError, ServerConfig};
pub use error::{RegistrationError, ServerError};
pub use method::{CallOutcome, DoneCallback, Responder, RpcCall, RpcService};
pub use queue::{CallTag, CompletionQueue, Event};
pub use server::{RpcServer, ThreadStartHook};
pub use state::ServerState;
pub use status::{Status, StatusCode};
pub use worker::QueueMetricsSnapshot;
