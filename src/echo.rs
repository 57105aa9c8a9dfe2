//! Demo echo service used by the `brrtrpc serve` command and the benchmarks.
//!
//! - `demo.Echo/Say` answers synchronously on the queue worker
//! - `demo.Echo/SayLater` defers and answers from a `may` coroutine after
//!   `delay_ms`

use crate::error::RegistrationError;
use crate::method::{RpcCall, RpcService};
use crate::server::RpcServer;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub struct EchoService;

impl RpcService for EchoService {
    const NAME: &'static str = "demo.Echo";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub text: String,
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoReply {
    pub text: String,
    /// Queue that ran the call
    pub queue: usize,
    pub request_id: String,
}

fn reply_for(call: &RpcCall<EchoRequest, EchoReply>) -> EchoReply {
    EchoReply {
        text: call.request().text.clone(),
        queue: call.queue(),
        request_id: call.request_id().to_string(),
    }
}

/// Registers the echo service. Call while the server is INITED.
pub fn register_service(server: &RpcServer) -> Result<(), RegistrationError> {
    server.register_service::<EchoService>()
}

/// Registers the echo methods. Call once the server is RUNNING.
pub fn register_methods(server: &RpcServer) -> Result<(), RegistrationError> {
    server.register_method::<EchoService, EchoRequest, EchoReply>(
        "Say",
        |call| debug!(peer = %call.peer(), len = call.request().text.len(), "Echo request"),
        |call| {
            let reply = reply_for(call);
            call.respond(reply);
        },
        None,
    )?;

    server.register_method::<EchoService, EchoRequest, EchoReply>(
        "SayLater",
        |_| {},
        |call| {
            let reply = reply_for(call);
            let delay = Duration::from_millis(call.request().delay_ms);
            let Some(responder) = call.defer() else {
                return;
            };
            let _ = may::go!(move || {
                may::coroutine::sleep(delay);
                responder.respond(reply);
            });
        },
        None,
    )?;
    Ok(())
}
