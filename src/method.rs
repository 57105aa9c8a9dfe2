//! Per-method static info and the typed call surface handlers see.
//!
//! [`RpcServer::register_method`](crate::server::RpcServer::register_method) is
//! generic over the request and response types. Those types stop here: the
//! [`MethodDescriptor`] stores one type-erased closure that decodes the request
//! (serde_json), builds an [`RpcCall`], runs the user callbacks and encodes
//! whatever the handler produced. Call instances only ever see bytes.
//!
//! A handler answers in one of two ways:
//!
//! - synchronously, with [`RpcCall::respond`] or [`RpcCall::fail`]
//! - later, by taking a [`Responder`] with [`RpcCall::defer`] and resolving it
//!   from any thread

use crate::queue::{CallTag, CompletionQueue, Event};
use crate::registry::ServiceDescriptor;
use crate::status::Status;
use crate::transport::Reply;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use ulid::Ulid;

/// A service type known at compile time.
///
/// ```rust
/// use brrtrpc::RpcService;
///
/// struct Greeter;
///
/// impl RpcService for Greeter {
///     const NAME: &'static str = "demo.Greeter";
/// }
/// ```
pub trait RpcService: 'static {
    /// Canonical, unique service name.
    const NAME: &'static str;
}

/// Invoked once per call after its response was written (or failed to be).
pub type DoneCallback = Box<dyn Fn(&CallOutcome) + Send + Sync>;

/// What happened to a call, reported to the completion callback.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub service: &'static str,
    pub method: Arc<str>,
    pub request_id: Ulid,
    pub queue: usize,
    /// Status sent to the client.
    pub status: Status,
    /// Whether the transport accepted the reply.
    pub ok: bool,
    /// Time from accept to completion.
    pub elapsed: Duration,
}

/// Queue and tag a deferred reply is posted to.
pub(crate) struct ResumeHandle {
    pub(crate) queue: Arc<CompletionQueue>,
    pub(crate) tag: CallTag,
}

impl ResumeHandle {
    fn resume(self, reply: Reply) -> bool {
        self.queue
            .post(Event::Resumed {
                tag: self.tag,
                reply,
            })
            .is_ok()
    }
}

fn encode<T: Serialize>(value: &T) -> Reply {
    serde_json::to_vec(value).map_err(|e| Status::internal(format!("failed to encode response: {e}")))
}

/// One call as seen by its callbacks.
pub struct RpcCall<Req, Resp> {
    request: Req,
    response: Option<Result<Resp, Status>>,
    service: &'static str,
    method: Arc<str>,
    peer: String,
    request_id: Ulid,
    queue: usize,
    resume: Option<ResumeHandle>,
}

impl<Req, Resp> RpcCall<Req, Resp> {
    #[must_use]
    pub fn request(&self) -> &Req {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Req {
        &mut self.request
    }

    #[must_use]
    pub fn service(&self) -> &'static str {
        self.service
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[must_use]
    pub fn request_id(&self) -> Ulid {
        self.request_id
    }

    /// Index of the queue (and worker thread) running this call.
    #[must_use]
    pub fn queue(&self) -> usize {
        self.queue
    }

    /// Sets the response sent when the handler returns.
    pub fn respond(&mut self, response: Resp) {
        self.response = Some(Ok(response));
    }

    /// Fails the call with `status` when the handler returns.
    pub fn fail(&mut self, status: Status) {
        self.response = Some(Err(status));
    }

    /// Takes over responsibility for the reply. The engine leaves the call
    /// in `PROCESSING` until the returned [`Responder`] is resolved or dropped.
    /// Only the first call returns `Some`.
    pub fn defer(&mut self) -> Option<Responder<Resp>> {
        self.resume.take().map(|handle| Responder {
            handle: Some(handle),
            _response: PhantomData,
        })
    }

    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.resume.is_none()
    }
}

/// Resolves a deferred call from any thread.
///
/// Dropping an unresolved responder fails the call with `CANCELLED`.
pub struct Responder<Resp> {
    handle: Option<ResumeHandle>,
    _response: PhantomData<fn(Resp)>,
}

impl<Resp: Serialize> Responder<Resp> {
    /// Sends `response`. `false` if the server already shut the queue down.
    pub fn respond(mut self, response: Resp) -> bool {
        let reply = encode(&response);
        self.resolve(reply)
    }
}

impl<Resp> Responder<Resp> {
    /// Fails the call. `false` if the server already shut the queue down.
    pub fn fail(mut self, status: Status) -> bool {
        self.resolve(Err(status))
    }

    fn resolve(&mut self, reply: Reply) -> bool {
        self.handle
            .take()
            .is_some_and(|handle| handle.resume(reply))
    }
}

impl<Resp> Drop for Responder<Resp> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.resume(Err(Status::cancelled("responder dropped without a reply")));
        }
    }
}

impl<Resp> fmt::Debug for Responder<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("tag", &self.handle.as_ref().map(|h| h.tag))
            .finish()
    }
}

/// Inputs the erased handler needs for one accepted call.
pub(crate) struct Invocation {
    pub(crate) payload: Vec<u8>,
    pub(crate) peer: String,
    pub(crate) request_id: Ulid,
    pub(crate) queue: usize,
    pub(crate) resume: ResumeHandle,
}

pub(crate) enum Handled {
    Reply(Reply),
    Deferred,
}

type ErasedHandler = Box<dyn Fn(Invocation) -> Handled + Send + Sync>;

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Immutable per-(service, method) info shared by every call instance of the
/// method on every queue.
pub struct MethodDescriptor {
    index: usize,
    service: Arc<ServiceDescriptor>,
    name: Arc<str>,
    invoke: ErasedHandler,
    on_done: Option<DoneCallback>,
}

impl MethodDescriptor {
    pub(crate) fn new<Req, Resp, R, H>(
        service: Arc<ServiceDescriptor>,
        name: &str,
        index: usize,
        on_request: R,
        on_handle: H,
        on_done: Option<DoneCallback>,
    ) -> Self
    where
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
        R: Fn(&RpcCall<Req, Resp>) + Send + Sync + 'static,
        H: Fn(&mut RpcCall<Req, Resp>) + Send + Sync + 'static,
    {
        let name: Arc<str> = Arc::from(name);
        let service_name = service.name();
        let method_name = Arc::clone(&name);

        let invoke: ErasedHandler = Box::new(move |inv: Invocation| {
            let request: Req = match serde_json::from_slice(&inv.payload) {
                Ok(request) => request,
                Err(e) => {
                    return Handled::Reply(Err(Status::invalid_argument(format!(
                        "failed to decode request: {e}"
                    ))))
                }
            };
            let mut call = RpcCall {
                request,
                response: None,
                service: service_name,
                method: Arc::clone(&method_name),
                peer: inv.peer,
                request_id: inv.request_id,
                queue: inv.queue,
                resume: Some(inv.resume),
            };

            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                on_request(&call);
                on_handle(&mut call);
            }));
            if let Err(panic) = result {
                let message = panic_message(&panic);
                error!(
                    request_id = %call.request_id,
                    service = %service_name,
                    method = %method_name,
                    panic_message = %message,
                    "Handler panicked"
                );
                if call.is_deferred() {
                    // The responder owns the reply now.
                    return Handled::Deferred;
                }
                return Handled::Reply(Err(Status::internal(format!(
                    "handler panicked: {message}"
                ))));
            }

            if call.is_deferred() {
                return Handled::Deferred;
            }
            match call.response.take() {
                Some(Ok(response)) => Handled::Reply(encode(&response)),
                Some(Err(status)) => Handled::Reply(Err(status)),
                None => Handled::Reply(Err(Status::internal(
                    "handler returned without a response",
                ))),
            }
        });

        Self {
            index,
            service,
            name,
            invoke,
            on_done,
        }
    }

    /// Position in the registry; stable for the descriptor's lifetime.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn service(&self) -> &Arc<ServiceDescriptor> {
        &self.service
    }

    /// `service/method`, for logs.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.service.name(), self.name)
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub(crate) fn invoke(&self, invocation: Invocation) -> Handled {
        (self.invoke)(invocation)
    }

    /// Runs the completion callback, if any. Panics are contained.
    pub(crate) fn complete(&self, outcome: &CallOutcome) {
        let Some(on_done) = &self.on_done else {
            return;
        };
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| on_done(outcome))) {
            error!(
                request_id = %outcome.request_id,
                method = %self.full_name(),
                panic_message = %panic_message(&panic),
                "Completion callback panicked"
            );
        }
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("index", &self.index)
            .field("service", &self.service.name())
            .field("name", &self.name)
            .field("has_on_done", &self.on_done.is_some())
            .finish()
    }
}
