//! Pairs inbound calls with pending accepts.
//!
//! For every `(service, method)` the matcher keeps the accepts armed by call
//! instances and a backlog of calls that arrived while no accept was pending.
//! Whichever side shows up second completes the pair by posting
//! `Event::Accepted` on the accept's queue.
//!
//! A method becomes known the first time an accept is armed for it; calls to
//! unknown services or methods are answered with `UNIMPLEMENTED`.

use crate::queue::{CallTag, CompletionQueue, Event};
use crate::status::Status;
use crate::transport::IncomingCall;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

struct PendingAccept {
    queue: Arc<CompletionQueue>,
    tag: CallTag,
}

#[derive(Default)]
struct MethodSlots {
    pending: VecDeque<PendingAccept>,
    backlog: VecDeque<IncomingCall>,
}

#[derive(Default)]
struct MatcherState {
    services: HashSet<String>,
    methods: HashMap<(String, String), MethodSlots>,
    shutdown: bool,
}

/// Shared accept/backlog bookkeeping for the built-in transports.
#[derive(Default)]
pub struct CallMatcher {
    state: Mutex<MatcherState>,
}

impl CallMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a service known. `false` if it already was.
    pub fn add_service(&self, name: &str) -> bool {
        self.state.lock().services.insert(name.to_string())
    }

    /// Arms one accept, or immediately hands it a backlogged call.
    pub fn request_call(
        &self,
        service: &str,
        method: &str,
        queue: &Arc<CompletionQueue>,
        tag: CallTag,
    ) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        if !state.services.contains(service) {
            warn!(service = %service, method = %method, "Accept armed for unknown service");
            return false;
        }
        let slots = state
            .methods
            .entry((service.to_string(), method.to_string()))
            .or_default();

        if let Some(call) = slots.backlog.pop_front() {
            debug!(
                service = %service,
                method = %method,
                queue = queue.index(),
                backlog = slots.backlog.len(),
                "Backlogged call handed to new accept"
            );
            return match queue.post(Event::Accepted { tag, call }) {
                Ok(()) => true,
                Err(event) => {
                    if let Some(call) = event.into_call() {
                        slots.backlog.push_front(call);
                    }
                    false
                }
            };
        }

        slots.pending.push_back(PendingAccept {
            queue: Arc::clone(queue),
            tag,
        });
        true
    }

    /// Routes an inbound call to a pending accept, or backlogs it.
    pub fn deliver(&self, call: IncomingCall) {
        let rejection = {
            let mut state = self.state.lock();
            if state.shutdown {
                Some(Status::unavailable("server is shutting down"))
            } else if !state.services.contains(call.service()) {
                Some(Status::unimplemented(format!(
                    "unknown service '{}'",
                    call.service()
                )))
            } else {
                let key = (call.service().to_string(), call.method().to_string());
                match state.methods.get_mut(&key) {
                    None => Some(Status::unimplemented(format!(
                        "unknown method '{}/{}'",
                        call.service(),
                        call.method()
                    ))),
                    Some(slots) => {
                        let mut call = call;
                        loop {
                            let Some(accept) = slots.pending.pop_front() else {
                                slots.backlog.push_back(call);
                                break;
                            };
                            match accept.queue.post(Event::Accepted {
                                tag: accept.tag,
                                call,
                            }) {
                                Ok(()) => break,
                                Err(event) => match event.into_call() {
                                    // Queue already drained; try the next accept.
                                    Some(returned) => call = returned,
                                    None => break,
                                },
                            }
                        }
                        return;
                    }
                }
            }
        };

        if let Some(status) = rejection {
            debug!(
                service = %call.service(),
                method = %call.method(),
                status = %status,
                "Inbound call rejected"
            );
            let _ = call.reject(status);
        }
    }

    /// Cancels every pending accept and rejects every backlogged call. New
    /// accepts and calls are refused from here on.
    pub fn shutdown(&self) {
        let (pending, backlog) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let mut pending = Vec::new();
            let mut backlog = Vec::new();
            for slots in state.methods.values_mut() {
                pending.extend(slots.pending.drain(..));
                backlog.extend(slots.backlog.drain(..));
            }
            (pending, backlog)
        };

        debug!(
            cancelled_accepts = pending.len(),
            rejected_calls = backlog.len(),
            "Call matcher shut down"
        );

        for accept in pending {
            let _ = accept.queue.post(Event::Completed {
                tag: accept.tag,
                ok: false,
            });
        }
        for call in backlog {
            let _ = call.reject(Status::unavailable("server is shutting down"));
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Accepts currently armed for `service/method`.
    #[must_use]
    pub fn pending_accepts(&self, service: &str, method: &str) -> usize {
        self.state
            .lock()
            .methods
            .get(&(service.to_string(), method.to_string()))
            .map_or(0, |slots| slots.pending.len())
    }

    /// Calls waiting for an accept on `service/method`.
    #[must_use]
    pub fn backlog_len(&self, service: &str, method: &str) -> usize {
        self.state
            .lock()
            .methods
            .get(&(service.to_string(), method.to_string()))
            .map_or(0, |slots| slots.backlog.len())
    }
}
