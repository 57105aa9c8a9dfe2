//! Per-call state machine.
//!
//! A [`CallInstance`] lives in its queue's arena from the moment it is armed
//! until it reaches `Terminal`. Each transition handles exactly one event and
//! returns a [`Step`] telling the worker whether to put the instance back or
//! free its slot:
//!
//! ```text
//! Armed --accepted--> Processing --reply--> Responding --write done--> Terminal
//!   |                     ^   |
//!   |                     |   `--deferred: wait for Resumed
//!   `--cancelled--> Terminal
//! ```
//!
//! On accept the instance arms a replacement for the same method on the same
//! queue *before* running the handler, so a slow handler never leaves the
//! method without a pending accept.

use crate::method::{CallOutcome, Handled, Invocation, MethodDescriptor, ResumeHandle};
use crate::queue::{CallTag, Event};
use crate::server::ServerShared;
use crate::status::Status;
use crate::transport::{IncomingCall, Reply, ReplySink, Transport};
use crate::worker::Lane;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallPhase {
    Armed,
    Processing,
    Responding,
    Terminal,
}

/// What the worker does with the instance after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Keep,
    Release,
}

pub(crate) struct CallInstance {
    method: Arc<MethodDescriptor>,
    phase: CallPhase,
    request_id: Ulid,
    accepted_at: Option<Instant>,
    sink: Option<Box<dyn ReplySink>>,
    status: Option<Status>,
}

impl CallInstance {
    fn armed(method: Arc<MethodDescriptor>) -> Self {
        Self {
            method,
            phase: CallPhase::Armed,
            request_id: Ulid::nil(),
            accepted_at: None,
            sink: None,
            status: None,
        }
    }

    pub(crate) fn phase(&self) -> CallPhase {
        self.phase
    }

    pub(crate) fn method_index(&self) -> usize {
        self.method.index()
    }

    pub(crate) fn on_accepted(
        &mut self,
        shared: &ServerShared,
        lane: &Lane,
        tag: CallTag,
        call: IncomingCall,
    ) -> Step {
        if self.phase != CallPhase::Armed {
            warn!(
                queue = lane.index,
                tag = %tag,
                phase = ?self.phase,
                "Accept delivered to a call that is not armed"
            );
            let _ = call.reject(Status::internal("call slot is busy"));
            return Step::Keep;
        }
        lane.metrics.record_accept();

        if shared.state.load().is_stopping() {
            debug!(
                queue = lane.index,
                method = %self.method.full_name(),
                "Rejecting call accepted during shutdown"
            );
            let _ = call.reject(Status::unavailable("server is shutting down"));
            lane.metrics.record_cancel();
            self.phase = CallPhase::Terminal;
            return Step::Release;
        }

        if let Some(transport) = shared.transport.get() {
            arm(transport.as_ref(), lane, &self.method);
        }

        self.request_id = Ulid::new();
        self.accepted_at = Some(Instant::now());
        self.phase = CallPhase::Processing;
        lane.metrics.record_start();

        let (payload, peer, sink) = call.into_parts();
        self.sink = Some(sink);
        debug!(
            request_id = %self.request_id,
            queue = lane.index,
            method = %self.method.full_name(),
            peer = %peer,
            "RPC accepted"
        );

        let handled = self.method.invoke(Invocation {
            payload,
            peer,
            request_id: self.request_id,
            queue: lane.index,
            resume: ResumeHandle {
                queue: Arc::clone(&lane.queue),
                tag,
            },
        });
        match handled {
            Handled::Reply(reply) => self.respond(lane, tag, reply),
            Handled::Deferred => Step::Keep,
        }
    }

    pub(crate) fn on_resumed(&mut self, lane: &Lane, tag: CallTag, reply: Reply) -> Step {
        if self.phase != CallPhase::Processing {
            warn!(
                queue = lane.index,
                tag = %tag,
                phase = ?self.phase,
                "Deferred reply for a call that is not processing"
            );
            return Step::Keep;
        }
        self.respond(lane, tag, reply)
    }

    pub(crate) fn on_completed(&mut self, lane: &Lane, tag: CallTag, ok: bool) -> Step {
        match self.phase {
            CallPhase::Armed if !ok => {
                lane.metrics.record_cancel();
                self.phase = CallPhase::Terminal;
                Step::Release
            }
            CallPhase::Responding => {
                self.finish(lane, ok);
                Step::Release
            }
            phase => {
                warn!(
                    queue = lane.index,
                    tag = %tag,
                    phase = ?phase,
                    ok,
                    "Unexpected completion"
                );
                Step::Keep
            }
        }
    }

    /// Writes `reply` and waits for the write completion on this queue.
    fn respond(&mut self, lane: &Lane, tag: CallTag, reply: Reply) -> Step {
        self.status = Some(match &reply {
            Ok(_) => Status::ok(),
            Err(status) => status.clone(),
        });
        self.phase = CallPhase::Responding;
        let ok = self.sink.take().is_some_and(|sink| sink.send(reply));
        if lane.queue.post(Event::Completed { tag, ok }).is_err() {
            self.finish(lane, ok);
            return Step::Release;
        }
        Step::Keep
    }

    fn finish(&mut self, lane: &Lane, ok: bool) {
        self.phase = CallPhase::Terminal;
        let status = self.status.take().unwrap_or_else(Status::ok);
        let elapsed = self
            .accepted_at
            .map_or(Duration::ZERO, |at| at.elapsed());
        lane.metrics.record_finish(ok && status.is_ok());

        info!(
            request_id = %self.request_id,
            queue = lane.index,
            method = %self.method.full_name(),
            status = %status.code,
            ok,
            latency_ms = elapsed.as_millis() as u64,
            "RPC completed"
        );

        self.method.complete(&CallOutcome {
            service: self.method.service().name(),
            method: self.method.name_arc(),
            request_id: self.request_id,
            queue: lane.index,
            status,
            ok,
            elapsed,
        });
    }

    /// Finalizes an instance left in the arena after its queue drained.
    pub(crate) fn abort(mut self, lane: &Lane) {
        match self.phase {
            CallPhase::Processing => {
                let status = Status::unavailable("server shut down before the call completed");
                if let Some(sink) = self.sink.take() {
                    let _ = sink.send(Err(status.clone()));
                }
                self.status = Some(status);
                self.finish(lane, false);
            }
            CallPhase::Responding => self.finish(lane, false),
            CallPhase::Armed | CallPhase::Terminal => {}
        }
    }
}

/// Arms one accept for `method` on `lane`. `false` if the transport refused.
pub(crate) fn arm(
    transport: &dyn Transport,
    lane: &Lane,
    method: &Arc<MethodDescriptor>,
) -> bool {
    let tag = lane.arena.insert(CallInstance::armed(Arc::clone(method)));
    if transport.request_call(method.service().handle(), method.name(), &lane.queue, tag) {
        return true;
    }
    lane.arena.remove(tag);
    debug!(
        queue = lane.index,
        method = %method.full_name(),
        "Transport refused to arm accept"
    );
    false
}
