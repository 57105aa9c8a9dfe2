//! Queue workers.
//!
//! Every completion queue is drained by exactly one OS thread. A worker blocks
//! in [`CompletionQueue::next`], resolves the event's tag in its lane's arena
//! and advances that one call instance. The arena lock is only held to take
//! and put back the instance, never while a handler runs.
//!
//! When `next` returns `None` the queue is drained: nothing more will be
//! delivered, so whatever is still in the arena is finalized and the thread
//! exits.

use crate::arena::Arena;
use crate::call::{CallInstance, CallPhase, Step};
use crate::queue::{CompletionQueue, Event};
use crate::server::{ServerShared, ThreadStartHook};
use crate::status::Status;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Per-queue counters.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    accepted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    in_flight: AtomicUsize,
}

impl QueueMetrics {
    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_start(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finish(&self, success: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self, queue: usize) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            queue,
            accepted: self.accepted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one queue's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetricsSnapshot {
    pub queue: usize,
    /// Calls matched with an accept on this queue
    pub accepted: u64,
    /// Calls answered with OK and written successfully
    pub completed: u64,
    /// Calls answered with an error status or whose write failed
    pub failed: u64,
    /// Accepts cancelled by shutdown, plus calls refused while stopping
    pub cancelled: u64,
    /// Calls between accept and completion
    pub in_flight: usize,
}

/// One completion queue together with the call instances armed on it.
pub(crate) struct Lane {
    pub(crate) index: usize,
    pub(crate) queue: Arc<CompletionQueue>,
    pub(crate) arena: Arena<CallInstance>,
    pub(crate) metrics: QueueMetrics,
}

impl Lane {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            queue: Arc::new(CompletionQueue::new(index)),
            arena: Arena::new(),
            metrics: QueueMetrics::default(),
        }
    }

    /// Armed instances of `method_index` on this lane.
    pub(crate) fn armed_slots(&self, method_index: usize) -> usize {
        self.arena.count(|call| {
            call.phase() == CallPhase::Armed && call.method_index() == method_index
        })
    }

    /// Instances accepted and not yet finished.
    pub(crate) fn active_calls(&self) -> usize {
        self.arena.count(|call| {
            matches!(call.phase(), CallPhase::Processing | CallPhase::Responding)
        })
    }
}

/// Spawns the worker thread for queue `index`.
pub(crate) fn spawn(
    shared: Arc<ServerShared>,
    index: usize,
    hook: Option<ThreadStartHook>,
) -> io::Result<JoinHandle<()>> {
    let mut builder = thread::Builder::new().name(format!("brrtrpc-cq-{index}"));
    if shared.config.stack_size > 0 {
        builder = builder.stack_size(shared.config.stack_size);
    }
    builder.spawn(move || {
        if let Some(hook) = hook {
            hook(index);
        }
        run_queue(&shared, index);
    })
}

fn run_queue(shared: &ServerShared, index: usize) {
    let Some(lane) = shared.lanes.get(index) else {
        warn!(queue = index, "No lane for queue index");
        return;
    };
    debug!(queue = index, "Queue worker started");
    let mut events: u64 = 0;

    while let Some(event) = lane.queue.next() {
        events += 1;
        let tag = event.tag();
        let Some(mut instance) = lane.arena.take(tag) else {
            warn!(queue = index, tag = %tag, event = ?event, "Event for unknown or stale tag");
            if let Some(call) = event.into_call() {
                let _ = call.reject(Status::unavailable("call slot no longer exists"));
            }
            continue;
        };

        let step = match event {
            Event::Accepted { call, .. } => instance.on_accepted(shared, lane, tag, call),
            Event::Completed { ok, .. } => instance.on_completed(lane, tag, ok),
            Event::Resumed { reply, .. } => instance.on_resumed(lane, tag, reply),
        };
        match step {
            Step::Keep => lane.arena.restore(tag, instance),
            Step::Release => lane.arena.release(tag),
        }
    }

    let leftover = lane.arena.drain();
    let aborted = leftover.len();
    for (_, instance) in leftover {
        instance.abort(lane);
    }
    info!(
        queue = index,
        events_processed = events,
        finalized_calls = aborted,
        "Queue drained, worker exiting"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_track_in_flight_and_outcomes() {
        let metrics = QueueMetrics::default();
        metrics.record_accept();
        metrics.record_start();
        metrics.record_accept();
        metrics.record_start();
        assert_eq!(metrics.snapshot(0).in_flight, 2);

        metrics.record_finish(true);
        metrics.record_finish(false);
        metrics.record_cancel();
        let snap = metrics.snapshot(3);
        assert_eq!(
            snap,
            QueueMetricsSnapshot {
                queue: 3,
                accepted: 2,
                completed: 1,
                failed: 1,
                cancelled: 1,
                in_flight: 0,
            }
        );
    }
}
