//! Completion queues and the events they carry.
//!
//! A [`CompletionQueue`] is the event-notification primitive the whole engine is
//! built on. Transports post [`Event`]s tagged with a [`CallTag`]; exactly one
//! queue worker drains each queue with the blocking [`CompletionQueue::next`].
//!
//! Shutdown is two-phase. After [`CompletionQueue::shutdown`] the queue still
//! accepts posts and hands out everything it holds; only when it is both shut
//! down and empty does `next` return `None`, at which point the queue is
//! *drained* and every further post is refused.

use crate::transport::{IncomingCall, Reply};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;

/// Opaque handle naming one call instance inside a queue's arena.
///
/// The generation guards against a recycled slot being addressed by a stale
/// tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallTag {
    slot: u32,
    generation: u32,
}

impl CallTag {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    #[must_use]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for CallTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// A completion delivered through a queue.
pub enum Event {
    /// A pending accept was matched with an inbound call.
    Accepted { tag: CallTag, call: IncomingCall },
    /// A pending operation finished. `ok == false` means the accept was
    /// cancelled or the response write failed.
    Completed { tag: CallTag, ok: bool },
    /// A deferred handler produced its reply.
    Resumed { tag: CallTag, reply: Reply },
}

impl Event {
    #[must_use]
    pub fn tag(&self) -> CallTag {
        match self {
            Event::Accepted { tag, .. } | Event::Completed { tag, .. } | Event::Resumed { tag, .. } => {
                *tag
            }
        }
    }

    /// Gives back the inbound call carried by an `Accepted` event.
    pub(crate) fn into_call(self) -> Option<IncomingCall> {
        match self {
            Event::Accepted { call, .. } => Some(call),
            _ => None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Accepted { tag, call } => f
                .debug_struct("Accepted")
                .field("tag", tag)
                .field("call", call)
                .finish(),
            Event::Completed { tag, ok } => f
                .debug_struct("Completed")
                .field("tag", tag)
                .field("ok", ok)
                .finish(),
            Event::Resumed { tag, reply } => f
                .debug_struct("Resumed")
                .field("tag", tag)
                .field("ok", &reply.is_ok())
                .finish(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<Event>,
    shutdown: bool,
    drained: bool,
}

/// Multi-producer, single-consumer event queue with a drain sentinel.
pub struct CompletionQueue {
    index: usize,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl CompletionQueue {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Enqueues an event. A drained queue refuses it and hands it back.
    pub fn post(&self, event: Event) -> Result<(), Event> {
        let mut state = self.state.lock();
        if state.drained {
            return Err(event);
        }
        state.events.push_back(event);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Blocks until an event is available. Returns `None` once the queue has
    /// been shut down and everything posted before that point was handed out.
    pub fn next(&self) -> Option<Event> {
        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.shutdown {
                state.drained = true;
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Stops blocking: pending `next` calls return once the queue is empty.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        drop(state);
        self.ready.notify_all();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.state.lock().drained
    }

    /// Number of events waiting to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompletionQueue")
            .field("index", &self.index)
            .field("pending", &state.events.len())
            .field("shutdown", &state.shutdown)
            .field("drained", &state.drained)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn completed(slot: u32) -> Event {
        Event::Completed {
            tag: CallTag::new(slot, 0),
            ok: true,
        }
    }

    #[test]
    fn test_events_come_out_in_post_order() {
        let queue = CompletionQueue::new(0);
        queue.post(completed(1)).unwrap();
        queue.post(completed(2)).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().unwrap().tag().slot(), 1);
        assert_eq!(queue.next().unwrap().tag().slot(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_shutdown_hands_out_remaining_events_before_sentinel() {
        let queue = CompletionQueue::new(3);
        queue.post(completed(7)).unwrap();
        queue.shutdown();
        // Posting after shutdown but before drain is still allowed.
        queue.post(completed(8)).unwrap();
        assert_eq!(queue.next().unwrap().tag().slot(), 7);
        assert_eq!(queue.next().unwrap().tag().slot(), 8);
        assert!(queue.next().is_none());
        assert!(queue.is_drained());
        // Drained queues refuse new work and give it back.
        let refused = queue.post(completed(9)).unwrap_err();
        assert_eq!(refused.tag().slot(), 9);
        // Repeated shutdown and next are harmless.
        queue.shutdown();
        assert!(queue.next().is_none());
    }

    #[test]
    fn test_shutdown_wakes_blocked_consumer() {
        let queue = Arc::new(CompletionQueue::new(0));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn test_post_wakes_blocked_consumer() {
        let queue = Arc::new(CompletionQueue::new(0));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next().map(|e| e.tag().slot()))
        };
        thread::sleep(Duration::from_millis(20));
        queue.post(completed(42)).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(42));
    }
}
