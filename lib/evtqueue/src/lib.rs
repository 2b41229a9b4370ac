//! A bounded ring queue of actuation events, shareable between a
//! command-parsing thread (the writer) and a realtime timer thread (the
//! reader).
//!
//! # Design goals
//!
//! 1. Fixed capacity, no allocation on the push/pop path.
//! 2. The timer thread must never block. It drives output pins on a
//!    microsecond deadline; a missed deadline is a correctness bug, not a
//!    performance nuisance.
//! 3. Code clarity over cleverness -- this is a plain head/tail ring over
//!    an array, no lock-free tricks.
//!
//! Non-goals:
//!
//! - Wait-free `push`. The command parser is not latency sensitive and may
//!   block on the mutex like any other writer.
//! - Arbitrary capacity. `QUEUE_CAPACITY` is fixed at compile time.

use std::sync::Mutex;
use trace_proto::{ActuationEvent, QUEUE_CAPACITY};

/// Error returned when the queue has no room for another event.
#[derive(Copy, Clone, Debug)]
pub struct QueueFull;

/// A plain, non-thread-safe ring buffer of actuation events. Use
/// [`SharedEventQueue`] to share one across threads.
#[derive(Debug)]
pub struct EventQueue {
    backing: Box<[Option<ActuationEvent>; QUEUE_CAPACITY]>,
    head: usize,
    tail: usize,
    len: usize,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            backing: Box::new([None; QUEUE_CAPACITY]),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == QUEUE_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        QUEUE_CAPACITY
    }

    pub fn push(&mut self, event: ActuationEvent) -> Result<(), QueueFull> {
        if self.is_full() {
            return Err(QueueFull);
        }
        self.backing[self.head] = Some(event);
        self.head = (self.head + 1) % QUEUE_CAPACITY;
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<ActuationEvent> {
        if self.is_empty() {
            return None;
        }
        let event = self.backing[self.tail].take();
        self.tail = (self.tail + 1) % QUEUE_CAPACITY;
        self.len -= 1;
        event
    }

    pub fn peek(&self) -> Option<ActuationEvent> {
        if self.is_empty() {
            None
        } else {
            self.backing[self.tail]
        }
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }
}

/// A mutex-guarded [`EventQueue`] with a reader/writer access discipline
/// tuned for the realtime timer thread: pushes and clears take a blocking
/// lock, but the timer thread's pop/peek use `try_lock` so a writer
/// mid-`clear()` never stalls the next scheduled actuation.
#[derive(Debug, Default)]
pub struct SharedEventQueue {
    inner: Mutex<EventQueue>,
}

impl SharedEventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EventQueue::new()),
        }
    }

    /// Appends an event. Called from the command-parsing thread; may block
    /// briefly on contention with a concurrent `clear()`.
    pub fn push(&self, event: ActuationEvent) -> Result<(), QueueFull> {
        self.inner
            .lock()
            .expect("event queue mutex poisoned")
            .push(event)
    }

    /// Pops the next event. Called from the timer thread; returns `None` on
    /// both an empty queue and a contended lock rather than blocking.
    pub fn try_pop(&self) -> Option<ActuationEvent> {
        self.inner.try_lock().ok()?.pop()
    }

    /// Peeks the next event without removing it, with the same
    /// never-block contract as [`Self::try_pop`].
    pub fn try_peek(&self) -> Option<ActuationEvent> {
        self.inner.try_lock().ok()?.peek()
    }

    /// Drains the queue. Called from the command-parsing thread on
    /// cancellation; takes a blocking lock since this is not on the
    /// realtime path.
    pub fn clear(&self) {
        self.inner.lock().expect("event queue mutex poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_proto::{ActuationPin, Level};

    fn evt(offset_us: u32) -> ActuationEvent {
        ActuationEvent {
            offset_us,
            pin: ActuationPin::Sig1,
            level: Level::Set,
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let mut q = EventQueue::new();
        q.push(evt(10)).unwrap();
        q.push(evt(20)).unwrap();
        assert_eq!(q.pop().unwrap().offset_us, 10);
        assert_eq!(q.pop().unwrap().offset_us, 20);
        assert!(q.pop().is_none());
    }

    #[test]
    fn rejects_push_past_capacity() {
        let mut q = EventQueue::new();
        for i in 0..QUEUE_CAPACITY {
            q.push(evt(i as u32)).unwrap();
        }
        assert!(q.is_full());
        assert!(q.push(evt(0)).is_err());
    }

    #[test]
    fn wraps_around_backing_array() {
        let mut q = EventQueue::new();
        for i in 0..QUEUE_CAPACITY - 1 {
            q.push(evt(i as u32)).unwrap();
        }
        for _ in 0..QUEUE_CAPACITY - 1 {
            q.pop().unwrap();
        }
        // head and tail have both wrapped near the end of the backing array;
        // confirm the queue still works correctly across the wrap.
        q.push(evt(1)).unwrap();
        q.push(evt(2)).unwrap();
        assert_eq!(q.pop().unwrap().offset_us, 1);
        assert_eq!(q.pop().unwrap().offset_us, 2);
    }

    #[test]
    fn clear_empties_queue() {
        let mut q = EventQueue::new();
        q.push(evt(1)).unwrap();
        q.push(evt(2)).unwrap();
        q.clear();
        assert!(q.is_empty());
    }

    #[test]
    fn shared_queue_try_pop_never_blocks_on_empty() {
        let q = SharedEventQueue::new();
        assert!(q.try_pop().is_none());
        q.push(evt(5)).unwrap();
        assert_eq!(q.try_pop().unwrap().offset_us, 5);
    }
}
