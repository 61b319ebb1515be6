use std::sync::{Condvar, Mutex};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity must be > 0")]
    ZeroCapacity,
}

/// Overflow behavior of a full queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePolicy {
    /// `put` drops the oldest item and stores the new one.
    Looping,
    /// `put` blocks until a consumer makes room.
    Blocking,
}

/// What happened to a `put`.
#[derive(Debug, PartialEq, Eq)]
pub enum PutOutcome<T> {
    Stored,
    /// Looping overflow; the evicted oldest item comes back to the caller
    /// (usually to be logged and dropped).
    Dropped(T),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Empty,
    Normal,
    Full,
}

struct Ring<T> {
    buf: Vec<Option<T>>,
    bottom: usize,
    top: usize,
    state: State,
    closed: bool,
}

impl<T> Ring<T> {
    fn push_top(&mut self, item: T) {
        self.buf[self.top] = Some(item);
        self.top = (self.top + 1) % self.buf.len();
        self.state = if self.top == self.bottom { State::Full } else { State::Normal };
    }

    fn take_bottom(&mut self) -> Option<T> {
        if self.state == State::Empty {
            return None;
        }
        let item = self.buf[self.bottom].take();
        self.bottom = (self.bottom + 1) % self.buf.len();
        self.state = if self.bottom == self.top { State::Empty } else { State::Normal };
        item
    }

    fn len(&self) -> usize {
        match self.state {
            State::Empty => 0,
            State::Full => self.buf.len(),
            State::Normal => (self.top + self.buf.len() - self.bottom) % self.buf.len(),
        }
    }
}

/// Mutex-and-condvar ring holding at most `capacity` items.
///
/// State walks empty -> normal -> full and back as producers and
/// consumers advance the two indices. `get` blocks while empty; `close`
/// wakes everyone and makes `get` return `None` once drained.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    policy: QueuePolicy,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, policy: QueuePolicy) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);
        Ok(Self {
            ring: Mutex::new(Ring { buf, bottom: 0, top: 0, state: State::Empty, closed: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            policy,
        })
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().unwrap().buf.len()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores an item. A full looping queue evicts its oldest entry and
    /// returns it; a full blocking queue waits. `Dropped(item)` is also
    /// the reply on a closed queue (the item had nowhere to go).
    pub fn put(&self, item: T) -> PutOutcome<T> {
        let mut ring = self.ring.lock().unwrap();
        if ring.closed {
            return PutOutcome::Dropped(item);
        }
        let mut evicted = None;
        match self.policy {
            QueuePolicy::Blocking => {
                while ring.state == State::Full && !ring.closed {
                    ring = self.not_full.wait(ring).unwrap();
                }
                if ring.closed {
                    return PutOutcome::Dropped(item);
                }
            }
            QueuePolicy::Looping => {
                if ring.state == State::Full {
                    evicted = ring.take_bottom();
                }
            }
        }
        ring.push_top(item);
        drop(ring);
        self.not_empty.notify_one();
        match evicted {
            Some(old) => PutOutcome::Dropped(old),
            None => PutOutcome::Stored,
        }
    }

    /// Blocks while the queue is empty. `None` once the queue is closed
    /// and drained.
    pub fn get(&self) -> Option<T> {
        let mut ring = self.ring.lock().unwrap();
        loop {
            if let Some(item) = ring.take_bottom() {
                drop(ring);
                self.not_full.notify_one();
                return Some(item);
            }
            if ring.closed {
                return None;
            }
            ring = self.not_empty.wait(ring).unwrap();
        }
    }

    pub fn try_get(&self) -> Option<T> {
        let mut ring = self.ring.lock().unwrap();
        let item = ring.take_bottom();
        drop(ring);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Wakes all waiters; subsequent `put`s bounce, `get`s drain what is
    /// left and then return `None`.
    pub fn close(&self) {
        self.ring.lock().unwrap().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}
