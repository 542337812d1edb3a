//! Bounded, ordered buffer of records awaiting delivery.
//!
//! Producers push from any thread; the session worker peeks at the front
//! entry, sends it, and only then acknowledges it. An entry that fails to
//! send therefore stays at the head of the queue and is retried after the
//! connection is re-established, in its original order.


use std::{
    collections::VecDeque,
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use log::warn;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{log_record::LogRecord, rate_limited_warner::RateLimitedWarner};

/// Default number of entries held before producers see backpressure.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;

/// What to do when a push finds the queue at capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the new record with [`QueueFullError`].
    #[default]
    Reject,
    /// Evict the oldest entry to make room.
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverflowPolicy::Reject => "reject",
            OverflowPolicy::DropOldest => "drop-oldest",
        })
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "reject" => Ok(Self::Reject),
            "drop-oldest" => Ok(Self::DropOldest),
            other => Err(format!(
                "invalid overflow policy '{other}'. Valid options are: reject, drop-oldest"
            )),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("delivery queue is full ({capacity} entries)")]
pub struct QueueFullError {
    pub capacity: usize,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    #[error(transparent)]
    Full(#[from] QueueFullError),
    #[error("delivery queue is closed")]
    Closed,
}

/// A queued record tagged with its delivery sequence number.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry {
    sequence: u64,
    record: Arc<LogRecord>,
}

impl QueueEntry {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn record(&self) -> &LogRecord {
        &self.record
    }
}

#[derive(Debug)]
struct QueueInner {
    entries: VecDeque<QueueEntry>,
    next_sequence: u64,
    closed: bool,
    dropped: u64,
}

/// Thread-safe FIFO of [`QueueEntry`] values with a fixed capacity.
pub struct DeliveryQueue {
    inner: Mutex<QueueInner>,
    drained: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    warner: RateLimitedWarner,
}

impl DeliveryQueue {
    /// Create a queue holding at most `capacity` entries.
    ///
    /// A zero capacity is bumped to one; validated construction goes through
    /// the session builder.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                next_sequence: 1,
                closed: false,
                dropped: 0,
            }),
            drained: Condvar::new(),
            capacity: capacity.max(1),
            policy,
            warner: RateLimitedWarner::default(),
        }
    }

    /// Append a record, returning its sequence number.
    ///
    /// Sequence numbers are assigned only to accepted records, so they are
    /// strictly increasing and never reused.
    pub fn push(&self, record: LogRecord) -> Result<u64, PushError> {
        let mut evicted = false;
        let sequence = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(PushError::Closed);
            }
            if inner.entries.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::Reject => {
                        return Err(QueueFullError {
                            capacity: self.capacity,
                        }
                        .into());
                    }
                    OverflowPolicy::DropOldest => {
                        inner.entries.pop_front();
                        inner.dropped += 1;
                        evicted = true;
                    }
                }
            }
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.entries.push_back(QueueEntry {
                sequence,
                record: Arc::new(record),
            });
            sequence
        };
        if evicted {
            if let Some(count) = self.warner.note_drop() {
                warn!("DeliveryQueue full; evicted {count} oldest records");
            }
        }
        Ok(sequence)
    }

    /// Remove and return the oldest entry without blocking.
    pub fn pop_front(&self) -> Option<QueueEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.pop_front();
        if inner.entries.is_empty() {
            self.drained.notify_all();
        }
        entry
    }

    /// Clone of the oldest entry, leaving it queued.
    pub fn front(&self) -> Option<QueueEntry> {
        self.inner.lock().entries.front().cloned()
    }

    /// Remove the head entry once it has been delivered.
    ///
    /// Returns `false` when the head no longer carries `sequence`, which
    /// happens if it was evicted while in flight.
    pub fn ack(&self, sequence: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.front().map(QueueEntry::sequence) != Some(sequence) {
            return false;
        }
        inner.entries.pop_front();
        if inner.entries.is_empty() {
            self.drained.notify_all();
        }
        true
    }

    /// Block until every entry has been acknowledged or `timeout` passes.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.entries.is_empty() {
            if self.drained.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.entries.is_empty()
    }

    /// Stop accepting pushes. Queued entries stay available for draining.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Total entries evicted under [`OverflowPolicy::DropOldest`].
    pub fn dropped_count(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Snapshot of every queued entry in delivery order.
    pub fn pending(&self) -> Vec<QueueEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DeliveryQueue")
            .field("len", &inner.entries.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &inner.closed)
            .finish()
    }
}
