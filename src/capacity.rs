//! Backpressure signalling between a data consumer and its upstream producer.

use crate::Error;
use futures_util::task::AtomicWaker;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::Waker;

/// Capacity increments below this are coalesced before being signalled.
pub const DEFAULT_CAPACITY_THRESHOLD: usize = 4096;

/// Channel for a consumer to announce it can accept more bytes.
///
/// Capacity is purely a scheduling hint; no bytes travel through this channel.
/// Implementations must tolerate `update` from any thread, and after the owning
/// exchange has ended (where it is a no-op).
pub trait CapacityChannel: Send + Sync {
    /// Announce `increment` additional bytes of free capacity.
    fn update(&self, increment: usize) -> Result<(), Error>;
}

/// Thread-safe accumulator that batches small capacity increments.
///
/// Nothing added is ever lost: either it is returned from [`add`](Self::add) once the
/// pending total crosses the threshold, or it stays pending until [`take`](Self::take).
pub struct CapacityAccumulator {
    pending: AtomicUsize,
    threshold: usize,
}

impl CapacityAccumulator {
    pub fn new(threshold: usize) -> Self {
        CapacityAccumulator {
            pending: AtomicUsize::new(0),
            threshold,
        }
    }

    /// Add an increment. Returns the batch to flush, if the threshold was reached.
    pub fn add(&self, increment: usize) -> Option<usize> {
        if increment == 0 {
            return None;
        }

        let total = self.pending.fetch_add(increment, Ordering::AcqRel) + increment;

        if total >= self.threshold {
            // another thread might have flushed in between, swap takes whatever is there.
            let flushed = self.pending.swap(0, Ordering::AcqRel);
            if flushed > 0 {
                return Some(flushed);
            }
        }

        None
    }

    /// Take everything pending, regardless of threshold.
    pub fn take(&self) -> usize {
        self.pending.swap(0, Ordering::AcqRel)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl Default for CapacityAccumulator {
    fn default() -> Self {
        CapacityAccumulator::new(DEFAULT_CAPACITY_THRESHOLD)
    }
}

/// Receive window held by the producer side of a capacity channel.
///
/// The consumer grants bytes via [`CapacityChannel::update`], the producer takes from
/// the window before delivering. A producer can never take more than was granted.
pub struct CapacityWindow {
    available: AtomicUsize,
    granted: AtomicUsize,
    closed: AtomicBool,
    waker: AtomicWaker,
}

impl CapacityWindow {
    pub fn new() -> Self {
        CapacityWindow {
            available: AtomicUsize::new(0),
            granted: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    /// Bytes currently granted and not yet taken.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Total bytes granted over the window's lifetime.
    pub fn granted(&self) -> usize {
        self.granted.load(Ordering::Acquire)
    }

    /// Take up to `max` bytes of the window.
    pub fn take(&self, max: usize) -> usize {
        let mut cur = self.available.load(Ordering::Acquire);
        loop {
            let n = cur.min(max);
            if n == 0 {
                return 0;
            }
            match self.available.compare_exchange_weak(
                cur,
                cur - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return n,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Register a waker to be notified on the next update.
    pub fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    /// Close the window. Further updates are ignored.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.waker.take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for CapacityWindow {
    fn default() -> Self {
        CapacityWindow::new()
    }
}

impl CapacityChannel for CapacityWindow {
    fn update(&self, increment: usize) -> Result<(), Error> {
        if self.is_closed() {
            trace!("Capacity update after close ignored: {}", increment);
            return Ok(());
        }
        if increment == 0 {
            return Ok(());
        }

        self.granted.fetch_add(increment, Ordering::AcqRel);
        self.available.fetch_add(increment, Ordering::AcqRel);
        self.waker.wake();

        Ok(())
    }
}

impl fmt::Debug for CapacityAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CapacityAccumulator pending: {}, threshold: {}",
            self.pending(),
            self.threshold
        )
    }
}

impl fmt::Debug for CapacityWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CapacityWindow available: {}, closed: {}",
            self.available(),
            self.is_closed()
        )
    }
}
