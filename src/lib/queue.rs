//! Fixed-capacity concurrent FIFO with two-sided back-pressure.
//!
//! Every pipeline stage hands data to the next through a [`ConcurrentQueue`]:
//! producers block when the queue is full, consumers block when it is empty.
//! Capacity is enforced by a pair of counting semaphores (`in_sem` starts at
//! capacity, `out_sem` at zero) around a mutex-protected ring.
//!
//! Two pop flavors exist. The implicit-release [`ConcurrentQueue::pop`]
//! returns the slot to producers as soon as the item is dequeued. The
//! explicit-release [`ConcurrentQueue::pop_explicit`] keeps the slot occupied
//! until [`ConcurrentQueue::release`] is called, letting a consumer signal
//! "item fully processed" rather than "item dequeued". The device worker
//! relies on that distinction for its completion handshake.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// A counting semaphore built on a parking_lot mutex and condvar.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `permits` permits.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self { permits: Mutex::new(permits), cond: Condvar::new() }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Takes a permit if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Returns `n` permits and wakes blocked acquirers.
    pub fn release(&self, n: usize) {
        let mut permits = self.permits.lock();
        *permits += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }
}

/// A fixed-capacity concurrent queue.
///
/// Invariant: `in_sem + out_sem <= capacity`; `out_sem` equals the number of
/// fully committed items.
pub struct ConcurrentQueue<T> {
    in_sem: Semaphore,
    out_sem: Semaphore,
    ring: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> ConcurrentQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            in_sem: Semaphore::new(capacity),
            out_sem: Semaphore::new(0),
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Maximum number of items the queue can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends an item, blocking while the queue is full.
    pub fn push(&self, value: T) {
        self.in_sem.acquire();
        self.ring.lock().push_back(value);
        self.out_sem.release(1);
    }

    /// Appends an item only if a slot is immediately available.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue is full.
    pub fn try_push(&self, value: T) -> std::result::Result<(), T> {
        if !self.in_sem.try_acquire() {
            return Err(value);
        }
        self.ring.lock().push_back(value);
        self.out_sem.release(1);
        Ok(())
    }

    /// Removes the front item, blocking while the queue is empty.
    ///
    /// The slot is returned to producers immediately.
    pub fn pop(&self) -> T {
        self.out_sem.acquire();
        let value = self.dequeue();
        self.in_sem.release(1);
        value
    }

    /// Removes the front item, blocking while the queue is empty.
    ///
    /// The slot is *not* returned to producers until [`Self::release`] is
    /// called, so a producer blocked on a full queue stays blocked until the
    /// consumer declares the item consumed.
    pub fn pop_explicit(&self) -> T {
        self.out_sem.acquire();
        self.dequeue()
    }

    /// Removes the front item if one is immediately available.
    pub fn try_pop(&self) -> Option<T> {
        if !self.out_sem.try_acquire() {
            return None;
        }
        let value = self.dequeue();
        self.in_sem.release(1);
        Some(value)
    }

    /// Returns one slot to producers after a [`Self::pop_explicit`].
    pub fn release(&self) {
        self.in_sem.release(1);
    }

    fn dequeue(&self) -> T {
        let mut ring = self.ring.lock();
        match ring.pop_front() {
            Some(value) => value,
            // out_sem was acquired, so an item must be present
            None => unreachable!("queue semaphore out of sync with ring"),
        }
    }
}
