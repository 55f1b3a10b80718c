//! Fixed-size thread pool of single-consumer devices.
//!
//! The pool tracks idle devices in a bitset free-list paired with a counting
//! semaphore whose value always equals the number of set bits. [`ThreadPool::submit`]
//! blocks while every device is busy, which is the pool's back-pressure:
//! callers cannot race ahead of the workers.
//!
//! Submitted tasks are nullary, one-shot, and run to completion on the chosen
//! device. A task must never wait on another pool task's handle: with all
//! devices busy waiting, no device would be left to make progress.

use crate::device::{Device, JobHandle};
use crate::errors::{Fqh4Error, Result};
use crate::queue::Semaphore;
use parking_lot::Mutex;
use std::sync::Arc;

/// Hard cap on pool size; the free-list tracks this many bits.
pub const MAX_THREADS: usize = 256;

const WORDS: usize = MAX_THREADS / 64;

struct PoolShared {
    idle_sem: Semaphore,
    free_list: Mutex<[u64; WORDS]>,
}

/// A fixed-size set of devices coordinated by an idle semaphore and a
/// free-list bitset.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    devices: Vec<Device>,
}

impl ThreadPool {
    /// Creates a pool with `num_threads` devices.
    ///
    /// The count is clamped to at least 1 and at most the machine's available
    /// parallelism.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::Oversubscribed`] if the clamped count still
    /// exceeds [`MAX_THREADS`].
    pub fn new(num_threads: usize) -> Result<Self> {
        let hardware = std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1);
        let num_threads = num_threads.clamp(1, hardware);
        if num_threads > MAX_THREADS {
            return Err(Fqh4Error::Oversubscribed { requested: num_threads, max: MAX_THREADS });
        }

        let mut free_list = [0u64; WORDS];
        for i in 0..num_threads {
            free_list[i / 64] |= 1 << (i % 64);
        }

        // Each device queue holds one work task plus its release task.
        let devices = (0..num_threads).map(|_| Device::new(2)).collect();
        let shared = Arc::new(PoolShared {
            idle_sem: Semaphore::new(num_threads),
            free_list: Mutex::new(free_list),
        });
        Ok(Self { shared, devices })
    }

    /// Number of devices in the pool.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.devices.len()
    }

    /// Number of currently idle devices.
    #[must_use]
    pub fn idle(&self) -> usize {
        let free_list = self.shared.free_list.lock();
        free_list.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Number of currently busy devices.
    #[must_use]
    pub fn busy(&self) -> usize {
        self.num_threads() - self.idle()
    }

    /// Submits a task to the lowest-index idle device, blocking while all
    /// devices are busy, and returns a handle to its result.
    ///
    /// The device announces itself idle again only after the task has fully
    /// completed: a detached release task is serialized behind the work task
    /// on the same device.
    pub fn submit<T, F>(&self, task: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.shared.idle_sem.acquire(); // wait for an idle device
        let index = {
            let mut free_list = self.shared.free_list.lock();
            let word = free_list
                .iter()
                .position(|w| *w != 0)
                .unwrap_or_else(|| unreachable!("idle semaphore out of sync with free-list"));
            let bit = free_list[word].trailing_zeros() as usize;
            free_list[word] &= !(1 << bit);
            word * 64 + bit
        };

        let handle = self.devices[index].enqueue(task);
        let shared = Arc::clone(&self.shared);
        self.devices[index].enqueue_detached(move || {
            let mut free_list = shared.free_list.lock();
            free_list[index / 64] |= 1 << (index % 64);
            shared.idle_sem.release(1);
        });
        handle
    }
}
