//! Single-consumer worker thread with a bounded task queue.
//!
//! A [`Device`] owns one thread that executes submitted tasks strictly in
//! order. The worker pops with the queue's *explicit release* policy and
//! releases only after the task has run, so a producer that enqueues a task
//! and then waits for a slot observes "work complete", not merely "task
//! dequeued".

use crate::errors::{Fqh4Error, Result};
use crate::queue::ConcurrentQueue;
use crossbeam_channel::{Receiver, TryRecvError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Erased nullary one-shot task.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for a task submitted to a [`Device`] or pool.
///
/// The result travels over a one-shot channel filled when the task finishes.
pub struct JobHandle<T> {
    rx: Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Blocks until the task completes and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::WorkerLost`] if the executing thread went away
    /// without delivering a result.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().map_err(|_| Fqh4Error::WorkerLost)
    }

    /// Returns the result if the task has already completed, without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Fqh4Error::WorkerLost`] if the executing thread went away
    /// without delivering a result.
    pub fn try_wait(&self) -> Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Fqh4Error::WorkerLost),
        }
    }
}

/// A single-threaded worker owning a bounded queue of pending tasks.
pub struct Device {
    queue: Arc<ConcurrentQueue<Task>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Device {
    /// Creates a device whose queue holds at most `max_pending` tasks.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        let queue: Arc<ConcurrentQueue<Task>> = Arc::new(ConcurrentQueue::new(max_pending));
        let stop = Arc::new(AtomicBool::new(false));

        let worker_queue = Arc::clone(&queue);
        let worker_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            loop {
                let task = worker_queue.pop_explicit();
                task();
                worker_queue.release(); // signal work completion
                if worker_stop.load(Ordering::Acquire) {
                    break;
                }
            }
        });

        Self { queue, stop, handle: Some(handle) }
    }

    /// Enqueues a task, blocking while the queue is full, and returns a
    /// handle to its result.
    pub fn enqueue<T, F>(&self, task: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.queue.push(Box::new(move || {
            // Receiver may have been dropped; the task still runs.
            let _ = tx.send(task());
        }));
        JobHandle { rx }
    }

    /// Enqueues a task without a completion handle.
    pub fn enqueue_detached<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(task));
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // First sentinel: wait until all previously enqueued work ran.
        let _ = self.enqueue(|| {}).wait();
        self.stop.store(true, Ordering::Release);
        // Second sentinel: unblock the worker's pop so it can observe stop.
        self.enqueue_detached(|| {});
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
