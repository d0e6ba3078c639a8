//! Bounded worker pool for background load tasks
//!
//! Uses crossbeam channels for an MPMC work queue with closure-based tasks.
//! Two instances drive the pipeline: one sized for parallel disk reads, one
//! always single-threaded for the upload side, because the display device
//! may only be touched from a single execution context.
//!
//! Admission is FIFO to whichever worker frees up first; no ordering exists
//! between independently scheduled tasks. Callers that need ordering chain
//! explicitly (the IO completion schedules the upload task).
//!
//! There is no in-place resize. Changing the worker count means draining
//! (`wait_idle`) and constructing a new scheduler.

use crossbeam_channel::{Sender, unbounded};
use log::{debug, error};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker count policy for a [`TaskScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workers {
    /// Fixed pool of `n` threads (at least one).
    Bounded(usize),
    /// No concurrency cap: every task gets its own thread.
    Unbounded,
}

impl Workers {
    /// Map a host-supplied thread count. Zero and negative values mean one
    /// implicit worker; anything positive is taken literally.
    pub fn from_config(threads: i32) -> Self {
        if threads <= 0 {
            Workers::Bounded(1)
        } else {
            Workers::Bounded(threads as usize)
        }
    }
}

/// Completion flag for a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    done: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Fixed worker pool draining a FIFO queue of boxed closures.
///
/// Task panics are caught at the worker boundary and logged; the worker
/// keeps serving the queue. Failure results are the task's own business:
/// each task reports through its completion path, never by unwinding.
pub struct TaskScheduler {
    name: String,
    sender: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl TaskScheduler {
    /// Spawn the worker threads. `name` prefixes thread names for debugging.
    pub fn new(name: &str, workers: Workers) -> Self {
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));

        let (sender, handles) = match workers {
            Workers::Bounded(count) => {
                let count = count.max(1);
                let (tx, rx) = unbounded::<Job>();
                let mut handles = Vec::with_capacity(count);

                for worker_id in 0..count {
                    let rx = rx.clone();
                    let handle = thread::Builder::new()
                        .name(format!("{}-{}", name, worker_id))
                        .spawn(move || {
                            debug!("Worker {} started", worker_id);
                            while let Ok(job) = rx.recv() {
                                job();
                            }
                            debug!("Worker {} stopped", worker_id);
                        })
                        .expect("Failed to spawn worker thread");
                    handles.push(handle);
                }

                debug!("Scheduler '{}' started: {} workers", name, count);
                (Some(tx), handles)
            }
            Workers::Unbounded => {
                debug!("Scheduler '{}' started: unbounded", name);
                (None, Vec::new())
            }
        };

        Self {
            name: name.to_string(),
            sender,
            handles,
            pending,
        }
    }

    /// Queue a task. Returns a handle whose `is_finished()` flips once the
    /// task has run (or panicked).
    pub fn schedule<F>(&self, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let handle = TaskHandle {
            done: Arc::clone(&done),
        };

        {
            let (lock, _) = &*self.pending;
            let mut count = lock.lock().unwrap_or_else(|e| e.into_inner());
            *count += 1;
        }

        let pending = Arc::clone(&self.pending);
        let name = self.name.clone();
        let wrapped = move || {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("Scheduler '{}': task panicked", name);
            }
            done.store(true, Ordering::Release);
            let (lock, cvar) = &*pending;
            let mut count = lock.lock().unwrap_or_else(|e| e.into_inner());
            *count = count.saturating_sub(1);
            cvar.notify_all();
        };

        match &self.sender {
            Some(sender) => {
                if sender.send(Box::new(wrapped)).is_err() {
                    error!("Scheduler '{}': queue closed, task dropped", self.name);
                }
            }
            None => {
                thread::Builder::new()
                    .name(format!("{}-task", self.name))
                    .spawn(wrapped)
                    .expect("Failed to spawn task thread");
            }
        }

        handle
    }

    /// Queued plus running task count.
    pub fn pending(&self) -> usize {
        let (lock, _) = &*self.pending;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until every scheduled task has completed.
    pub fn wait_idle(&self) {
        let (lock, cvar) = &*self.pending;
        let mut count = lock.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            count = cvar.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        debug!("Scheduler '{}' shutting down", self.name);
        // Closing the channel ends the worker loops once the queue drains
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_from_config_mapping() {
        assert_eq!(Workers::from_config(-1), Workers::Bounded(1));
        assert_eq!(Workers::from_config(0), Workers::Bounded(1));
        assert_eq!(Workers::from_config(1), Workers::Bounded(1));
        assert_eq!(Workers::from_config(4), Workers::Bounded(4));
    }

    #[test]
    fn test_single_worker_runs_fifo() {
        let scheduler = TaskScheduler::new("test-fifo", Workers::Bounded(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8 {
            let order = Arc::clone(&order);
            scheduler.schedule(move || {
                order.lock().unwrap().push(i);
            });
        }
        scheduler.wait_idle();

        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_handle_reports_completion() {
        let scheduler = TaskScheduler::new("test-handle", Workers::Bounded(2));
        let handle = scheduler.schedule(|| {});
        scheduler.wait_idle();
        assert!(handle.is_finished());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let scheduler = TaskScheduler::new("test-panic", Workers::Bounded(1));
        let ran = Arc::new(AtomicBool::new(false));

        let bad = scheduler.schedule(|| panic!("boom"));
        let ran2 = Arc::clone(&ran);
        scheduler.schedule(move || ran2.store(true, Ordering::SeqCst));
        scheduler.wait_idle();

        // The panicking task finished (as a failure) and the next one ran
        assert!(bad.is_finished());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unbounded_runs_concurrently() {
        let scheduler = TaskScheduler::new("test-unbounded", Workers::Unbounded);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            scheduler.schedule(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        scheduler.wait_idle();

        // With no cap, at least two of the sleeping tasks overlapped
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_bounded_caps_concurrency() {
        let scheduler = TaskScheduler::new("test-cap", Workers::Bounded(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            scheduler.schedule(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        scheduler.wait_idle();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
