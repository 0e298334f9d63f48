//! Per-database background execution.
//!
//! Each database owns one dedicated worker thread. Work submitted through
//! [`TaskExecutor::submit`] runs there in submission order, preserving the
//! single-writer-at-a-time guarantee even when callers submit from many
//! threads. Callers hold a [`TaskHandle`] they may wait on or cancel.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum TaskSlot<T> {
    Pending,
    Done(T),
    Cancelled,
}

struct TaskShared<T> {
    slot: Mutex<TaskSlot<T>>,
    done: Condvar,
    cancelled: AtomicBool,
}

/// Handle to work submitted to a [`TaskExecutor`].
pub struct TaskHandle<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T> TaskHandle<T> {
    /// Requests cancellation.
    ///
    /// Work that has not started yet will not run; work already running is
    /// not interrupted, but its result is discarded.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        let mut slot = self.shared.slot.lock();
        if matches!(*slot, TaskSlot::Pending) {
            *slot = TaskSlot::Cancelled;
            self.shared.done.notify_all();
        }
    }

    /// True once the task has produced a result or been cancelled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(*self.shared.slot.lock(), TaskSlot::Pending)
    }

    /// Blocks until the task finishes; `None` if it was cancelled.
    #[must_use]
    pub fn wait(self) -> Option<T> {
        let mut slot = self.shared.slot.lock();
        while matches!(*slot, TaskSlot::Pending) {
            self.shared.done.wait(&mut slot);
        }
        match std::mem::replace(&mut *slot, TaskSlot::Cancelled) {
            TaskSlot::Done(value) => Some(value),
            _ => None,
        }
    }

    /// Blocks up to `timeout`; `None` if still running or cancelled.
    #[must_use]
    pub fn wait_timeout(self, timeout: Duration) -> Option<T> {
        let mut slot = self.shared.slot.lock();
        if matches!(*slot, TaskSlot::Pending) {
            self.shared.done.wait_for(&mut slot, timeout);
        }
        match std::mem::replace(&mut *slot, TaskSlot::Cancelled) {
            TaskSlot::Done(value) => Some(value),
            _ => None,
        }
    }
}

/// A single-threaded background executor.
pub struct TaskExecutor {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl TaskExecutor {
    /// Spawns the worker thread.
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name(format!("loredb-worker-{name}"))
            .spawn(move || {
                // Drains remaining jobs on shutdown before exiting.
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .ok();
        Self {
            sender: Some(sender),
            worker,
        }
    }

    /// Submits work to the background thread.
    ///
    /// Jobs run strictly in submission order. If the executor is already
    /// shut down the returned handle is immediately cancelled.
    pub fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let shared = Arc::new(TaskShared {
            slot: Mutex::new(TaskSlot::Pending),
            done: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });
        let handle = TaskHandle {
            shared: Arc::clone(&shared),
        };

        let job: Job = Box::new(move || {
            if shared.cancelled.load(Ordering::SeqCst) {
                return;
            }
            let value = f();
            let mut slot = shared.slot.lock();
            if matches!(*slot, TaskSlot::Pending) {
                *slot = TaskSlot::Done(value);
                shared.done.notify_all();
            }
        });

        let sent = self
            .sender
            .as_ref()
            .map(|tx| tx.send(job).is_ok())
            .unwrap_or(false);
        if !sent {
            handle.cancel();
        }
        handle
    }

    /// Stops accepting work and waits for queued jobs to finish.
    pub fn shutdown(&mut self) {
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn submit_and_wait() {
        let executor = TaskExecutor::new("test");
        let handle = executor.submit(|| 21 * 2);
        assert_eq!(handle.wait(), Some(42));
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let executor = TaskExecutor::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = Arc::clone(&log);
                executor.submit(move || log.lock().push(i))
            })
            .collect();
        for handle in handles {
            let _ = handle.wait();
        }

        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn cancel_before_run_skips_work() {
        let executor = TaskExecutor::new("test");
        let ran = Arc::new(AtomicUsize::new(0));

        // Park the worker briefly so the second job is still queued when
        // we cancel it.
        let gate = executor.submit(|| std::thread::sleep(Duration::from_millis(50)));
        let ran_clone = Arc::clone(&ran);
        let victim = executor.submit(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        victim.cancel();

        let _ = gate.wait();
        let result = victim.wait();
        assert!(result.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wait_timeout_on_slow_job() {
        let executor = TaskExecutor::new("test");
        let handle = executor.submit(|| {
            std::thread::sleep(Duration::from_millis(200));
            7
        });
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn shutdown_finishes_queued_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut executor = TaskExecutor::new("test");
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            let _ = executor.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn submit_after_shutdown_is_cancelled() {
        let mut executor = TaskExecutor::new("test");
        executor.shutdown();
        let handle = executor.submit(|| 1);
        assert!(handle.is_finished());
        assert_eq!(handle.wait(), None);
    }
}
