//! Live queries.
//!
//! A live query subscribes to the store's change notifications and re-runs
//! its view query in the background. Bursts of changes coalesce into at
//! most one in-flight recomputation, tracked by an explicit
//! Idle/Pending/Running state machine; listeners always receive a complete,
//! most-recent result, never an interleaved partial one.

use crate::view::{QueryOptions, QueryResult, View};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Where a live query is in its recomputation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveQueryState {
    /// Waiting for changes.
    Idle,
    /// Changes arrived; a recomputation is queued.
    Pending,
    /// A recomputation is running.
    Running,
    /// Stopped; no further results will be delivered.
    Stopped,
}

/// A continuously updating query over a view.
pub struct LiveQuery {
    state: Arc<Mutex<LiveQueryState>>,
    stopped: Arc<AtomicBool>,
    results: Receiver<QueryResult>,
    worker: Option<JoinHandle<()>>,
}

/// How long the worker sleeps between checks for a stop request.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl LiveQuery {
    /// Starts a live query; an initial result is computed immediately.
    pub fn start(view: Arc<View>, options: QueryOptions) -> Self {
        let state = Arc::new(Mutex::new(LiveQueryState::Pending));
        let stopped = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = mpsc::channel();

        let changes = view.store().changes().subscribe();
        let thread_state = Arc::clone(&state);
        let thread_stopped = Arc::clone(&stopped);

        let worker = std::thread::Builder::new()
            .name(format!("loredb-live-{}", view.name()))
            .spawn(move || {
                // Initial computation, then one recomputation per burst.
                loop {
                    if thread_stopped.load(Ordering::SeqCst) {
                        break;
                    }

                    let should_run =
                        *thread_state.lock() == LiveQueryState::Pending;
                    if should_run {
                        *thread_state.lock() = LiveQueryState::Running;
                        let result = view.query(&options);
                        if thread_stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        *thread_state.lock() = LiveQueryState::Idle;
                        if let Ok(result) = result {
                            if result_tx.send(result).is_err() {
                                break;
                            }
                        }
                        continue;
                    }

                    match changes.recv_timeout(POLL_INTERVAL) {
                        Ok(_) => {
                            // Coalesce the rest of the burst into this one
                            // recomputation.
                            while changes.try_recv().is_ok() {}
                            *thread_state.lock() = LiveQueryState::Pending;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                *thread_state.lock() = LiveQueryState::Stopped;
            })
            .ok();

        Self {
            state,
            stopped,
            results: result_rx,
            worker,
        }
    }

    /// The current state of the recomputation cycle.
    #[must_use]
    pub fn state(&self) -> LiveQueryState {
        *self.state.lock()
    }

    /// Blocks up to `timeout` for the next result.
    pub fn next_result(&self, timeout: Duration) -> Option<QueryResult> {
        self.results.recv_timeout(timeout).ok()
    }

    /// The channel of delivered results.
    #[must_use]
    pub fn results(&self) -> &Receiver<QueryResult> {
        &self.results
    }

    /// Stops the subscription and any in-flight recomputation's delivery.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        *self.state.lock() = LiveQueryState::Stopped;
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.stop();
    }
}
