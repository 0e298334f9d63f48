//! Change notifications.
//!
//! Every committed mutation of the revision store produces a
//! [`DocumentChange`]. Changes queue up while a transaction is open and are
//! delivered only once the outermost transaction commits, so listeners never
//! observe partial state. Delivery fans out to channel subscribers and to
//! registered observer callbacks.

use crate::revid::RevId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// A committed change to one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// The document's external id.
    pub doc_id: String,
    /// The revision that was added.
    pub rev_id: RevId,
    /// The document's winning revision after the change.
    pub winning_rev_id: Option<RevId>,
    /// True if the document is in conflict after the change.
    pub in_conflict: bool,
    /// Tag identifying an externally-sourced change (e.g. a replicator's
    /// remote URL). Absent for purely local writes; replication logic uses
    /// this to avoid feedback loops.
    pub source: Option<String>,
}

impl DocumentChange {
    /// True if the added revision is the document's winning revision.
    #[must_use]
    pub fn is_winning_revision(&self) -> bool {
        self.winning_rev_id.as_ref() == Some(&self.rev_id)
    }

    /// True if the change arrived from an external source.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.source.is_some()
    }
}

/// Observer callback invoked synchronously during notification flushes.
pub type ChangeObserver = Arc<dyn Fn(&DocumentChange) + Send + Sync>;

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverToken(u64);

/// Distributes committed changes to subscribers and observers.
pub struct ChangeFeed {
    subscribers: Mutex<Vec<Sender<DocumentChange>>>,
    observers: Mutex<Vec<(ObserverToken, ChangeObserver)>>,
    next_token: AtomicU64,
}

impl ChangeFeed {
    /// Creates an empty feed.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Subscribes to changes through a channel.
    ///
    /// The receiver gets every change committed after this call.
    pub fn subscribe(&self) -> Receiver<DocumentChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Registers a synchronous observer callback.
    ///
    /// The callback runs on the committing thread during the notification
    /// flush. It may itself mutate the store; the resulting changes are
    /// queued and delivered by the flush loop already in progress.
    pub fn observe(&self, observer: ChangeObserver) -> ObserverToken {
        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((token, observer));
        token
    }

    /// Removes a registered observer.
    pub fn remove_observer(&self, token: ObserverToken) {
        self.observers.lock().retain(|(t, _)| *t != token);
    }

    /// Returns the number of live channel subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn emit(&self, change: &DocumentChange) {
        // Send to channel subscribers, dropping the disconnected ones.
        self.subscribers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());

        // Clone out the observer list so a callback can register or remove
        // observers without deadlocking.
        let observers: Vec<ChangeObserver> = self
            .observers
            .lock()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for observer in observers {
            observer(change);
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// The deferred-notification queue.
///
/// Changes are enqueued during a transaction and flushed when the
/// transaction-nesting counter returns to zero. The `posting` flag prevents
/// recursive flushing when an observer callback mutates the store: the inner
/// flush call returns immediately and the outer flush loop re-checks the
/// queue after each pass.
pub(crate) struct Notifier {
    queue: Mutex<VecDeque<DocumentChange>>,
    posting: AtomicBool,
    feed: ChangeFeed,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            posting: AtomicBool::new(false),
            feed: ChangeFeed::new(),
        }
    }

    pub(crate) fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub(crate) fn enqueue(&self, change: DocumentChange) {
        self.queue.lock().push_back(change);
    }

    /// Discards queued changes (transaction rollback).
    pub(crate) fn discard(&self) {
        self.queue.lock().clear();
    }

    /// Delivers all queued changes.
    ///
    /// Must be called without holding any store lock: observers run on this
    /// thread and may call back into the store.
    pub(crate) fn flush(&self) {
        loop {
            if self
                .posting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another flush (possibly further up this call stack) is
                // draining; it will pick up what we enqueued.
                return;
            }

            loop {
                let batch: Vec<DocumentChange> =
                    self.queue.lock().drain(..).collect();
                if batch.is_empty() {
                    break;
                }
                for change in &batch {
                    self.feed.emit(change);
                }
            }

            self.posting.store(false, Ordering::Release);

            // An enqueue may have raced the flag reset; loop if so.
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn change(doc: &str, rev: &str) -> DocumentChange {
        DocumentChange {
            doc_id: doc.to_string(),
            rev_id: RevId::new(rev),
            winning_rev_id: Some(RevId::new(rev)),
            in_conflict: false,
            source: None,
        }
    }

    #[test]
    fn winning_revision_flag() {
        let mut c = change("d", "1-a");
        assert!(c.is_winning_revision());
        c.winning_rev_id = Some(RevId::new("2-b"));
        assert!(!c.is_winning_revision());
    }

    #[test]
    fn subscribe_and_flush() {
        let notifier = Notifier::new();
        let rx = notifier.feed().subscribe();

        notifier.enqueue(change("d", "1-a"));
        notifier.flush();

        let got = rx.try_recv().unwrap();
        assert_eq!(got.doc_id, "d");
    }

    #[test]
    fn discard_drops_queued_changes() {
        let notifier = Notifier::new();
        let rx = notifier.feed().subscribe();

        notifier.enqueue(change("d", "1-a"));
        notifier.discard();
        notifier.flush();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn observer_receives_changes_in_order() {
        let notifier = Notifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        notifier.feed().observe(Arc::new(move |c: &DocumentChange| {
            seen_clone.lock().push(c.rev_id.as_str().to_string());
        }));

        notifier.enqueue(change("d", "1-a"));
        notifier.enqueue(change("d", "2-b"));
        notifier.flush();

        assert_eq!(*seen.lock(), vec!["1-a".to_string(), "2-b".to_string()]);
    }

    #[test]
    fn observer_enqueueing_during_flush_is_drained() {
        let notifier = Arc::new(Notifier::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let notifier_clone = Arc::clone(&notifier);
        let counter_clone = Arc::clone(&counter);
        notifier.feed().observe(Arc::new(move |_c: &DocumentChange| {
            if counter_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                // Simulate a listener that triggers a follow-up write.
                notifier_clone.enqueue(change("follow", "1-x"));
                // A nested flush attempt must not recurse.
                notifier_clone.flush();
            }
        }));

        notifier.enqueue(change("d", "1-a"));
        notifier.flush();

        // Both the original and the follow-up change were delivered.
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_observer_is_silent() {
        let notifier = Notifier::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let token = notifier.feed().observe(Arc::new(move |_c: &DocumentChange| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        notifier.feed().remove_observer(token);
        notifier.enqueue(change("d", "1-a"));
        notifier.flush();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let notifier = Notifier::new();
        let rx = notifier.feed().subscribe();
        assert_eq!(notifier.feed().subscriber_count(), 1);
        drop(rx);

        notifier.enqueue(change("d", "1-a"));
        notifier.flush();
        assert_eq!(notifier.feed().subscriber_count(), 0);
    }
}
