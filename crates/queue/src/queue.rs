//! The observable transfer store.

use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use cumulus_protocol::{Transfer, TransferState};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// An unfinished transfer over the same nodes already exists.
    #[error("transfer already in progress")]
    AlreadyInProgress,

    #[error("transfer not found: {0}")]
    NotFound(String),
}

/// Change notifications for queue observers.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Added { id: String },
    Updated { id: String, state: TransferState },
    Removed { id: String },
    Cleared,
}

/// Optional fields merged into a transfer by [`TransferQueue::update_with_data`].
#[derive(Debug, Clone, Default)]
pub struct TransferUpdate {
    pub size: Option<u64>,
    pub filename: Option<String>,
    pub error: Option<String>,
    pub retries: Option<u32>,
}

/// Single source of truth for all transfer records.
///
/// Cloning shares the same store. Every mutation holds the write lock for
/// the whole selector+transform step, so no reader observes a partial
/// update; events are emitted per logical operation.
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<RwLock<Vec<Transfer>>>,
    events_tx: mpsc::UnboundedSender<QueueEvent>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<QueueEvent>>>>,
}

impl TransferQueue {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<QueueEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Adds a transfer unless an equivalent unfinished one already exists.
    ///
    /// The duplicate-overlap check and the append happen under one write
    /// lock — two concurrent `add` calls for overlapping node sets can never
    /// both succeed. Rejection happens before any I/O and leaves the queue
    /// unchanged.
    pub fn add(&self, transfer: Transfer) -> Result<String, QueueError> {
        let mut transfers = self.inner.write().unwrap();
        let duplicate = transfers
            .iter()
            .any(|existing| !existing.is_finished() && existing.overlaps(&transfer));
        if duplicate {
            return Err(QueueError::AlreadyInProgress);
        }

        let id = transfer.id.clone();
        debug!(transfer = %id, state = ?transfer.state, "transfer queued");
        // Newest first: display order, not scheduling priority.
        transfers.insert(0, transfer);
        drop(transfers);

        let _ = self.events_tx.send(QueueEvent::Added { id: id.clone() });
        Ok(id)
    }

    /// Applies a state transition to every transfer matched by `selector`.
    ///
    /// Pausing captures the pre-pause state into `resume_state` unless one
    /// is already captured (repeated pauses must not lose the true prior
    /// state); any other transition clears it.
    pub fn update_state(
        &self,
        selector: impl Fn(&Transfer) -> bool,
        new_state: TransferState,
    ) -> usize {
        self.apply(selector, new_state, |_| {}, |_| {})
    }

    /// Like [`update_state`], additionally merging `data` into each match.
    ///
    /// [`update_state`]: TransferQueue::update_state
    pub fn update_with_data(
        &self,
        selector: impl Fn(&Transfer) -> bool,
        new_state: TransferState,
        data: TransferUpdate,
    ) -> usize {
        self.apply(
            selector,
            new_state,
            |_| {},
            move |transfer| {
                if let Some(size) = data.size {
                    transfer.meta.size = Some(size);
                }
                if let Some(filename) = &data.filename {
                    transfer.meta.filename = filename.clone();
                }
                if let Some(retries) = data.retries {
                    transfer.retries = retries;
                }
                transfer.error = data.error.clone();
            },
        )
    }

    /// Like [`update_state`], invoking `callback` with each matched
    /// transfer's pre-mutation snapshot first (e.g. to release a control
    /// handle).
    ///
    /// [`update_state`]: TransferQueue::update_state
    pub fn update_with_callback(
        &self,
        selector: impl Fn(&Transfer) -> bool,
        new_state: TransferState,
        callback: impl Fn(&Transfer),
    ) -> usize {
        self.apply(selector, new_state, callback, |_| {})
    }

    fn apply(
        &self,
        selector: impl Fn(&Transfer) -> bool,
        new_state: TransferState,
        before: impl Fn(&Transfer),
        mutate: impl Fn(&mut Transfer),
    ) -> usize {
        let mut updated = Vec::new();
        {
            let mut transfers = self.inner.write().unwrap();
            for transfer in transfers.iter_mut() {
                if !selector(transfer) {
                    continue;
                }
                before(transfer);
                if new_state == TransferState::Paused {
                    if transfer.resume_state.is_none() {
                        transfer.resume_state = Some(transfer.state);
                    }
                } else {
                    transfer.resume_state = None;
                }
                transfer.state = new_state;
                if !matches!(new_state, TransferState::Error | TransferState::NetworkError) {
                    transfer.error = None;
                }
                mutate(transfer);
                updated.push(transfer.id.clone());
            }
        }
        for id in &updated {
            let _ = self.events_tx.send(QueueEvent::Updated {
                id: id.clone(),
                state: new_state,
            });
        }
        updated.len()
    }

    /// Removes matched transfers, invoking `callback` per removed transfer
    /// before deletion. Removal does not cancel — cancellation is the
    /// caller's prerequisite.
    pub fn remove(
        &self,
        selector: impl Fn(&Transfer) -> bool,
        callback: impl Fn(&Transfer),
    ) -> usize {
        let mut removed = Vec::new();
        {
            let mut transfers = self.inner.write().unwrap();
            transfers.retain(|transfer| {
                if selector(transfer) {
                    callback(transfer);
                    removed.push(transfer.id.clone());
                    false
                } else {
                    true
                }
            });
        }
        for id in &removed {
            let _ = self.events_tx.send(QueueEvent::Removed { id: id.clone() });
        }
        removed.len()
    }

    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
        let _ = self.events_tx.send(QueueEvent::Cleared);
    }

    /// All transfers, newest first.
    pub fn snapshot(&self) -> Vec<Transfer> {
        self.inner.read().unwrap().clone()
    }

    pub fn find(&self, id: &str) -> Option<Transfer> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Selector matching a single transfer id.
pub fn by_id(id: &str) -> impl Fn(&Transfer) -> bool + '_ {
    move |transfer| transfer.id == id
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_protocol::{LinkRef, TransferMeta};

    fn meta(name: &str) -> TransferMeta {
        TransferMeta {
            filename: name.into(),
            mime_type: String::new(),
            size: Some(100),
        }
    }

    fn download(name: &str, link_ids: &[&str]) -> Transfer {
        Transfer::new_download(
            meta(name),
            link_ids.iter().map(|l| LinkRef::new("s1", *l)).collect(),
        )
    }

    #[test]
    fn add_appends_newest_first() {
        let queue = TransferQueue::new();
        let first = queue.add(download("one", &["l1"])).unwrap();
        let second = queue.add(download("two", &["l2"])).unwrap();

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, second);
        assert_eq!(snapshot[1].id, first);
    }

    #[test]
    fn overlapping_unfinished_add_is_rejected_and_queue_unchanged() {
        let queue = TransferQueue::new();
        queue.add(download("a", &["l1", "l2"])).unwrap();
        let before = queue.snapshot();

        let err = queue.add(download("b", &["l2", "l3"])).unwrap_err();
        assert_eq!(err, QueueError::AlreadyInProgress);
        assert_eq!(queue.snapshot(), before);
    }

    #[test]
    fn finished_transfer_does_not_block_new_add() {
        let queue = TransferQueue::new();
        let id = queue.add(download("a", &["l1"])).unwrap();
        queue.update_state(by_id(&id), TransferState::Done);

        queue.add(download("a again", &["l1"])).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn disjoint_adds_are_accepted() {
        let queue = TransferQueue::new();
        queue.add(download("a", &["l1"])).unwrap();
        queue.add(download("b", &["l2"])).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pause_captures_resume_state_once() {
        let queue = TransferQueue::new();
        let id = queue.add(download("a", &["l1"])).unwrap();
        queue.update_state(by_id(&id), TransferState::Progress);

        queue.update_state(by_id(&id), TransferState::Paused);
        let t = queue.find(&id).unwrap();
        assert_eq!(t.state, TransferState::Paused);
        assert_eq!(t.resume_state, Some(TransferState::Progress));

        // A repeated pause must not overwrite the captured state.
        queue.update_state(by_id(&id), TransferState::Paused);
        assert_eq!(
            queue.find(&id).unwrap().resume_state,
            Some(TransferState::Progress)
        );
    }

    #[test]
    fn resume_round_trip_restores_exact_state() {
        let queue = TransferQueue::new();
        let id = queue.add(download("a", &["l1"])).unwrap();
        queue.update_state(by_id(&id), TransferState::Finalizing);
        queue.update_state(by_id(&id), TransferState::Paused);

        let resume_to = queue.find(&id).unwrap().resume_state.unwrap();
        queue.update_state(by_id(&id), resume_to);

        let t = queue.find(&id).unwrap();
        assert_eq!(t.state, TransferState::Finalizing);
        assert!(t.resume_state.is_none());
    }

    #[test]
    fn update_with_data_merges_fields() {
        let queue = TransferQueue::new();
        let id = queue.add(download("a", &["l1"])).unwrap();

        queue.update_with_data(
            by_id(&id),
            TransferState::Error,
            TransferUpdate {
                size: Some(4096),
                filename: None,
                error: Some("boom".into()),
                retries: None,
            },
        );
        let t = queue.find(&id).unwrap();
        assert_eq!(t.state, TransferState::Error);
        assert_eq!(t.meta.size, Some(4096));
        assert_eq!(t.error.as_deref(), Some("boom"));
    }

    #[test]
    fn leaving_error_state_clears_error() {
        let queue = TransferQueue::new();
        let id = queue.add(download("a", &["l1"])).unwrap();
        queue.update_with_data(
            by_id(&id),
            TransferState::Error,
            TransferUpdate {
                error: Some("boom".into()),
                ..TransferUpdate::default()
            },
        );

        queue.update_state(by_id(&id), TransferState::Pending);
        assert!(queue.find(&id).unwrap().error.is_none());
    }

    #[test]
    fn update_with_callback_sees_pre_mutation_snapshot() {
        let queue = TransferQueue::new();
        let id = queue.add(download("a", &["l1"])).unwrap();
        queue.update_state(by_id(&id), TransferState::Progress);

        let observed = std::sync::Mutex::new(None);
        queue.update_with_callback(by_id(&id), TransferState::Canceled, |transfer| {
            *observed.lock().unwrap() = Some(transfer.state);
        });
        assert_eq!(*observed.lock().unwrap(), Some(TransferState::Progress));
        assert_eq!(queue.find(&id).unwrap().state, TransferState::Canceled);
    }

    #[test]
    fn remove_invokes_callback_before_deletion() {
        let queue = TransferQueue::new();
        let id = queue.add(download("a", &["l1"])).unwrap();

        let seen = std::sync::Mutex::new(Vec::new());
        let removed = queue.remove(by_id(&id), |transfer| {
            seen.lock().unwrap().push(transfer.id.clone());
        });
        assert_eq!(removed, 1);
        assert_eq!(*seen.lock().unwrap(), vec![id]);
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_removes_everything() {
        let queue = TransferQueue::new();
        queue.add(download("a", &["l1"])).unwrap();
        queue.add(download("b", &["l2"])).unwrap();
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn events_reflect_mutations() {
        let queue = TransferQueue::new();
        let mut events = queue.take_events().unwrap();
        assert!(queue.take_events().is_none());

        let id = queue.add(download("a", &["l1"])).unwrap();
        queue.update_state(by_id(&id), TransferState::Progress);
        queue.remove(by_id(&id), |_| {});

        assert_eq!(events.recv().await, Some(QueueEvent::Added { id: id.clone() }));
        assert_eq!(
            events.recv().await,
            Some(QueueEvent::Updated {
                id: id.clone(),
                state: TransferState::Progress
            })
        );
        assert_eq!(events.recv().await, Some(QueueEvent::Removed { id }));
    }

    #[test]
    fn concurrent_adds_admit_exactly_one_of_overlapping_pair() {
        use std::thread;

        for _ in 0..20 {
            let queue = TransferQueue::new();
            let a = download("a", &["shared"]);
            let b = download("b", &["shared"]);

            let q1 = queue.clone();
            let q2 = queue.clone();
            let h1 = thread::spawn(move || q1.add(a).is_ok());
            let h2 = thread::spawn(move || q2.add(b).is_ok());
            let ok1 = h1.join().unwrap();
            let ok2 = h2.join().unwrap();

            assert!(ok1 ^ ok2, "exactly one of two overlapping adds wins");
            assert_eq!(queue.len(), 1);
        }
    }
}
