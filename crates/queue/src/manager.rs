//! Presentation-facing aggregation over the queue.
//!
//! Owns the per-transfer control handles (they are never handed to view
//! code), applies controller events back onto the queue, and derives the
//! stats snapshots the UI renders. Stats are recomputed periodically from
//! raw byte counters and a sliding speed window; nothing here is persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use cumulus_protocol::{TransferState, TransferStats};
use cumulus_transfer::{
    ControlHandle, RETRY_RESET_WINDOW, SpeedCalculator, TransferEvent,
};

use crate::admission::{AdmissionController, AdmissionDecision, is_candidate};
use crate::queue::{QueueError, TransferQueue, TransferUpdate, by_id};

/// Stats notification interval while the periodic loop runs.
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(500);

struct StatsEntry {
    progress: u64,
    speed: SpeedCalculator,
    last_failure: Option<Instant>,
}

impl StatsEntry {
    fn new() -> Self {
        Self {
            progress: 0,
            speed: SpeedCalculator::new(None, None),
            last_failure: None,
        }
    }
}

/// Callback receiving the periodic stats snapshot, keyed by transfer id.
pub type StatsCallback = Box<dyn Fn(HashMap<String, TransferStats>) + Send + Sync>;

/// Aggregates queue state, controller events, and control handles.
#[derive(Clone)]
pub struct TransferManager {
    queue: TransferQueue,
    admission: Arc<AdmissionController>,
    controls: Arc<Mutex<HashMap<String, ControlHandle>>>,
    stats: Arc<Mutex<HashMap<String, StatsEntry>>>,
    stop: Arc<Mutex<Option<tokio::sync::oneshot::Sender<()>>>>,
}

impl TransferManager {
    pub fn new(queue: TransferQueue) -> Self {
        let admission = Arc::new(AdmissionController::new(queue.clone()));
        Self {
            queue,
            admission,
            controls: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Runs one admission tick. On `Admit`/`AdmitImmediate` the candidate is
    /// transitioned to `Progress` and its fresh control handle returned —
    /// the caller starts the matching controller with it and keeps none of
    /// it: the handle stays owned here.
    pub fn admit_next(&self) -> Option<(String, ControlHandle)> {
        let decision = self.admission.next_admission();
        let id = match decision {
            AdmissionDecision::Admit { id } | AdmissionDecision::AdmitImmediate { id } => id,
            AdmissionDecision::Defer | AdmissionDecision::Idle => return None,
        };

        // Guard against the candidate changing state between the decision
        // and the transition.
        let updated = self
            .queue
            .update_state(|t| is_candidate(t, &id), TransferState::Progress);
        if updated == 0 {
            return None;
        }

        let handle = ControlHandle::new();
        self.controls
            .lock()
            .unwrap()
            .insert(id.clone(), handle.clone());
        debug!(transfer = %id, "transfer admitted");
        Some((id, handle))
    }

    /// Pauses a transfer; the queue captures its resume state.
    pub fn pause(&self, id: &str) -> Result<(), QueueError> {
        let controls = self.controls.lock().unwrap();
        let handle = controls
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        handle.pause();
        drop(controls);
        self.queue.update_state(by_id(id), TransferState::Paused);
        Ok(())
    }

    /// Resumes a paused transfer into exactly the state it left.
    pub fn resume(&self, id: &str) -> Result<(), QueueError> {
        let transfer = self
            .queue
            .find(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let resume_to = transfer.resume_state.unwrap_or(TransferState::Pending);

        if let Some(handle) = self.controls.lock().unwrap().get(id) {
            handle.resume();
        }
        self.queue.update_state(by_id(id), resume_to);
        Ok(())
    }

    /// Cancels a transfer: trips its control handle (releasing it) before
    /// the state flips, so in-flight block work aborts promptly.
    pub fn cancel(&self, id: &str) {
        let handle = self.controls.lock().unwrap().remove(id);
        self.queue
            .update_with_callback(by_id(id), TransferState::Canceled, |_| {
                if let Some(handle) = &handle {
                    handle.cancel();
                }
            });
    }

    /// Skips a transfer: the user chose not to move this item (e.g. at a
    /// conflict prompt). Terminal, but never reported as a failure.
    pub fn skip(&self, id: &str) {
        let handle = self.controls.lock().unwrap().remove(id);
        self.queue
            .update_with_callback(by_id(id), TransferState::Skipped, |_| {
                if let Some(handle) = &handle {
                    handle.cancel();
                }
            });
    }

    /// Restarts a failed transfer: `Error`/`NetworkError` re-enter `Pending`
    /// with the retry counter bumped. A failure older than
    /// [`RETRY_RESET_WINDOW`] starts counting from one again.
    pub fn restart(&self, id: &str) -> Result<(), QueueError> {
        let transfer = self
            .queue
            .find(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !matches!(
            transfer.state,
            TransferState::Error | TransferState::NetworkError
        ) {
            return Ok(());
        }

        let expired = {
            let stats = self.stats.lock().unwrap();
            stats
                .get(id)
                .and_then(|entry| entry.last_failure)
                .is_none_or(|at| at.elapsed() > RETRY_RESET_WINDOW)
        };
        let retries = if expired { 1 } else { transfer.retries + 1 };

        self.queue.update_with_data(
            by_id(id),
            TransferState::Pending,
            TransferUpdate {
                retries: Some(retries),
                ..TransferUpdate::default()
            },
        );
        Ok(())
    }

    /// Records a progress increment against a transfer.
    pub fn record_progress(&self, id: &str, bytes: u64) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(id.to_string()).or_insert_with(StatsEntry::new);
        entry.progress += bytes;
        entry.speed.add_sample(bytes);
    }

    /// Current stats snapshot for one transfer.
    pub fn stats(&self, id: &str) -> TransferStats {
        let stats = self.stats.lock().unwrap();
        match stats.get(id) {
            Some(entry) => TransferStats {
                progress: entry.progress,
                average_speed: entry.speed.bytes_per_second(),
            },
            None => TransferStats {
                progress: 0,
                average_speed: 0.0,
            },
        }
    }

    /// Stats for every known transfer, keyed by id.
    pub fn stats_snapshot(&self) -> HashMap<String, TransferStats> {
        let stats = self.stats.lock().unwrap();
        stats
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    TransferStats {
                        progress: entry.progress,
                        average_speed: entry.speed.bytes_per_second(),
                    },
                )
            })
            .collect()
    }

    /// Applies controller events onto the queue until the channel closes.
    /// Spawn this next to the controllers feeding `events`.
    pub async fn apply_events(&self, mut events: mpsc::Receiver<TransferEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::StateChanged {
                    transfer_id,
                    state,
                    error,
                } => {
                    if matches!(state, TransferState::Error | TransferState::NetworkError) {
                        self.stats
                            .lock()
                            .unwrap()
                            .entry(transfer_id.clone())
                            .or_insert_with(StatsEntry::new)
                            .last_failure = Some(Instant::now());
                    }
                    if state.is_finished() {
                        self.controls.lock().unwrap().remove(&transfer_id);
                    }
                    self.queue.update_with_data(
                        by_id(&transfer_id),
                        state,
                        TransferUpdate {
                            error,
                            ..TransferUpdate::default()
                        },
                    );
                }
                TransferEvent::Progress {
                    transfer_id, bytes, ..
                } => {
                    self.record_progress(&transfer_id, bytes);
                }
            }
        }
    }

    /// Starts periodic stats notifications. Call [`stop_stats_loop`] to end.
    ///
    /// [`stop_stats_loop`]: TransferManager::stop_stats_loop
    pub fn start_stats_loop(&self, interval: Option<Duration>, callback: StatsCallback) {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        {
            let mut stop = self.stop.lock().unwrap();
            drop(stop.take());
            *stop = Some(tx);
        }

        let manager = self.clone();
        let interval = interval.unwrap_or(DEFAULT_STATS_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        callback(manager.stats_snapshot());
                    }
                    _ = &mut rx => break,
                }
            }
        });
    }

    pub fn stop_stats_loop(&self) {
        drop(self.stop.lock().unwrap().take());
    }

    /// Whether the control layer still owns a handle for this transfer.
    pub fn has_control(&self, id: &str) -> bool {
        self.controls.lock().unwrap().contains_key(id)
    }
}
