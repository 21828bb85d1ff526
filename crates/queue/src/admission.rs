//! Greedy, non-preemptive admission under a global block-load ceiling.

use cumulus_protocol::{Transfer, TransferState, block_equivalents};
use cumulus_transfer::{MAX_BLOCK_LOAD, MAX_BLOCKS_PER_TRANSFER};

use crate::queue::TransferQueue;

/// What the scheduler should do on this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Start this transfer (transition it to `Progress`).
    Admit { id: String },
    /// Start this transfer outside load accounting — its content is already
    /// in memory and completes synchronously relative to the tick.
    AdmitImmediate { id: String },
    /// Candidates exist but the load budget (or an unknown size) defers them.
    Defer,
    /// Nothing is waiting.
    Idle,
}

/// Decides which pending transfer starts next.
///
/// Load is the sum of block-equivalents over all `Progress`/`Finalizing`
/// transfers, each clipped to the per-transfer lookahead ceiling. Admission
/// is greedy and never preempts: once started, a transfer runs until it
/// finishes, fails, or the user pauses/cancels it.
pub struct AdmissionController {
    queue: TransferQueue,
    max_load: u64,
}

impl AdmissionController {
    pub fn new(queue: TransferQueue) -> Self {
        Self {
            queue,
            max_load: MAX_BLOCK_LOAD,
        }
    }

    pub fn with_max_load(queue: TransferQueue, max_load: u64) -> Self {
        Self { queue, max_load }
    }

    /// Current load in block-equivalents, or `None` while any running
    /// transfer's size is still unknown (load cannot be computed safely).
    pub fn current_load(&self) -> Option<u64> {
        let mut load = 0u64;
        for transfer in self.queue.snapshot() {
            if !matches!(
                transfer.state,
                TransferState::Progress | TransferState::Finalizing
            ) {
                continue;
            }
            if transfer.bypasses_load() {
                continue;
            }
            let size = transfer.meta.size?;
            load += block_equivalents(size).min(MAX_BLOCKS_PER_TRANSFER as u64);
        }
        Some(load)
    }

    /// Picks the next transfer to start, if the budget permits.
    ///
    /// Downloads take the oldest `Pending` entry; uploads the oldest
    /// `Pending` upload. A load-bypassing transfer is admitted regardless of
    /// budget.
    pub fn next_admission(&self) -> AdmissionDecision {
        let snapshot = self.queue.snapshot();
        // The queue is stored newest-first; admit in arrival order.
        let candidate = snapshot
            .iter()
            .rev()
            .find(|t| t.state == TransferState::Pending);
        let Some(candidate) = candidate else {
            return AdmissionDecision::Idle;
        };

        if candidate.bypasses_load() {
            return AdmissionDecision::AdmitImmediate {
                id: candidate.id.clone(),
            };
        }

        let Some(load) = self.current_load() else {
            // A running transfer's size is unresolved; admitting now could
            // blow the budget.
            return AdmissionDecision::Defer;
        };
        if load < self.max_load {
            AdmissionDecision::Admit {
                id: candidate.id.clone(),
            }
        } else {
            AdmissionDecision::Defer
        }
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }
}

/// Selector for the admission tick: the candidate by id.
pub(crate) fn is_candidate(transfer: &Transfer, id: &str) -> bool {
    transfer.id == id && transfer.state == TransferState::Pending
}
