use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer.
///
/// The closed set shared by downloads and uploads. Grouping helpers below
/// match how the admission controller and the UI bucket states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    /// Created, name/size still resolving (folder and archive transfers).
    Initializing,
    /// Waiting for admission.
    Pending,
    /// Blocked on a user decision about a name conflict.
    Conflict,
    /// Blocked on a decision about a signature verification anomaly.
    SignatureIssue,
    /// Blocked on a decision about an anti-virus scan anomaly.
    ScanIssue,
    /// Actively moving blocks.
    Progress,
    /// All blocks moved, commit/flush in flight.
    Finalizing,
    Done,
    Skipped,
    Canceled,
    Error,
    /// Failed on a transient network error; auto-resumes on connectivity.
    NetworkError,
    Paused,
}

impl TransferState {
    /// Progress, Finalizing, Paused, SignatureIssue, ScanIssue.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransferState::Progress
                | TransferState::Finalizing
                | TransferState::Paused
                | TransferState::SignatureIssue
                | TransferState::ScanIssue
        )
    }

    /// Skipped, Canceled, NetworkError, Error.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TransferState::Skipped
                | TransferState::Canceled
                | TransferState::NetworkError
                | TransferState::Error
        )
    }

    pub fn is_done(self) -> bool {
        self == TransferState::Done
    }

    /// Initializing, Conflict, Pending.
    pub fn is_queued(self) -> bool {
        matches!(
            self,
            TransferState::Initializing | TransferState::Conflict | TransferState::Pending
        )
    }

    /// Finished transfers no longer count for the duplicate-overlap check.
    pub fn is_finished(self) -> bool {
        self.is_done() || self.is_failure()
    }

    pub fn is_paused(self) -> bool {
        self == TransferState::Paused
    }
}
