//! Block-level transfer engines for Cumulus.
//!
//! A file moves as a sequence of fixed-size ciphertext blocks. This crate
//! drives one file at a time: the block pipeline fetches/stores blocks with
//! retry and lookahead, the download/upload controllers wrap it with key
//! resolution, integrity verification, pause/cancel control, a stall
//! watchdog, and network auto-resume. The remote API and all cryptography
//! are collaborators behind traits; nothing in here talks to a socket.

mod api;
mod block;
mod control;
mod crypto;
mod download;
mod events;
mod heartbeat;
mod progress;
mod retry;
mod sink;
mod upload;

pub use api::{ApiError, ApiErrorKind, ApiFuture, FileDraft, StorageApi};
pub use block::download_blocks;
pub use control::{ControlHandle, ControlState, ControlWatcher};
pub use crypto::{CryptoError, CryptoProvider, CryptoWorker, SealedBlock, block_digest};
pub use download::{
    DecisionFuture, DefaultIssuePolicy, DownloadRequest, DownloadSummary, FileDownloader,
    IssueDecision, IssueHandler, TransferEnv,
};
pub use events::TransferEvent;
pub use heartbeat::Heartbeat;
pub use progress::SpeedCalculator;
pub use retry::RetryConfig;
pub use sink::{SaveSink, SavedContent};
pub use upload::{FileUploader, UploadRequest, UploadSummary};

use std::time::Duration;

/// Maximum blocks a single transfer keeps in flight (fetch lookahead on
/// download, concurrent stores on upload).
pub const MAX_BLOCKS_PER_TRANSFER: usize = 10;

/// Global ceiling on block-equivalents across all running transfers,
/// enforced by the admission controller.
pub const MAX_BLOCK_LOAD: u64 = 20;

/// A transfer with no block progress or control activity for this long is
/// considered stuck and force-cancelled.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloads at or below this size buffer fully in memory; larger ones
/// stream to a spool file.
pub const MEMORY_BUFFER_LIMIT: u64 = 128 * 1024 * 1024;

/// Retries per block after the initial attempt.
pub const MAX_BLOCK_RETRIES: u32 = 3;

/// Fresh-descriptor re-requests allowed when a block URL expires.
pub const MAX_EXPIRY_REFRESHES: u32 = 2;

/// A transfer's restart counter resets after this much time without a
/// failure.
pub const RETRY_RESET_WINDOW: Duration = Duration::from_secs(60);

/// Errors produced by the transfer pipeline.
///
/// Control signals (`Cancelled`, `Skipped`, `Conflict`) are variants of their
/// own so callers branch on discriminants instead of matching message
/// strings; cleanup paths check [`TransferError::is_cancel`] to skip error
/// reporting for user-initiated aborts.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer skipped")]
    Skipped,

    #[error("name already taken: {0}")]
    Conflict(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by server")]
    RateLimited,

    #[error("block url expired beyond refresh budget")]
    BlockExpired,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity mismatch on block {index}")]
    IntegrityMismatch { index: u32 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transfer stalled: no progress within the heartbeat window")]
    Stalled,

    #[error("api error: {0}")]
    Api(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Fatal(String),
}

impl TransferError {
    /// User-initiated abort — cleanup without error reporting.
    pub fn is_cancel(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Control signals that are not failures: cancel, skip, conflict.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            TransferError::Cancelled | TransferError::Skipped | TransferError::Conflict(_)
        )
    }

    /// Transient conditions worth an automatic retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Network(_) | TransferError::RateLimited | TransferError::BlockExpired
        )
    }
}

impl From<ApiError> for TransferError {
    fn from(err: ApiError) -> Self {
        match err.kind {
            ApiErrorKind::Network => TransferError::Network(err.message),
            ApiErrorKind::RateLimited => TransferError::RateLimited,
            ApiErrorKind::Expired => TransferError::BlockExpired,
            ApiErrorKind::NotFound => TransferError::NotFound(err.message),
            ApiErrorKind::Conflict => TransferError::Conflict(err.message),
            ApiErrorKind::Server => TransferError::Api(err.message),
        }
    }
}
