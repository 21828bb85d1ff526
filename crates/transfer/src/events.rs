//! Events emitted by file transfer controllers.

use cumulus_protocol::TransferState;

/// Lifecycle and progress notifications flowing from a running controller
/// back to the queue layer. Progress increments are keyed by the owning
/// link ids so bytes attribute correctly even when one transfer aggregates
/// many files.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StateChanged {
        transfer_id: String,
        state: TransferState,
        error: Option<String>,
    },
    Progress {
        transfer_id: String,
        link_ids: Vec<String>,
        bytes: u64,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            TransferEvent::StateChanged { transfer_id, .. } => transfer_id,
            TransferEvent::Progress { transfer_id, .. } => transfer_id,
        }
    }
}
