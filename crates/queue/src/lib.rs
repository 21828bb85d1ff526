//! The authoritative transfer queue and its admission/stats layers.
//!
//! [`TransferQueue`] is the single source of truth for transfer records;
//! every state change funnels through its selector+transform operations so
//! observers only ever see complete snapshots. [`AdmissionController`]
//! decides which pending transfer starts next under the global block-load
//! ceiling, and [`TransferManager`] owns the per-transfer control handles
//! and derives the view-facing stats.

mod admission;
mod manager;
mod queue;

pub use admission::{AdmissionController, AdmissionDecision};
pub use manager::TransferManager;
pub use queue::{QueueError, QueueEvent, TransferQueue, TransferUpdate, by_id};
