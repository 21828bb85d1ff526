//! Shared vocabulary types for the Cumulus transfer pipeline.
//!
//! Everything here is plain data: transfer records and their state machine,
//! folder tree nodes, block descriptors, and derived stats snapshots. The
//! pipeline crates (`cumulus-transfer`, `cumulus-tree`, `cumulus-queue`)
//! exchange these types; none of them carries behavior beyond small helpers.

pub mod blocks;
pub mod constants;
pub mod links;
pub mod state;
pub mod stats;
pub mod transfer;

pub use blocks::{BlockList, BlockRef, UploadSlot};
pub use constants::{BLOCK_SIZE, block_equivalents};
pub use links::{ChildLink, LinkKind, LinkRef, NestedChild};
pub use state::TransferState;
pub use stats::TransferStats;
pub use transfer::{Transfer, TransferKind, TransferMeta};
