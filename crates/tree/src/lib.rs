//! Folder tree enumeration and per-file transfer fan-out.
//!
//! The loader walks a folder's descendants depth-first over the children
//! API, aggregating sizes bottom-up while feeding a live stream of
//! discovered nodes. The iterator consumes that stream and starts a block
//! download for every file the moment it appears, so transfers begin while
//! deeper subtrees are still being listed.

mod iterator;
mod loader;

pub use iterator::{LinkIterator, StartedChild};
pub use loader::{FolderScan, FolderTreeLoader, TreeCallbacks};
