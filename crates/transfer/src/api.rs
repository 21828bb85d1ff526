//! Remote storage API collaborator.
//!
//! `StorageApi` is implemented by the application on top of its HTTP client.
//! Using a trait keeps the pipeline decoupled from transport and testable
//! with mocks.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use cumulus_protocol::{BlockList, ChildLink, LinkRef, UploadSlot};

/// Boxed future returned by [`StorageApi`] methods.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Failure classes of the remote API, so the engine branches on kinds rather
/// than response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Connection-level failure; transient.
    Network,
    /// Block URL/token no longer valid.
    Expired,
    /// HTTP 429-equivalent.
    RateLimited,
    NotFound,
    /// Destination name already taken (possibly by a draft).
    Conflict,
    /// Any other server-side failure.
    Server,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Network,
            message: message.into(),
        }
    }

    pub fn expired() -> Self {
        Self {
            kind: ApiErrorKind::Expired,
            message: "block url expired".into(),
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            kind: ApiErrorKind::RateLimited,
            message: "too many requests".into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Conflict,
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Server,
            message: format!("status {status}: {}", message.into()),
        }
    }

    /// Transient failures the block engine retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ApiErrorKind::Network | ApiErrorKind::Server)
    }
}

/// A freshly created file draft: the node plus its open revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDraft {
    pub link: LinkRef,
    pub revision_id: String,
}

/// Abstract remote storage API.
///
/// Implementations must not hold the borrowed arguments across the returned
/// future — clone what the request needs before going async.
pub trait StorageApi: Send + Sync {
    /// Lists content blocks of a revision starting at `from_index`.
    fn get_blocks(
        &self,
        link: &LinkRef,
        revision_id: &str,
        from_index: u32,
    ) -> ApiFuture<'_, BlockList>;

    /// Fetches one full block. Partial fetches are never resumed; a retried
    /// block is re-fetched from the start.
    fn download_block(&self, url: &str, token: &str) -> ApiFuture<'_, Vec<u8>>;

    /// Requests signed upload destinations for the given block hashes.
    fn request_upload(
        &self,
        link: &LinkRef,
        revision_id: &str,
        block_hashes: &[Vec<u8>],
    ) -> ApiFuture<'_, Vec<UploadSlot>>;

    /// Stores one block at a previously issued slot.
    fn upload_block(&self, slot: &UploadSlot, data: Vec<u8>) -> ApiFuture<'_, ()>;

    /// Creates a new file with an open draft revision.
    fn create_file(
        &self,
        share_id: &str,
        parent_id: &str,
        encrypted_name: &str,
        name_hash: &str,
    ) -> ApiFuture<'_, FileDraft>;

    /// Opens a new draft revision on an existing file.
    fn create_revision(&self, link: &LinkRef) -> ApiFuture<'_, String>;

    /// Commits a draft revision. Irreversible once issued.
    fn commit_revision(
        &self,
        link: &LinkRef,
        revision_id: &str,
        manifest_signature: &str,
    ) -> ApiFuture<'_, ()>;

    /// Abandons a draft revision.
    fn delete_revision(&self, link: &LinkRef, revision_id: &str) -> ApiFuture<'_, ()>;

    /// Lists the direct children of a folder.
    fn get_children(&self, link: &LinkRef) -> ApiFuture<'_, Vec<ChildLink>>;
}
