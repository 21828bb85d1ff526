//! Recursive folder enumeration.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cumulus_protocol::{LinkKind, LinkRef, NestedChild};
use cumulus_transfer::{StorageApi, TransferError};

/// Result of a complete folder traversal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FolderScan {
    /// Sum of all descendant file sizes.
    pub total_size: u64,
    /// Aggregated size per link id — files map to their own size, folders
    /// to their subtree total.
    pub size_by_link: HashMap<String, u64>,
}

/// Observer hooks invoked during traversal. All optional.
#[derive(Default)]
pub struct TreeCallbacks {
    /// A child's signature failed verification upstream.
    pub on_signature_issue: Option<Arc<dyn Fn(&LinkRef, &str) + Send + Sync>>,
    /// A live document was encountered; it is excluded from the transfer.
    pub on_contains_document: Option<Arc<dyn Fn(&LinkRef, &str) + Send + Sync>>,
    /// Bytes of content discovered so far.
    pub on_progress: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    /// A subtree degraded (e.g. concurrently deleted) and was skipped.
    pub on_error: Option<Arc<dyn Fn(&LinkRef, &TransferError) + Send + Sync>>,
}

/// Enumerates a folder's full descendant set without blocking consumers.
///
/// Construction hands back the live child stream. [`load`] drives the
/// traversal to completion and resolves with the aggregate sizes; nodes
/// become available on the stream as soon as they are discovered, well
/// before `load` resolves.
///
/// [`load`]: FolderTreeLoader::load
pub struct FolderTreeLoader {
    api: Arc<dyn StorageApi>,
    cancel: CancellationToken,
    children_tx: mpsc::Sender<NestedChild>,
}

impl FolderTreeLoader {
    /// Channel capacity for discovered children. Listing runs ahead of
    /// consumers by at most this many nodes.
    const CHILD_STREAM_DEPTH: usize = 64;

    pub fn new(
        api: Arc<dyn StorageApi>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<NestedChild>) {
        let (children_tx, children_rx) = mpsc::channel(Self::CHILD_STREAM_DEPTH);
        (
            Self {
                api,
                cancel,
                children_tx,
            },
            children_rx,
        )
    }

    /// Walks the subtree under `root` depth-first and returns once the whole
    /// subtree is enumerated.
    ///
    /// Within each folder, the folder's entry is streamed before any of its
    /// descendants. A vanished subtree (concurrent deletion) is reported via
    /// `callbacks.on_error` and skipped rather than failing the traversal;
    /// cancellation aborts with [`TransferError::Cancelled`].
    pub async fn load(
        &self,
        root: &LinkRef,
        root_name: &str,
        callbacks: &TreeCallbacks,
    ) -> Result<FolderScan, TransferError> {
        let mut scan = FolderScan::default();
        let root_size = self
            .walk(
                root.clone(),
                vec![root.link_id.clone()],
                vec![root_name.to_string()],
                callbacks,
                &mut scan,
            )
            .await?;
        scan.size_by_link.insert(root.link_id.clone(), root_size);
        scan.total_size = root_size;
        debug!(
            root = %root.link_id,
            total_size = scan.total_size,
            nodes = scan.size_by_link.len(),
            "folder traversal complete"
        );
        Ok(scan)
    }

    /// Boxed recursion: the async walk calls itself per subfolder.
    fn walk<'a>(
        &'a self,
        folder: LinkRef,
        parent_link_ids: Vec<String>,
        parent_path: Vec<String>,
        callbacks: &'a TreeCallbacks,
        scan: &'a mut FolderScan,
    ) -> Pin<Box<dyn Future<Output = Result<u64, TransferError>> + Send + 'a>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let children = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                result = self.api.get_children(&folder) => result,
            };
            let children = match children {
                Ok(children) => children,
                Err(err) => {
                    let err: TransferError = err.into();
                    if let TransferError::NotFound(_) = &err {
                        // Concurrently deleted — degrade, don't crash the
                        // traversal.
                        warn!(folder = %folder.link_id, "folder vanished during traversal");
                        if let Some(on_error) = &callbacks.on_error {
                            on_error(&folder, &err);
                        }
                        return Ok(0);
                    }
                    return Err(err);
                }
            };

            let mut subtree_size = 0u64;
            for child in children {
                if self.cancel.is_cancelled() {
                    return Err(TransferError::Cancelled);
                }

                if let Some(issue) = &child.signature_issue
                    && let Some(on_signature_issue) = &callbacks.on_signature_issue
                {
                    on_signature_issue(&child.link, issue);
                }

                match child.kind {
                    LinkKind::Document => {
                        debug!(link = %child.link.link_id, "excluding live document");
                        if let Some(on_contains_document) = &callbacks.on_contains_document {
                            on_contains_document(&child.link, &child.name);
                        }
                    }
                    LinkKind::File => {
                        let node = NestedChild {
                            link: child.link.clone(),
                            name: child.name.clone(),
                            is_file: true,
                            size: child.size,
                            revision_id: child.revision_id.clone(),
                            parent_link_ids: parent_link_ids.clone(),
                            parent_path: parent_path.clone(),
                        };
                        self.emit(node).await?;
                        scan.size_by_link
                            .insert(child.link.link_id.clone(), child.size);
                        subtree_size += child.size;
                        if let Some(on_progress) = &callbacks.on_progress {
                            on_progress(child.size);
                        }
                    }
                    LinkKind::Folder => {
                        // Parent entry goes out before anything below it.
                        let node = NestedChild {
                            link: child.link.clone(),
                            name: child.name.clone(),
                            is_file: false,
                            size: 0,
                            revision_id: String::new(),
                            parent_link_ids: parent_link_ids.clone(),
                            parent_path: parent_path.clone(),
                        };
                        self.emit(node).await?;

                        let mut child_ids = parent_link_ids.clone();
                        child_ids.push(child.link.link_id.clone());
                        let mut child_path = parent_path.clone();
                        child_path.push(child.name.clone());

                        let folder_size = self
                            .walk(child.link.clone(), child_ids, child_path, callbacks, scan)
                            .await?;
                        scan.size_by_link
                            .insert(child.link.link_id.clone(), folder_size);
                        subtree_size += folder_size;
                    }
                }
            }

            Ok(subtree_size)
        })
    }

    async fn emit(&self, node: NestedChild) -> Result<(), TransferError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            sent = self.children_tx.send(node) => {
                // A dropped receiver means nobody wants the stream (size-only
                // scan); keep walking.
                let _ = sent;
                Ok(())
            }
        }
    }
}
