//! Bridges the discovered-children stream to running block downloads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cumulus_protocol::NestedChild;
use cumulus_transfer::{
    ControlHandle, DefaultIssuePolicy, DownloadRequest, FileDownloader, TransferEnv,
    TransferError, TransferEvent,
};

/// A node from the child stream, augmented with its running download.
///
/// Folder nodes pass through unchanged (`content` is `None`); file nodes
/// carry the ordered plaintext stream of their running download plus a
/// completion receiver that resolves with the download's final result.
pub struct StartedChild {
    pub node: NestedChild,
    pub content: Option<mpsc::Receiver<Vec<u8>>>,
    pub done: Option<oneshot::Receiver<Result<(), TransferError>>>,
}

/// Starts per-file downloads off the discovered-children stream.
///
/// Every file pulled from the input has its download started immediately and
/// is yielded together with its open byte stream. Before consuming the next
/// input item the iterator suspends while globally paused and stops at once
/// when cancelled. Per-file cancellation tokens are tracked so a global
/// pause/resume/cancel fans out to every active file.
///
/// The iterator imposes no concurrency bound of its own: true fan-out is
/// limited only by how eagerly the consumer drains the yielded streams.
/// Known limitation, kept deliberately — bounding it again is a product
/// decision.
pub struct LinkIterator {
    env: TransferEnv,
    control: ControlHandle,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl LinkIterator {
    /// Buffered plaintext blocks per running file download.
    const CONTENT_DEPTH: usize = 4;

    pub fn new(env: TransferEnv, control: ControlHandle) -> Self {
        Self {
            env,
            control,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Link ids of files whose downloads are currently running.
    pub fn active_links(&self) -> Vec<String> {
        self.active.lock().unwrap().keys().cloned().collect()
    }

    /// Consumes `children`, starting a download per file, and yields the
    /// augmented nodes in discovery order.
    pub fn iterate(
        self,
        mut children: mpsc::Receiver<NestedChild>,
        transfer_id: String,
        events: mpsc::Sender<TransferEvent>,
    ) -> mpsc::Receiver<StartedChild> {
        let (started_tx, started_rx) = mpsc::channel(Self::CONTENT_DEPTH);

        tokio::spawn(async move {
            let mut watcher = self.control.watcher();
            let cancel = self.control.token();
            loop {
                // Suspend before pulling the next item while paused; bail
                // out as soon as the transfer is cancelled.
                if watcher.wait_until_running().await.is_err() {
                    debug!(transfer = %transfer_id, "link iteration cancelled");
                    break;
                }

                let node = tokio::select! {
                    _ = cancel.cancelled() => break,
                    node = children.recv() => match node {
                        Some(node) => node,
                        None => break,
                    },
                };

                let started = if node.is_file {
                    let (content_tx, content_rx) = mpsc::channel(Self::CONTENT_DEPTH);
                    let (done_tx, done_rx) = oneshot::channel();

                    let request = DownloadRequest {
                        transfer_id: transfer_id.clone(),
                        link: node.link.clone(),
                        revision_id: node.revision_id.clone(),
                        name: node.name.clone(),
                        size: node.size,
                        parent_link_ids: node.parent_link_ids.clone(),
                        scan_flag: None,
                    };

                    let downloader =
                        FileDownloader::new(self.env.clone(), self.control.clone());
                    let file_token = self.control.token().child_token();
                    let link_id = node.link.link_id.clone();
                    self.active
                        .lock()
                        .unwrap()
                        .insert(link_id.clone(), file_token);

                    let active = Arc::clone(&self.active);
                    let events = events.clone();
                    tokio::spawn(async move {
                        let result = downloader
                            .run(&request, &DefaultIssuePolicy, &events, content_tx)
                            .await;
                        active.lock().unwrap().remove(&link_id);
                        if let Err(err) = &result
                            && !err.is_cancel()
                        {
                            warn!(link = %link_id, error = %err, "file download failed");
                        }
                        let _ = done_tx.send(result.map(|_| ()));
                    });

                    StartedChild {
                        node,
                        content: Some(content_rx),
                        done: Some(done_rx),
                    }
                } else {
                    StartedChild {
                        node,
                        content: None,
                        done: None,
                    }
                };

                if started_tx.send(started).await.is_err() {
                    // Consumer is gone; stop starting new downloads.
                    break;
                }
            }
        });

        started_rx
    }
}
