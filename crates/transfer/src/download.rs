//! Per-file download controller.
//!
//! Resolves keys, lists blocks, verifies the revision manifest, then streams
//! decrypted content in strict block order to the consumer. Wraps the block
//! engine with pause/cancel control, a stall watchdog, and automatic resume
//! after network outages.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use cumulus_protocol::{BlockRef, LinkRef, TransferState};

use crate::api::StorageApi;
use crate::block::download_blocks;
use crate::control::ControlHandle;
use crate::crypto::{CryptoProvider, CryptoWorker};
use crate::events::TransferEvent;
use crate::heartbeat::Heartbeat;
use crate::retry::RetryConfig;
use crate::{MAX_BLOCKS_PER_TRANSFER, STALL_TIMEOUT, TransferError};

/// Shared environment of the file transfer controllers.
#[derive(Clone)]
pub struct TransferEnv {
    pub api: Arc<dyn StorageApi>,
    pub provider: Arc<dyn CryptoProvider>,
    pub crypto: CryptoWorker,
    pub retry: RetryConfig,
    /// Online/offline signal; `true` while connected.
    pub connectivity: watch::Receiver<bool>,
}

impl TransferEnv {
    /// Builds an environment, spawning the crypto worker. The returned
    /// sender drives the connectivity signal.
    pub fn new(
        api: Arc<dyn StorageApi>,
        provider: Arc<dyn CryptoProvider>,
    ) -> (Self, watch::Sender<bool>) {
        let (online_tx, online_rx) = watch::channel(true);
        let crypto = CryptoWorker::spawn(Arc::clone(&provider));
        (
            Self {
                api,
                provider,
                crypto,
                retry: RetryConfig::default(),
                connectivity: online_rx,
            },
            online_tx,
        )
    }
}

/// One file to download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Transfer this file belongs to (one transfer may span many files).
    pub transfer_id: String,
    pub link: LinkRef,
    pub revision_id: String,
    pub name: String,
    pub size: u64,
    /// Ancestor link ids, for progress attribution.
    pub parent_link_ids: Vec<String>,
    /// Anti-virus flag carried on the node, if any.
    pub scan_flag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSummary {
    pub bytes_written: u64,
    pub blocks: u64,
}

/// Resolution for a signature or scan anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueDecision {
    Continue,
    Abort,
}

pub type DecisionFuture<'a> = Pin<Box<dyn Future<Output = IssueDecision> + Send + 'a>>;

/// Decides how to resolve integrity and scan anomalies. Implemented by the
/// application (usually by asking the user); resolution is a suspension
/// point.
pub trait IssueHandler: Send + Sync {
    fn on_signature_issue(&self, transfer_id: &str, detail: &str) -> DecisionFuture<'_>;
    fn on_scan_issue(&self, transfer_id: &str, detail: &str) -> DecisionFuture<'_>;
}

/// Continues on signature anomalies, aborts on scan flags.
pub struct DefaultIssuePolicy;

impl IssueHandler for DefaultIssuePolicy {
    fn on_signature_issue(&self, _transfer_id: &str, _detail: &str) -> DecisionFuture<'_> {
        Box::pin(async { IssueDecision::Continue })
    }

    fn on_scan_issue(&self, _transfer_id: &str, _detail: &str) -> DecisionFuture<'_> {
        Box::pin(async { IssueDecision::Abort })
    }
}

/// Drives one file's download pipeline.
pub struct FileDownloader {
    env: TransferEnv,
    control: ControlHandle,
}

impl FileDownloader {
    pub fn new(env: TransferEnv, control: ControlHandle) -> Self {
        Self { env, control }
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Runs the download, sending decrypted content to `out` in order.
    ///
    /// The returned future rejects with [`TransferError::Cancelled`] on a
    /// user cancel and [`TransferError::Stalled`] when the watchdog fired,
    /// so callers can branch without inspecting messages. Terminal state
    /// changes are emitted on `events` before returning.
    pub async fn run(
        &self,
        request: &DownloadRequest,
        issues: &dyn IssueHandler,
        events: &mpsc::Sender<TransferEvent>,
        out: mpsc::Sender<Vec<u8>>,
    ) -> Result<DownloadSummary, TransferError> {
        let heartbeat = Heartbeat::start(STALL_TIMEOUT, self.control.clone());
        let result = self
            .run_inner(request, issues, events, out, &heartbeat)
            .await;

        // A watchdog firing surfaces as a cancel; report it as a stall.
        let result = match result {
            Err(err) if err.is_cancel() && heartbeat.is_stalled() => Err(TransferError::Stalled),
            other => other,
        };

        let terminal = match &result {
            Ok(summary) => {
                info!(
                    transfer = %request.transfer_id,
                    bytes = summary.bytes_written,
                    blocks = summary.blocks,
                    "download complete"
                );
                (TransferState::Done, None)
            }
            Err(TransferError::Skipped) => (TransferState::Skipped, None),
            Err(err) if err.is_cancel() => (TransferState::Canceled, None),
            Err(err) => {
                warn!(transfer = %request.transfer_id, error = %err, "download failed");
                (TransferState::Error, Some(err.to_string()))
            }
        };
        self.emit_state(events, &request.transfer_id, terminal.0, terminal.1)
            .await;
        result
    }

    async fn run_inner(
        &self,
        request: &DownloadRequest,
        issues: &dyn IssueHandler,
        events: &mpsc::Sender<TransferEvent>,
        out: mpsc::Sender<Vec<u8>>,
        heartbeat: &Heartbeat,
    ) -> Result<DownloadSummary, TransferError> {
        let mut watcher = self.control.watcher();
        watcher.wait_until_running().await?;

        self.emit_state(events, &request.transfer_id, TransferState::Progress, None)
            .await;

        // A scan flag on the node needs a decision before any bytes move.
        if let Some(flag) = &request.scan_flag {
            self.emit_state(events, &request.transfer_id, TransferState::ScanIssue, None)
                .await;
            heartbeat.pause();
            let decision = issues.on_scan_issue(&request.transfer_id, flag).await;
            heartbeat.resume();
            match decision {
                IssueDecision::Continue => {
                    self.emit_state(events, &request.transfer_id, TransferState::Progress, None)
                        .await;
                }
                IssueDecision::Abort => return Err(TransferError::Cancelled),
            }
        }

        let session_key = self.env.provider.session_key(&request.link)?;
        let (blocks, manifest_signature) = self.list_blocks(request, heartbeat).await?;

        if !manifest_signature.is_empty() {
            let hashes: Vec<Vec<u8>> = blocks.iter().map(|b| b.hash.clone()).collect();
            if let Err(err) =
                self.env
                    .provider
                    .verify_manifest(&request.link, &manifest_signature, &hashes)
            {
                warn!(
                    transfer = %request.transfer_id,
                    error = %err,
                    "manifest signature verification failed"
                );
                self.emit_state(
                    events,
                    &request.transfer_id,
                    TransferState::SignatureIssue,
                    Some(err.to_string()),
                )
                .await;
                heartbeat.pause();
                let decision = issues
                    .on_signature_issue(&request.transfer_id, &err.0)
                    .await;
                heartbeat.resume();
                match decision {
                    IssueDecision::Continue => {
                        self.emit_state(
                            events,
                            &request.transfer_id,
                            TransferState::Progress,
                            None,
                        )
                        .await;
                    }
                    IssueDecision::Abort => return Err(TransferError::Cancelled),
                }
            }
        }

        let link_ids = {
            let mut ids = request.parent_link_ids.clone();
            ids.push(request.link.link_id.clone());
            ids
        };

        let mut next_index = 0u32;
        let mut written = 0u64;
        let mut blocks_done = 0u64;

        loop {
            watcher.wait_until_running().await?;

            let (blocks_tx, mut blocks_rx) = mpsc::channel(MAX_BLOCKS_PER_TRANSFER);
            let pipeline = {
                let api = Arc::clone(&self.env.api);
                let link = request.link.clone();
                let revision_id = request.revision_id.clone();
                let blocks = blocks.clone();
                let retry = self.env.retry.clone();
                let control = self.control.clone();
                tokio::spawn(async move {
                    download_blocks(
                        api,
                        link,
                        revision_id,
                        blocks,
                        next_index,
                        retry,
                        &control,
                        blocks_tx,
                    )
                    .await
                })
            };

            while let Some((index, ciphertext)) = blocks_rx.recv().await {
                heartbeat.beat();
                let plaintext = self
                    .env
                    .crypto
                    .decrypt_block(&session_key, ciphertext)
                    .await?;
                written += plaintext.len() as u64;
                blocks_done += 1;
                next_index = index + 1;

                let bytes = plaintext.len() as u64;
                if out.send(plaintext).await.is_err() {
                    return Err(TransferError::Cancelled);
                }
                let _ = events
                    .send(TransferEvent::Progress {
                        transfer_id: request.transfer_id.clone(),
                        link_ids: link_ids.clone(),
                        bytes,
                    })
                    .await;
            }

            match pipeline.await {
                Ok(Ok(())) => break,
                Ok(Err(TransferError::Network(message))) => {
                    warn!(
                        transfer = %request.transfer_id,
                        error = %message,
                        "network error, waiting for connectivity"
                    );
                    self.emit_state(
                        events,
                        &request.transfer_id,
                        TransferState::NetworkError,
                        Some(message),
                    )
                    .await;
                    heartbeat.pause();
                    self.wait_for_connectivity().await?;
                    heartbeat.resume();
                    debug!(transfer = %request.transfer_id, "connectivity restored, resuming");
                    self.emit_state(events, &request.transfer_id, TransferState::Progress, None)
                        .await;
                }
                Ok(Err(err)) => return Err(err),
                Err(join) => {
                    return Err(TransferError::Fatal(format!("block pipeline died: {join}")));
                }
            }
        }

        self.emit_state(
            events,
            &request.transfer_id,
            TransferState::Finalizing,
            None,
        )
        .await;

        Ok(DownloadSummary {
            bytes_written: written,
            blocks: blocks_done,
        })
    }

    async fn list_blocks(
        &self,
        request: &DownloadRequest,
        heartbeat: &Heartbeat,
    ) -> Result<(Vec<BlockRef>, String), TransferError> {
        let mut blocks = Vec::new();
        let mut manifest_signature = String::new();
        let mut from_index = 0u32;
        loop {
            if self.control.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let page = self
                .env
                .api
                .get_blocks(&request.link, &request.revision_id, from_index)
                .await?;
            heartbeat.beat();
            if !page.manifest_signature.is_empty() {
                manifest_signature = page.manifest_signature;
            }
            blocks.extend(page.blocks);
            if !page.has_more {
                break;
            }
            from_index = blocks.last().map(|b: &BlockRef| b.index + 1).unwrap_or(0);
        }
        blocks.sort_by_key(|b| b.index);
        Ok((blocks, manifest_signature))
    }

    async fn wait_for_connectivity(&self) -> Result<(), TransferError> {
        let mut online = self.env.connectivity.clone();
        let cancel = self.control.token();
        loop {
            if *online.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                changed = online.changed() => {
                    changed.map_err(|_| {
                        TransferError::Network("connectivity watcher closed".into())
                    })?;
                }
            }
        }
    }

    async fn emit_state(
        &self,
        events: &mpsc::Sender<TransferEvent>,
        transfer_id: &str,
        state: TransferState,
        error: Option<String>,
    ) {
        let _ = events
            .send(TransferEvent::StateChanged {
                transfer_id: transfer_id.to_string(),
                state,
                error,
            })
            .await;
    }
}
