//! Per-file upload controller.
//!
//! Structurally the mirror of the download side: open a draft revision,
//! seal content into blocks on the crypto worker, request signed slots for
//! the block hashes, store the blocks with retry, then commit. The commit is
//! idempotent — a remote commit cannot be aborted once issued, so it runs at
//! most once per controller.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Semaphore, mpsc};
use tracing::{info, warn};

use cumulus_protocol::{BLOCK_SIZE, LinkRef, TransferState, UploadSlot};

use crate::api::{ApiErrorKind, FileDraft};
use crate::control::ControlHandle;
use crate::crypto::SealedBlock;
use crate::download::TransferEnv;
use crate::events::TransferEvent;
use crate::heartbeat::Heartbeat;
use crate::{MAX_BLOCK_RETRIES, MAX_BLOCKS_PER_TRANSFER, STALL_TIMEOUT, TransferError};

/// One file to upload. Content is already in memory — picking files streams
/// them into the page before the transfer is admitted.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub transfer_id: String,
    pub share_id: String,
    /// Destination folder.
    pub parent: LinkRef,
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    /// Existing file to add a revision to instead of creating a new node
    /// (conflict resolution chose "replace").
    pub overwrite: Option<LinkRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadSummary {
    pub link: LinkRef,
    pub revision_id: String,
    pub blocks: u64,
}

/// Drives one file's upload pipeline.
pub struct FileUploader {
    env: TransferEnv,
    control: ControlHandle,
    committed: AtomicBool,
}

impl FileUploader {
    pub fn new(env: TransferEnv, control: ControlHandle) -> Self {
        Self {
            env,
            control,
            committed: AtomicBool::new(false),
        }
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Runs the upload. Rejects with [`TransferError::Conflict`] when the
    /// destination name is taken and no overwrite target was given; the
    /// caller resolves and retries with `overwrite` set.
    pub async fn run(
        &self,
        request: &UploadRequest,
        events: &mpsc::Sender<TransferEvent>,
    ) -> Result<UploadSummary, TransferError> {
        let heartbeat = Heartbeat::start(STALL_TIMEOUT, self.control.clone());
        let result = self.run_inner(request, events, &heartbeat).await;

        let result = match result {
            Err(err) if err.is_cancel() && heartbeat.is_stalled() => Err(TransferError::Stalled),
            other => other,
        };

        let terminal = match &result {
            Ok(summary) => {
                info!(
                    transfer = %request.transfer_id,
                    link = %summary.link.link_id,
                    blocks = summary.blocks,
                    "upload complete"
                );
                (TransferState::Done, None)
            }
            Err(TransferError::Conflict(name)) => {
                (TransferState::Conflict, Some(name.clone()))
            }
            Err(TransferError::Skipped) => (TransferState::Skipped, None),
            Err(err) if err.is_cancel() => (TransferState::Canceled, None),
            Err(err) => {
                warn!(transfer = %request.transfer_id, error = %err, "upload failed");
                (TransferState::Error, Some(err.to_string()))
            }
        };
        let _ = events
            .send(TransferEvent::StateChanged {
                transfer_id: request.transfer_id.clone(),
                state: terminal.0,
                error: terminal.1,
            })
            .await;
        result
    }

    async fn run_inner(
        &self,
        request: &UploadRequest,
        events: &mpsc::Sender<TransferEvent>,
        heartbeat: &Heartbeat,
    ) -> Result<UploadSummary, TransferError> {
        let mut watcher = self.control.watcher();
        watcher.wait_until_running().await?;

        let _ = events
            .send(TransferEvent::StateChanged {
                transfer_id: request.transfer_id.clone(),
                state: TransferState::Progress,
                error: None,
            })
            .await;

        let draft = self.open_draft(request).await?;
        heartbeat.beat();

        let session_key = self.env.provider.session_key(&draft.link)?;

        // Seal content into blocks on the crypto worker.
        let mut sealed: Vec<SealedBlock> = Vec::new();
        for chunk in request.data.chunks(BLOCK_SIZE as usize) {
            watcher.wait_until_running().await?;
            let block = self
                .env
                .crypto
                .seal_block(&session_key, chunk.to_vec())
                .await?;
            heartbeat.beat();
            sealed.push(block);
        }

        let hashes: Vec<Vec<u8>> = sealed.iter().map(|b| b.hash.clone()).collect();
        let slots = self
            .env
            .api
            .request_upload(&draft.link, &draft.revision_id, &hashes)
            .await?;
        heartbeat.beat();
        if slots.len() != sealed.len() {
            return Err(TransferError::Validation(format!(
                "requested {} upload slots, got {}",
                sealed.len(),
                slots.len()
            )));
        }

        // Store blocks; on a network outage, wait for connectivity and retry
        // whatever has not landed yet.
        let total_blocks = sealed.len() as u64;
        let mut stored: HashSet<u32> = HashSet::new();
        loop {
            watcher.wait_until_running().await?;
            match self
                .store_blocks(request, &sealed, &slots, &mut stored, events, heartbeat)
                .await
            {
                Ok(()) => break,
                Err(TransferError::Network(message)) => {
                    warn!(
                        transfer = %request.transfer_id,
                        error = %message,
                        "network error, waiting for connectivity"
                    );
                    let _ = events
                        .send(TransferEvent::StateChanged {
                            transfer_id: request.transfer_id.clone(),
                            state: TransferState::NetworkError,
                            error: Some(message),
                        })
                        .await;
                    heartbeat.pause();
                    self.wait_for_connectivity().await?;
                    heartbeat.resume();
                    let _ = events
                        .send(TransferEvent::StateChanged {
                            transfer_id: request.transfer_id.clone(),
                            state: TransferState::Progress,
                            error: None,
                        })
                        .await;
                }
                Err(err) => return Err(err),
            }
        }

        let _ = events
            .send(TransferEvent::StateChanged {
                transfer_id: request.transfer_id.clone(),
                state: TransferState::Finalizing,
                error: None,
            })
            .await;
        self.finalize(&draft).await?;

        Ok(UploadSummary {
            link: draft.link,
            revision_id: draft.revision_id,
            blocks: total_blocks,
        })
    }

    async fn open_draft(&self, request: &UploadRequest) -> Result<FileDraft, TransferError> {
        if let Some(link) = &request.overwrite {
            let revision_id = self.env.api.create_revision(link).await?;
            return Ok(FileDraft {
                link: link.clone(),
                revision_id,
            });
        }

        let encrypted_name = self
            .env
            .provider
            .encrypt_name(&request.parent, &request.name)?;
        let name_hash = self
            .env
            .provider
            .lookup_hash(&request.parent, &request.name)?;
        match self
            .env
            .api
            .create_file(
                &request.share_id,
                &request.parent.link_id,
                &encrypted_name,
                &name_hash,
            )
            .await
        {
            Ok(draft) => Ok(draft),
            Err(err) if err.kind == ApiErrorKind::Conflict => {
                Err(TransferError::Conflict(request.name.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn store_blocks(
        &self,
        request: &UploadRequest,
        sealed: &[SealedBlock],
        slots: &[UploadSlot],
        stored: &mut HashSet<u32>,
        events: &mpsc::Sender<TransferEvent>,
        heartbeat: &Heartbeat,
    ) -> Result<(), TransferError> {
        let batch = self.control.token().child_token();
        let semaphore = Arc::new(Semaphore::new(MAX_BLOCKS_PER_TRANSFER));
        let (results_tx, mut results_rx) =
            mpsc::channel::<Result<(u32, u64), TransferError>>(MAX_BLOCKS_PER_TRANSFER);

        let mut spawned = 0usize;
        for (i, (block, slot)) in sealed.iter().zip(slots).enumerate() {
            if stored.contains(&slot.index) {
                continue;
            }
            spawned += 1;
            let api = Arc::clone(&self.env.api);
            let slot = slot.clone();
            let data = block.ciphertext.clone();
            // Only the last block can hold a short plaintext chunk.
            let offset = i * BLOCK_SIZE as usize;
            let plaintext_len = (request.data.len() - offset).min(BLOCK_SIZE as usize) as u64;
            let retry = self.env.retry.clone();
            let batch = batch.clone();
            let semaphore = Arc::clone(&semaphore);
            let mut watcher = self.control.watcher();
            let results = results_tx.clone();
            tokio::spawn(async move {
                let outcome = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| TransferError::Cancelled)?;
                    let mut attempt = 0u32;
                    loop {
                        watcher.wait_until_running().await?;
                        if batch.is_cancelled() {
                            return Err(TransferError::Cancelled);
                        }
                        let result = tokio::select! {
                            _ = batch.cancelled() => return Err(TransferError::Cancelled),
                            result = api.upload_block(&slot, data.clone()) => result,
                        };
                        match result {
                            Ok(()) => return Ok((slot.index, plaintext_len)),
                            Err(err) if err.kind == ApiErrorKind::RateLimited => {
                                warn!(index = slot.index, "rate limited, aborting block batch");
                                batch.cancel();
                                return Err(TransferError::RateLimited);
                            }
                            Err(err) if err.is_retryable() => {
                                attempt += 1;
                                if attempt > MAX_BLOCK_RETRIES {
                                    return Err(err.into());
                                }
                                warn!(
                                    index = slot.index,
                                    attempt,
                                    error = %err,
                                    "block store failed, retrying"
                                );
                                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
                .await;
                let _ = results.send(outcome).await;
            });
        }
        drop(results_tx);

        let mut failure: Option<TransferError> = None;
        let mut received = 0usize;
        while received < spawned {
            let Some(result) = results_rx.recv().await else {
                break;
            };
            received += 1;
            match result {
                Ok((index, bytes)) => {
                    stored.insert(index);
                    heartbeat.beat();
                    let _ = events
                        .send(TransferEvent::Progress {
                            transfer_id: request.transfer_id.clone(),
                            link_ids: vec![request.parent.link_id.clone()],
                            bytes,
                        })
                        .await;
                }
                Err(err) => {
                    batch.cancel();
                    match &failure {
                        None => failure = Some(err),
                        Some(existing) if existing.is_cancel() && !err.is_cancel() => {
                            failure = Some(err);
                        }
                        _ => {}
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Commits the draft revision, at most once. A repeat call is a no-op
    /// because the remote commit cannot be rolled back once issued.
    async fn finalize(&self, draft: &FileDraft) -> Result<(), TransferError> {
        if self.committed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.env
            .api
            .commit_revision(&draft.link, &draft.revision_id, "")
            .await?;
        Ok(())
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
}
