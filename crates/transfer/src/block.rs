//! Block fetch engine: bounded lookahead, retries, strict in-order delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use cumulus_protocol::{BlockRef, LinkRef};

use crate::api::{ApiErrorKind, StorageApi};
use crate::control::{ControlHandle, ControlWatcher};
use crate::crypto::block_digest;
use crate::retry::RetryConfig;
use crate::{MAX_BLOCK_RETRIES, MAX_BLOCKS_PER_TRANSFER, MAX_EXPIRY_REFRESHES, TransferError};

/// Fetches `blocks` from index `start_index` on and sends them to `out`
/// strictly in index order.
///
/// Fetches run with a lookahead of [`MAX_BLOCKS_PER_TRANSFER`] and may
/// complete out of order; delivery never does. Each block is verified
/// against its SHA-256 before it is surfaced. Per block: up to
/// [`MAX_BLOCK_RETRIES`] retries after the initial attempt for transient
/// failures, and up to [`MAX_EXPIRY_REFRESHES`] fresh-descriptor re-requests
/// when its URL expires. A rate-limit response fails fast and cancels the
/// sibling fetches of this batch.
pub async fn download_blocks(
    api: Arc<dyn StorageApi>,
    link: LinkRef,
    revision_id: String,
    blocks: Vec<BlockRef>,
    start_index: u32,
    retry: RetryConfig,
    control: &ControlHandle,
    out: mpsc::Sender<(u32, Vec<u8>)>,
) -> Result<(), TransferError> {
    let batch = control.token().child_token();
    let semaphore = Arc::new(Semaphore::new(MAX_BLOCKS_PER_TRANSFER));
    let pending: Vec<BlockRef> = blocks
        .into_iter()
        .filter(|b| b.index >= start_index)
        .collect();
    let total = pending.len();

    let (results_tx, mut results_rx) =
        mpsc::channel::<Result<(u32, Vec<u8>), TransferError>>(MAX_BLOCKS_PER_TRANSFER);
    for block in pending {
        tokio::spawn(fetch_one(
            Arc::clone(&api),
            link.clone(),
            revision_id.clone(),
            block,
            retry.clone(),
            batch.clone(),
            Arc::clone(&semaphore),
            control.watcher(),
            results_tx.clone(),
        ));
    }
    drop(results_tx);

    let mut stash: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut next = start_index;
    let mut received = 0;
    let mut failure: Option<TransferError> = None;

    while received < total {
        let Some(result) = results_rx.recv().await else {
            break;
        };
        received += 1;
        match result {
            Ok((index, data)) => {
                if failure.is_some() {
                    continue;
                }
                stash.insert(index, data);
                while let Some(data) = stash.remove(&next) {
                    if out.send((next, data)).await.is_err() {
                        // Consumer went away — treat like a cancel.
                        batch.cancel();
                        return Err(TransferError::Cancelled);
                    }
                    next += 1;
                }
            }
            Err(err) => {
                batch.cancel();
                // Keep the most meaningful error: the first non-cancel one.
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

#[allow(clippy::too_many_arguments)]
async fn fetch_one(
    api: Arc<dyn StorageApi>,
    link: LinkRef,
    revision_id: String,
    block: BlockRef,
    retry: RetryConfig,
    batch: tokio_util::sync::CancellationToken,
    semaphore: Arc<Semaphore>,
    watcher: ControlWatcher,
    results: mpsc::Sender<Result<(u32, Vec<u8>), TransferError>>,
) {
    let outcome = fetch_with_retries(api, link, revision_id, block, retry, &batch, semaphore, watcher).await;
    let _ = results.send(outcome).await;
}

#[allow(clippy::too_many_arguments)]
async fn fetch_with_retries(
    api: Arc<dyn StorageApi>,
    link: LinkRef,
    revision_id: String,
    mut block: BlockRef,
    retry: RetryConfig,
    batch: &tokio_util::sync::CancellationToken,
    semaphore: Arc<Semaphore>,
    mut watcher: ControlWatcher,
) -> Result<(u32, Vec<u8>), TransferError> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| TransferError::Cancelled)?;

    let index = block.index;
    let mut refreshes = 0u32;
    let mut attempt = 0u32;

    loop {
        watcher.wait_until_running().await?;
        if batch.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let fetched = tokio::select! {
            _ = batch.cancelled() => return Err(TransferError::Cancelled),
            result = api.download_block(&block.url, &block.token) => result,
        };

        match fetched {
            Ok(data) => {
                if !block.hash.is_empty() {
                    let digest = block_digest(&data);
                    if digest != block.hash {
                        warn!(
                            index,
                            expected = %hex::encode(&block.hash),
                            actual = %hex::encode(&digest),
                            "block hash mismatch"
                        );
                        return Err(TransferError::IntegrityMismatch { index });
                    }
                }
                return Ok((index, data));
            }
            Err(err) => match err.kind {
                ApiErrorKind::Expired => {
                    refreshes += 1;
                    if refreshes > MAX_EXPIRY_REFRESHES {
                        return Err(TransferError::BlockExpired);
                    }
                    debug!(index, refreshes, "block url expired, refreshing descriptor");
                    let fresh = tokio::select! {
                        _ = batch.cancelled() => return Err(TransferError::Cancelled),
                        result = api.get_blocks(&link, &revision_id, index) => result?,
                    };
                    let Some(replacement) = fresh.blocks.into_iter().find(|b| b.index == index)
                    else {
                        return Err(TransferError::BlockExpired);
                    };
                    block = replacement;
                    attempt = 0;
                }
                ApiErrorKind::RateLimited => {
                    warn!(index, "rate limited, aborting block batch");
                    batch.cancel();
                    return Err(TransferError::RateLimited);
                }
                _ if err.is_retryable() => {
                    attempt += 1;
                    if attempt > MAX_BLOCK_RETRIES {
                        return Err(err.into());
                    }
                    warn!(index, attempt, error = %err, "block fetch failed, retrying");
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                }
                _ => return Err(err.into()),
            },
        }
    }
}
