//! Tar serialization of a started-children stream.

use std::io::Write;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cumulus_transfer::TransferError;
use cumulus_tree::StartedChild;

use crate::validation::validate_entry_path;

const TAR_BLOCK_SIZE: usize = 512;
const TAR_END_BLOCKS: [u8; TAR_BLOCK_SIZE * 2] = [0; TAR_BLOCK_SIZE * 2];
const TAR_PAD_BLOCK: [u8; TAR_BLOCK_SIZE] = [0; TAR_BLOCK_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveSummary {
    /// Payload bytes written (headers and padding excluded).
    pub content_bytes: u64,
    pub files: u64,
    pub folders: u64,
}

/// Serializes discovered nodes and their content streams into one tar
/// stream.
///
/// Headers are emitted before content, which requires every file's size to
/// be known from its node metadata — a stream shorter or longer than
/// announced fails the archive rather than corrupting it.
pub struct ArchiveGenerator {
    cancel: CancellationToken,
}

impl ArchiveGenerator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Drains `entries` into `out`. Cancellation aborts mid-stream with
    /// [`TransferError::Cancelled`]; the partial archive is the caller's to
    /// discard.
    pub async fn write<W: Write>(
        &self,
        mut entries: tokio::sync::mpsc::Receiver<StartedChild>,
        out: &mut W,
    ) -> Result<ArchiveSummary, TransferError> {
        let mut summary = ArchiveSummary::default();

        loop {
            let entry = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                entry = entries.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };

            let path = entry.node.archive_path();
            validate_entry_path(&path)?;

            if entry.node.is_file {
                let written = self.write_file(entry, &path, out).await?;
                summary.files += 1;
                summary.content_bytes += written;
            } else {
                write_dir_header(&path, out)?;
                summary.folders += 1;
            }
        }

        out.write_all(&TAR_END_BLOCKS)?;
        out.flush()?;
        debug!(
            files = summary.files,
            folders = summary.folders,
            bytes = summary.content_bytes,
            "archive complete"
        );
        Ok(summary)
    }

    async fn write_file<W: Write>(
        &self,
        entry: StartedChild,
        path: &str,
        out: &mut W,
    ) -> Result<u64, TransferError> {
        let expected = entry.node.size;
        write_file_header(path, expected, out)?;

        let mut written = 0u64;
        if let Some(mut content) = entry.content {
            loop {
                let chunk = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                    chunk = content.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                out.write_all(&chunk)?;
                written += chunk.len() as u64;
            }
        }

        // The content stream closing early usually means the download died;
        // surface its error rather than a generic size mismatch.
        if let Some(done) = entry.done {
            match done.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    return Err(TransferError::Fatal(
                        "file download dropped without a result".into(),
                    ));
                }
            }
        }

        if written != expected {
            warn!(path, expected, written, "archive entry size mismatch");
            return Err(TransferError::Validation(format!(
                "entry {path}: expected {expected} bytes, streamed {written}"
            )));
        }

        let padding = (TAR_BLOCK_SIZE - (written as usize % TAR_BLOCK_SIZE)) % TAR_BLOCK_SIZE;
        if padding > 0 {
            out.write_all(&TAR_PAD_BLOCK[..padding])?;
        }
        Ok(written)
    }
}

fn write_file_header<W: Write>(path: &str, size: u64, out: &mut W) -> Result<(), TransferError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header
        .set_path(path)
        .map_err(|err| TransferError::Validation(format!("entry path {path}: {err}")))?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    out.write_all(header.as_bytes())?;
    Ok(())
}

fn write_dir_header<W: Write>(path: &str, out: &mut W) -> Result<(), TransferError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    let dir_path = format!("{path}/");
    header
        .set_path(&dir_path)
        .map_err(|err| TransferError::Validation(format!("entry path {dir_path}: {err}")))?;
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    header.set_cksum();
    out.write_all(header.as_bytes())?;
    Ok(())
}
