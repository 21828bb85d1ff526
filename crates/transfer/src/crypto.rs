//! Crypto collaborator and the block-crypto worker.
//!
//! `CryptoProvider` is the application's cryptography: key resolution, name
//! encryption, block transforms, signature verification. The pipeline never
//! calls block transforms directly — CPU-heavy work runs on one dedicated
//! worker task, and the pipeline exchanges owned buffers with it over typed
//! request/response messages only. That keeps the boundary portable to a
//! real thread or process.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use cumulus_protocol::LinkRef;

use crate::TransferError;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct CryptoError(pub String);

/// Application-provided cryptography. Synchronous; errors on failure.
pub trait CryptoProvider: Send + Sync {
    /// Resolves the content session key of a node.
    fn session_key(&self, link: &LinkRef) -> Result<Vec<u8>, CryptoError>;

    /// Encrypts a name under its parent folder's key.
    fn encrypt_name(&self, parent: &LinkRef, name: &str) -> Result<String, CryptoError>;

    /// Deterministic lookup hash of a name, for server-side duplicate checks.
    fn lookup_hash(&self, parent: &LinkRef, name: &str) -> Result<String, CryptoError>;

    fn decrypt_block(&self, session_key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn encrypt_block(&self, session_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verifies the revision manifest signature against the block hashes.
    fn verify_manifest(
        &self,
        link: &LinkRef,
        manifest_signature: &str,
        block_hashes: &[Vec<u8>],
    ) -> Result<(), CryptoError>;
}

/// SHA-256 of a block's ciphertext — the integrity identity of a block.
pub fn block_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// An encrypted block ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedBlock {
    pub ciphertext: Vec<u8>,
    pub hash: Vec<u8>,
}

enum CryptoJob {
    Decrypt {
        session_key: Vec<u8>,
        ciphertext: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, CryptoError>>,
    },
    Seal {
        session_key: Vec<u8>,
        plaintext: Vec<u8>,
        reply: oneshot::Sender<Result<SealedBlock, CryptoError>>,
    },
}

/// Handle to the block-crypto worker task.
///
/// Cloning shares the same worker. The task exits when the last handle is
/// dropped.
#[derive(Clone)]
pub struct CryptoWorker {
    jobs: mpsc::Sender<CryptoJob>,
}

impl CryptoWorker {
    pub fn spawn(provider: Arc<dyn CryptoProvider>) -> Self {
        let (jobs_tx, mut jobs_rx) = mpsc::channel::<CryptoJob>(16);
        tokio::spawn(async move {
            while let Some(job) = jobs_rx.recv().await {
                match job {
                    CryptoJob::Decrypt {
                        session_key,
                        ciphertext,
                        reply,
                    } => {
                        let _ = reply.send(provider.decrypt_block(&session_key, &ciphertext));
                    }
                    CryptoJob::Seal {
                        session_key,
                        plaintext,
                        reply,
                    } => {
                        let result =
                            provider
                                .encrypt_block(&session_key, &plaintext)
                                .map(|ciphertext| {
                                    let hash = block_digest(&ciphertext);
                                    SealedBlock { ciphertext, hash }
                                });
                        let _ = reply.send(result);
                    }
                }
            }
            debug!("crypto worker stopped");
        });
        Self { jobs: jobs_tx }
    }

    pub async fn decrypt_block(
        &self,
        session_key: &[u8],
        ciphertext: Vec<u8>,
    ) -> Result<Vec<u8>, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(CryptoJob::Decrypt {
                session_key: session_key.to_vec(),
                ciphertext,
                reply,
            })
            .await
            .map_err(|_| TransferError::Fatal("crypto worker gone".into()))?;
        let result = rx
            .await
            .map_err(|_| TransferError::Fatal("crypto worker dropped reply".into()))?;
        Ok(result?)
    }

    /// Encrypts one plaintext block and hashes the ciphertext.
    pub async fn seal_block(
        &self,
        session_key: &[u8],
        plaintext: Vec<u8>,
    ) -> Result<SealedBlock, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(CryptoJob::Seal {
                session_key: session_key.to_vec(),
                plaintext,
                reply,
            })
            .await
            .map_err(|_| TransferError::Fatal("crypto worker gone".into()))?;
        let result = rx
            .await
            .map_err(|_| TransferError::Fatal("crypto worker dropped reply".into()))?;
        Ok(result?)
    }
}
