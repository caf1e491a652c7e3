//! Chunked-upload session table. Each session buffers the bytes PATCHed to
//! it so far and hashes them incrementally; `finalize` checks the caller's
//! declared digest, writes to the blob store on a match, and either way the
//! session is gone afterward — callers never resume a finalized id.
//!
//! Sessions idle out after an hour via the cache's time-to-idle policy. A
//! process restart drops them outright: clients retry the whole upload,
//! which the OCI push protocol already assumes can happen.

use std::sync::Arc;
use std::time::Duration;

use ocireg_core::{Digest, DigestHasher};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::blobstore::BlobStore;

const IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no upload session for {0}")]
    NoSession(Uuid),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },
    #[error(transparent)]
    Store(#[from] crate::blobstore::Error),
}

struct Session {
    #[allow(dead_code)]
    image: String,
    buffer: Vec<u8>,
    hasher: DigestHasher,
}

pub struct UploadTable {
    sessions: moka::future::Cache<Uuid, Arc<Mutex<Session>>>,
    store: Arc<BlobStore>,
}

impl UploadTable {
    pub fn new(store: Arc<BlobStore>) -> Self {
        let sessions = moka::future::Cache::builder()
            .time_to_idle(IDLE_TIMEOUT)
            .build();
        Self { sessions, store }
    }

    pub async fn start(&self, image: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        let session = Session {
            image: image.into(),
            buffer: Vec::new(),
            hasher: DigestHasher::new(),
        };
        self.sessions.insert(id, Arc::new(Mutex::new(session))).await;
        id
    }

    /// Appends `bytes` to the session's buffer and returns the total size
    /// accumulated so far (for the response's `Range` header).
    pub async fn append(&self, id: Uuid, bytes: &[u8]) -> Result<u64, Error> {
        let session = self.sessions.get(&id).await.ok_or(Error::NoSession(id))?;
        let mut session = session.lock().await;
        session.buffer.extend_from_slice(bytes);
        session.hasher.update(bytes);
        Ok(session.buffer.len() as u64)
    }

    /// Concatenates the session's chunks, checks `expected` if supplied, and
    /// on a match writes the bytes to the blob store and drops the session.
    /// On a mismatch the session is left intact so the client can retry the
    /// same upload id with a corrected digest query.
    pub async fn finalize(
        &self,
        id: Uuid,
        expected: Option<&Digest>,
    ) -> Result<Digest, Error> {
        let session = self
            .sessions
            .get(&id)
            .await
            .ok_or(Error::NoSession(id))?;
        let mut guard = session.lock().await;
        let hasher = std::mem::replace(&mut guard.hasher, DigestHasher::new());

        let actual = match expected {
            None => hasher.finalize(),
            Some(expected) if hasher.finalize_and_matches(expected) => expected.clone(),
            Some(expected) => {
                // the hasher is already consumed by the failed comparison;
                // recompute from the buffer for the mismatch message and so
                // further PATCH/PUT retries on this session still work
                let actual = Digest::from_bytes(&guard.buffer);
                guard.hasher = rehash(&guard.buffer);
                return Err(Error::DigestMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        };

        self.store.put_blob(&actual, &guard.buffer)?;
        drop(guard);
        self.sessions.invalidate(&id).await;
        Ok(actual)
    }

    pub async fn cancel(&self, id: Uuid) {
        self.sessions.invalidate(&id).await;
    }

    pub async fn current_size(&self, id: Uuid) -> Option<u64> {
        let session = self.sessions.get(&id).await?;
        let session = session.lock().await;
        Some(session.buffer.len() as u64)
    }
}

fn rehash(buffer: &[u8]) -> DigestHasher {
    let mut hasher = DigestHasher::new();
    hasher.update(buffer);
    hasher
}
