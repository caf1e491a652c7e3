//! Single point where the "local digest vs. remote content-id" dispatch
//! happens (C9). Callers hand in a [`ContentRef`] plus an optional fallback
//! digest and get back something they can stream to an HTTP client; they
//! never branch on whether the content landed locally or remotely.

use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};
use thiserror::Error;

use ocireg_core::{ContentRef, Digest};
use ocireg_store::BlobStore;

use crate::backend::ByteStream;
use crate::service::ServiceManager;

const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error("content not found")]
    NotFound,
    #[error("local store error: {0}")]
    Store(#[from] ocireg_store::blobstore::Error),
}

pub enum Opened {
    Local(std::fs::File),
    Remote(ByteStream),
}

pub struct Resolver {
    store: Arc<BlobStore>,
    services: Arc<ServiceManager>,
    remote_timeout: Duration,
}

impl Resolver {
    pub fn new(store: Arc<BlobStore>, services: Arc<ServiceManager>) -> Self {
        Self {
            store,
            services,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub async fn open_blob(
        &self,
        content_ref: &ContentRef,
        fallback_digest: Option<&Digest>,
    ) -> Result<Opened, Error> {
        self.open(content_ref, fallback_digest, |s, d| s.store.blob_reader(d))
            .await
    }

    pub async fn open_manifest(
        &self,
        content_ref: &ContentRef,
        fallback_digest: Option<&Digest>,
    ) -> Result<Opened, Error> {
        self.open(content_ref, fallback_digest, |s, d| s.store.manifest_reader(d))
            .await
    }

    async fn open(
        &self,
        content_ref: &ContentRef,
        fallback_digest: Option<&Digest>,
        local_reader: impl Fn(&Self, &Digest) -> Result<Option<std::fs::File>, ocireg_store::blobstore::Error>,
    ) -> Result<Opened, Error> {
        match content_ref {
            ContentRef::Local(digest) => {
                let file = local_reader(self, digest)?.ok_or(Error::NotFound)?;
                Ok(Opened::Local(file))
            }
            ContentRef::Remote(content_id) => {
                match tokio::time::timeout(self.remote_timeout, self.services.fetch(content_id))
                    .await
                {
                    Ok(Ok(stream)) => Ok(Opened::Remote(stream)),
                    Ok(Err(e)) => {
                        warn!("remote fetch of {content_id} failed: {e}, trying local fallback");
                        self.fallback(fallback_digest, local_reader)
                    }
                    Err(_) => {
                        warn!("remote fetch of {content_id} timed out, trying local fallback");
                        self.fallback(fallback_digest, local_reader)
                    }
                }
            }
        }
    }

    fn fallback(
        &self,
        fallback_digest: Option<&Digest>,
        local_reader: impl Fn(&Self, &Digest) -> Result<Option<std::fs::File>, ocireg_store::blobstore::Error>,
    ) -> Result<Opened, Error> {
        let Some(digest) = fallback_digest else {
            return Err(Error::NotFound);
        };
        match local_reader(self, digest)? {
            Some(file) => {
                trace!("served {digest} from local fallback");
                Ok(Opened::Local(file))
            }
            None => Err(Error::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use bytes::Bytes;
    use std::io::Read;

    fn store() -> Arc<BlobStore> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(BlobStore::open(dir.path()).unwrap())
    }

    fn services() -> Arc<ServiceManager> {
        Arc::new(ServiceManager::new(Arc::new(StubBackend::new()), "ocireg"))
    }

    #[tokio::test]
    async fn local_digest_opens_from_store() {
        let store = store();
        let digest = ocireg_core::Digest::from_bytes(b"hello");
        store.put_blob(&digest, b"hello").unwrap();
        let resolver = Resolver::new(store, services());

        let content_ref = ContentRef::Local(digest);
        match resolver.open_blob(&content_ref, None).await.unwrap() {
            Opened::Local(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf).unwrap();
                assert_eq!(buf, b"hello");
            }
            Opened::Remote(_) => panic!("expected local"),
        }
    }

    #[tokio::test]
    async fn remote_miss_falls_back_to_local() {
        let store = store();
        let digest = ocireg_core::Digest::from_bytes(b"world");
        store.put_blob(&digest, b"world").unwrap();
        let resolver = Resolver::new(store, services());

        let content_ref = ContentRef::Remote("bafy-does-not-exist".to_string());
        match resolver.open_blob(&content_ref, Some(&digest)).await.unwrap() {
            Opened::Local(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf).unwrap();
                assert_eq!(buf, b"world");
            }
            Opened::Remote(_) => panic!("expected local fallback"),
        }
    }

    #[tokio::test]
    async fn remote_miss_with_no_fallback_is_not_found() {
        let resolver = Resolver::new(store(), services());
        let content_ref = ContentRef::Remote("bafy-does-not-exist".to_string());
        let err = resolver.open_blob(&content_ref, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn remote_hit_streams_from_backend() {
        let backend = Arc::new(StubBackend::new());
        let manager = Arc::new(ServiceManager::new(backend.clone(), "ocireg"));
        let cred = ocireg_core::Credential::new("0xabc");
        manager
            .pin(&cred, "library/busybox", Bytes::from_static(b"pinned"), "cid1")
            .await
            .unwrap();

        let resolver = Resolver::new(store(), manager);
        let content_ref = ContentRef::Remote("cid1".to_string());
        match resolver.open_blob(&content_ref, None).await.unwrap() {
            Opened::Remote(mut stream) => {
                use futures::StreamExt;
                let mut collected = Vec::new();
                while let Some(chunk) = stream.next().await {
                    collected.extend_from_slice(&chunk.unwrap());
                }
                assert_eq!(collected, b"pinned");
            }
            Opened::Local(_) => panic!("expected remote"),
        }
    }
}
