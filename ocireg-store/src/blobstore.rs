//! Durable local store for blobs and manifests, keyed by their own digest.
//! Every write is temp-file-then-rename via [`crate::atomicfile`]; a file's
//! mere presence under its digest name is a promise its bytes are correct.

use std::io;
use std::path::Path;

use log::debug;
use ocireg_core::Digest;
use rustix::fd::OwnedFd;

use crate::atomicfile::{self, BlobKey};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("storage error: {0}")]
    Errno(#[from] rustix::io::Errno),
    #[error("digest cannot be represented as a store key")]
    BadDigest,
}

impl From<()> for Error {
    fn from(_: ()) -> Self {
        Error::BadDigest
    }
}

pub struct BlobStore {
    blobs: OwnedFd,
    manifests: OwnedFd,
}

impl BlobStore {
    /// Opens (creating if necessary) `<storage_dir>/blobs` and
    /// `<storage_dir>/manifests`.
    pub fn open(storage_dir: &Path) -> Result<Self, Error> {
        let root = atomicfile::open_or_create_dir_at(None, storage_dir)?;
        let blobs = atomicfile::open_or_create_dir_at(Some(&root), "blobs")?;
        let manifests = atomicfile::open_or_create_dir_at(Some(&root), "manifests")?;
        Ok(Self { blobs, manifests })
    }

    pub fn put_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<(), Error> {
        write_if_absent(&self.blobs, digest, bytes)
    }

    /// Hashes `bytes` and writes them verbatim under that digest. `bytes`
    /// must never be re-serialized before this call: the digest returned is
    /// only meaningful if it was computed over the exact wire body.
    pub fn save_manifest(&self, bytes: &[u8]) -> Result<Digest, Error> {
        let digest = Digest::from_bytes(bytes);
        write_if_absent(&self.manifests, &digest, bytes)?;
        Ok(digest)
    }

    pub fn blob_reader(&self, digest: &Digest) -> Result<Option<std::fs::File>, Error> {
        read(&self.blobs, digest)
    }

    pub fn manifest_reader(&self, digest: &Digest) -> Result<Option<std::fs::File>, Error> {
        read(&self.manifests, digest)
    }
}

fn write_if_absent(dir: &OwnedFd, digest: &Digest, bytes: &[u8]) -> Result<(), Error> {
    use std::io::Write;

    let key = BlobKey::try_from(digest).map_err(Error::from)?;
    if atomicfile::openat_read_key(dir, &key)?.is_some() {
        debug!("blob {} already present, skipping write", digest);
        return Ok(());
    }
    let (mut file, guard) = atomicfile::openat_create_write_with_guard(dir, &key)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    guard.success()?;
    Ok(())
}

fn read(dir: &OwnedFd, digest: &Digest) -> Result<Option<std::fs::File>, Error> {
    let key = BlobKey::try_from(digest).map_err(Error::from)?;
    Ok(atomicfile::openat_read_key(dir, &key)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let digest = Digest::from_bytes(b"hello");
        store.put_blob(&digest, b"hello").unwrap();
        assert!(store.blob_reader(&digest).unwrap().is_some());
        let mut f = store.blob_reader(&digest).unwrap().unwrap();
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut f, &mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn missing_digest_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let digest = Digest::from_bytes(b"nope");
        assert!(store.blob_reader(&digest).unwrap().is_none());
    }

    #[test]
    fn save_manifest_returns_digest_of_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let body = br#"{"schemaVersion":2,"layers":[]}"#;
        let digest = store.save_manifest(body).unwrap();
        assert_eq!(digest, Digest::from_bytes(body));
        let mut f = store.manifest_reader(&digest).unwrap().unwrap();
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut f, &mut buf).unwrap();
        assert_eq!(buf, body);
    }

    #[test]
    fn repeated_write_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let digest = Digest::from_bytes(b"abc");
        store.put_blob(&digest, b"abc").unwrap();
        store.put_blob(&digest, b"abc").unwrap();
        assert!(store.blob_reader(&digest).unwrap().is_some());
    }
}
