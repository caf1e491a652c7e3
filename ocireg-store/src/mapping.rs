//! Durable JSON index from OCI coordinates `(image, reference)` and
//! `(image, digest)` to a [`ContentRef`] — either a local digest or a remote
//! content identifier.
//!
//! The on-disk shape is intentionally loose JSON rather than a single typed
//! enum: a manifest entry may be a bare string, or an object carrying a
//! `manifest_cid` plus an embedded `blobs` table; per-image blob tables also
//! live nested under the bare image name, and there is a global `blobs` pool
//! keyed only by digest. All of these are recognized on read; unknown
//! top-level keys are preserved verbatim across rewrites since other
//! processes/tools may have put them there.
//!
//! Every mutation goes through [`MappingIndex::mutate`], which holds a write
//! lock for the whole read-modify-persist cycle, serializing writers. Readers
//! never take that lock at all: they load a snapshot `Arc` off an
//! [`ArcSwap`], the same copy-on-write idiom this codebase uses for its other
//! read-mostly, write-rare maps. The file on disk is always either the
//! previous or the next consistent snapshot (temp file + rename), and the two
//! forms of consistency (in-memory pointer swap, on-disk rename) are kept in
//! lockstep by doing the swap only after the persist succeeds.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ocireg_core::{ContentRef, Digest};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed mapping file json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("mapping file top level is not a json object")]
    NotAnObject,
}

const BLOBS_KEY: &str = "blobs";
const MANIFEST_CID_KEY: &str = "manifest_cid";

pub struct MappingIndex {
    path: PathBuf,
    tree: ArcSwap<Map<String, Value>>,
    write_lock: Mutex<()>,
}

impl MappingIndex {
    /// Loads `path` if it exists. A missing file starts from an empty index.
    /// A present-but-malformed file is fatal when `strict` (the default
    /// policy): callers should treat the returned error as a startup error.
    /// With `strict = false` a malformed file falls back to an empty index.
    pub async fn open(path: impl Into<PathBuf>, strict: bool) -> Result<Self, Error> {
        let path = path.into();
        let tree = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                Ok(_) if strict => return Err(Error::NotAnObject),
                Err(e) if strict => return Err(Error::Malformed(e)),
                Ok(_) | Err(_) => {
                    log::warn!(
                        "mapping file {:?} is malformed or not a json object, starting from an empty index",
                        path
                    );
                    Map::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(Self {
            path,
            tree: ArcSwap::from_pointee(tree),
            write_lock: Mutex::new(()),
        })
    }

    /// §4.5 `lookupManifest`: direct key, then nested fallback, then (for a
    /// digest reference) a linear scan for a manifest whose recorded digest
    /// matches exactly.
    pub async fn lookup_manifest(&self, image: &str, reference: &str) -> Option<ContentRef> {
        let tree = self.tree.load();
        let direct = direct_key(image, reference);
        if let Some(v) = tree.get(&direct) {
            if let Some(cr) = content_ref_of(v) {
                return Some(cr);
            }
        }
        if let Some(Value::Object(image_obj)) = tree.get(image) {
            if let Some(v) = image_obj.get(reference) {
                if let Some(cr) = content_ref_of(v) {
                    return Some(cr);
                }
            }
        }
        if reference.starts_with("sha256:") {
            let prefix = format!("{image}:");
            for (k, v) in tree.iter() {
                if !k.starts_with(&prefix) {
                    continue;
                }
                if let Value::Object(obj) = v {
                    if obj.get(MANIFEST_CID_KEY).and_then(Value::as_str) == Some(reference) {
                        return content_ref_of(v);
                    }
                }
            }
        }
        None
    }

    /// §4.5 `lookupBlob`: per-image blob table, then the global pool.
    pub async fn lookup_blob(&self, image: &str, digest: &Digest) -> Option<ContentRef> {
        let tree = self.tree.load();
        let key = digest.to_string();
        if let Some(Value::Object(image_obj)) = tree.get(image) {
            if let Some(Value::Object(blobs)) = image_obj.get(BLOBS_KEY) {
                if let Some(v) = blobs.get(&key) {
                    if let Some(cr) = content_ref_of(v) {
                        return Some(cr);
                    }
                }
            }
        }
        if let Some(Value::Object(blobs)) = tree.get(BLOBS_KEY) {
            if let Some(v) = blobs.get(&key) {
                return content_ref_of(v);
            }
        }
        None
    }

    /// Records a single blob's content ref for `image`, independent of any
    /// manifest. Used by the blob-upload finalize path (§4.10), which has
    /// no manifest yet to carry a `blobMap` — the entry is merged into the
    /// same nested `mappings[image].blobs` table `lookup_blob` reads.
    pub async fn add_blob(
        &self,
        image: &str,
        digest: &Digest,
        content_ref: &ContentRef,
    ) -> Result<(), Error> {
        self.mutate(|tree| {
            merge_into_image_blobs(tree, image, &[(digest.clone(), content_ref.clone())]);
        })
        .await
    }

    /// §4.5 `addManifest`. Writes the bare-string shape when `blob_map` is
    /// empty, else the `manifest_cid` + embedded `blobs` object shape — and
    /// mirrors `blob_map` into the nested `mappings[image].blobs` table,
    /// which is the only place `lookup_blob` actually reads from.
    pub async fn add_manifest(
        &self,
        image: &str,
        reference: &str,
        content_ref: &ContentRef,
        blob_map: &[(Digest, ContentRef)],
    ) -> Result<(), Error> {
        self.mutate(|tree| {
            let key = direct_key(image, reference);
            let value = if blob_map.is_empty() {
                Value::String(content_ref.to_string())
            } else {
                let mut obj = Map::new();
                obj.insert(
                    MANIFEST_CID_KEY.to_string(),
                    Value::String(content_ref.to_string()),
                );
                obj.insert(BLOBS_KEY.to_string(), blob_map_to_value(blob_map));
                Value::Object(obj)
            };
            tree.insert(key, value);

            if !blob_map.is_empty() {
                merge_into_image_blobs(tree, image, blob_map);
            }
        })
        .await
    }

    /// Rewrites a single blob's content ref to `remote` wherever it appears
    /// for `image` — the nested `mappings[image].blobs` table and any
    /// embedded `blobs` table on a flat `"image:reference"` entry. Used by
    /// the async pin pipeline (§4.11) once a remote pin completes.
    pub async fn set_blob_content_ref(
        &self,
        image: &str,
        digest: &Digest,
        remote: &ContentRef,
    ) -> Result<(), Error> {
        self.mutate(|tree| {
            let key_str = digest.to_string();
            let value = Value::String(remote.to_string());

            if let Some(Value::Object(image_obj)) = tree.get_mut(image) {
                if let Some(Value::Object(blobs)) = image_obj.get_mut(BLOBS_KEY) {
                    if blobs.contains_key(&key_str) {
                        blobs.insert(key_str.clone(), value.clone());
                    }
                }
            }

            let prefix = format!("{image}:");
            for (k, v) in tree.iter_mut() {
                if !k.starts_with(&prefix) {
                    continue;
                }
                if let Value::Object(obj) = v {
                    if let Some(Value::Object(blobs)) = obj.get_mut(BLOBS_KEY) {
                        if blobs.contains_key(&key_str) {
                            blobs.insert(key_str.clone(), value.clone());
                        }
                    }
                }
            }
        })
        .await
    }

    /// Mirrors [`set_blob_content_ref`] for manifest entries, per the §9
    /// open-question recommendation. Rewrites the `"image:reference"` entry
    /// (and, if distinct, the `"image:digest"` alias) from a local digest to
    /// `remote`, preserving any embedded `blobs` table.
    pub async fn set_manifest_content_ref(
        &self,
        image: &str,
        references: &[&str],
        remote: &ContentRef,
    ) -> Result<(), Error> {
        self.mutate(|tree| {
            for reference in references {
                let key = direct_key(image, reference);
                match tree.get_mut(&key) {
                    Some(Value::String(s)) => *s = remote.to_string(),
                    Some(Value::Object(obj)) => {
                        obj.insert(
                            MANIFEST_CID_KEY.to_string(),
                            Value::String(remote.to_string()),
                        );
                    }
                    _ => {}
                }
            }
        })
        .await
    }

    /// Applies `f` to a cloned copy of the in-memory tree, persists the
    /// result, then publishes it via the `ArcSwap` so concurrent readers pick
    /// up the new snapshot atomically. `f` never sees a reference to the live
    /// tree: the write lock only serializes writers against each other, it
    /// never blocks a reader.
    pub async fn mutate(&self, f: impl FnOnce(&mut Map<String, Value>)) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut next = (**self.tree.load()).clone();
        f(&mut next);
        persist(&self.path, &next).await?;
        self.tree.store(Arc::new(next));
        Ok(())
    }
}

fn direct_key(image: &str, reference: &str) -> String {
    format!("{image}:{reference}")
}

fn content_ref_of(v: &Value) -> Option<ContentRef> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Object(obj) => obj
            .get(MANIFEST_CID_KEY)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
        _ => None,
    }
}

fn blob_map_to_value(blob_map: &[(Digest, ContentRef)]) -> Value {
    let mut obj = Map::new();
    for (digest, content_ref) in blob_map {
        obj.insert(digest.to_string(), Value::String(content_ref.to_string()));
    }
    Value::Object(obj)
}

fn merge_into_image_blobs(tree: &mut Map<String, Value>, image: &str, blob_map: &[(Digest, ContentRef)]) {
    let image_obj = tree
        .entry(image.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(image_obj) = image_obj else {
        return;
    };
    let blobs = image_obj
        .entry(BLOBS_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(blobs) = blobs else {
        return;
    };
    for (digest, content_ref) in blob_map {
        blobs
            .entry(digest.to_string())
            .or_insert_with(|| Value::String(content_ref.to_string()));
    }
}

async fn persist(path: &Path, tree: &Map<String, Value>) -> Result<(), Error> {
    let body = serde_json::to_vec_pretty(tree)?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new()?,
    };
    {
        use std::io::Write;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
    }
    tmp.persist(path)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn index() -> (tempfile::TempDir, MappingIndex) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        let index = MappingIndex::open(&path, true).await.unwrap();
        (dir, index)
    }

    #[tokio::test]
    async fn bare_string_manifest_roundtrips() {
        let (_dir, index) = index().await;
        let digest = Digest::from_bytes(b"manifest bytes");
        let cref = ContentRef::from(digest.clone());
        index
            .add_manifest("library/test", "latest", &cref, &[])
            .await
            .unwrap();
        let got = index.lookup_manifest("library/test", "latest").await.unwrap();
        assert_eq!(got, cref);
    }

    #[tokio::test]
    async fn manifest_with_blobs_populates_blob_lookup() {
        let (_dir, index) = index().await;
        let manifest_digest = Digest::from_bytes(b"manifest");
        let layer_digest = Digest::from_bytes(b"layer");
        let manifest_ref = ContentRef::from(manifest_digest.clone());
        let layer_ref = ContentRef::from(layer_digest.clone());
        index
            .add_manifest(
                "library/test",
                "latest",
                &manifest_ref,
                &[(layer_digest.clone(), layer_ref.clone())],
            )
            .await
            .unwrap();

        assert_eq!(
            index.lookup_blob("library/test", &layer_digest).await,
            Some(layer_ref)
        );
        assert_eq!(
            index.lookup_manifest("library/test", "latest").await,
            Some(manifest_ref)
        );
    }

    #[tokio::test]
    async fn digest_reference_falls_back_to_scan() {
        let (_dir, index) = index().await;
        let manifest_digest = Digest::from_bytes(b"manifest");
        let manifest_ref = ContentRef::from(manifest_digest.clone());
        index
            .add_manifest("library/test", "v1", &manifest_ref, &[])
            .await
            .unwrap();
        // no direct "image:digest" key was written, only the scan should find it
        let got = index
            .lookup_manifest("library/test", &manifest_digest.to_string())
            .await;
        assert!(got.is_none(), "bare string entries have no manifest_cid field to scan");
    }

    #[tokio::test]
    async fn async_pin_rewrite_updates_blob_entry() {
        let (_dir, index) = index().await;
        let manifest_digest = Digest::from_bytes(b"manifest");
        let layer_digest = Digest::from_bytes(b"layer");
        let manifest_ref = ContentRef::from(manifest_digest.clone());
        let layer_local = ContentRef::from(layer_digest.clone());
        index
            .add_manifest(
                "library/test",
                "latest",
                &manifest_ref,
                &[(layer_digest.clone(), layer_local)],
            )
            .await
            .unwrap();

        let remote: ContentRef = "bafkreisomethingremote".parse().unwrap();
        index
            .set_blob_content_ref("library/test", &layer_digest, &remote)
            .await
            .unwrap();

        assert_eq!(
            index.lookup_blob("library/test", &layer_digest).await,
            Some(remote)
        );
    }

    #[tokio::test]
    async fn persists_and_reloads_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        {
            let index = MappingIndex::open(&path, true).await.unwrap();
            let d = Digest::from_bytes(b"x");
            index
                .add_manifest("a/b", "latest", &ContentRef::from(d), &[])
                .await
                .unwrap();
        }
        let reloaded = MappingIndex::open(&path, true).await.unwrap();
        assert!(reloaded.lookup_manifest("a/b", "latest").await.is_some());
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let index = MappingIndex::open(&path, true).await.unwrap();
        assert!(index.lookup_manifest("a", "latest").await.is_none());
    }

    #[tokio::test]
    async fn malformed_file_is_fatal_when_strict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        assert!(MappingIndex::open(&path, true).await.is_err());
    }

    #[tokio::test]
    async fn malformed_file_falls_back_when_lenient() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let index = MappingIndex::open(&path, false).await.unwrap();
        assert!(index.lookup_manifest("a", "latest").await.is_none());
    }
}
