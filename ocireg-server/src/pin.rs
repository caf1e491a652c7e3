//! The async upload pipeline (C11): after a PUT response has already been
//! sent, pack the just-written bytes and pin them to the remote backend on
//! a detached task, then rewrite the mapping so later reads pick up the
//! remote content-id. Never shares request-scoped state: everything it
//! needs (bytes, image, digest, credential) is captured by value before the
//! task is spawned.

use std::sync::Arc;

use log::{error, info, warn};

use ocireg_core::{Credential, Digest};
use ocireg_remote::BackendError;

use crate::metrics;
use crate::state::AppState;

pub enum PinTarget {
    Blob,
    /// Also mirrors the rewrite onto every reference this manifest was
    /// recorded under (the tag and, if distinct, the digest alias), per the
    /// §9 open-question resolution to treat manifest and blob entries the
    /// same way.
    Manifest { references: Vec<String> },
}

/// Packs `bytes`, schedules the remote pin on a detached task, and returns
/// immediately. Call only after the local write (and the HTTP response it
/// backs) is already durable.
pub fn schedule(state: Arc<AppState>, image: String, digest: Digest, cred: Credential, bytes: bytes::Bytes, target: PinTarget) {
    let (payload, content_id) = ocireg_core::car::pack(&bytes);
    tokio::spawn(async move {
        let receipt = state
            .services
            .pin(&cred, &image, payload, &content_id)
            .await;

        match receipt {
            Ok(_) => {
                info!("pinned {image} {digest} as {content_id}");
                metrics::PIN_SUCCESS.inc();
                let remote: ocireg_core::ContentRef = content_id.parse().expect("ContentRef parsing is infallible");
                let result = match target {
                    PinTarget::Blob => state.mapping.set_blob_content_ref(&image, &digest, &remote).await,
                    PinTarget::Manifest { references } => {
                        let refs: Vec<&str> = references.iter().map(String::as_str).collect();
                        state.mapping.set_manifest_content_ref(&image, &refs, &remote).await
                    }
                };
                if let Err(e) = result {
                    error!("failed to rewrite mapping for {image} {digest} after pin: {e}");
                }
            }
            Err(e) => {
                metrics::PIN_FAILURE.inc();
                if matches!(e, BackendError::InsufficientFunds(_)) {
                    warn!(
                        "pin of {image} {digest} failed, insufficient funds: {e} (see wallet funding docs)"
                    );
                } else {
                    error!("pin of {image} {digest} failed: {e}, mapping stays at local digest");
                }
            }
        }
    });
}
