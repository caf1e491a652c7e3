//! Manifest introspection: pulling layer digests and a `Content-Type` out of
//! an OCI / Docker v2 / legacy v1 manifest body without ever re-serializing
//! it (that would change its digest).

use serde_json::Value;

use crate::digest::Digest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad manifest json: {0}")]
    BadManifest(#[from] serde_json::Error),
}

pub const OCI_IMAGE_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_IMAGE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Returns the layer digests declared in `body`, reading either the OCI/Docker
/// v2 `layers[*].digest` shape or the legacy Docker v1 `fsLayers[*].digest`
/// shape. Digests that fail to parse as `sha256:<hex>` are skipped rather than
/// rejecting the whole manifest: the parser validates JSON-ness only, per the
/// contract.
pub fn layers_of(body: &[u8]) -> Result<Vec<Digest>, Error> {
    let value: Value = serde_json::from_slice(body)?;
    Ok(layers_of_value(&value))
}

fn layers_of_value(value: &Value) -> Vec<Digest> {
    if let Some(layers) = value.get("layers").and_then(Value::as_array) {
        return layers
            .iter()
            .filter_map(|l| l.get("digest").and_then(Value::as_str))
            .filter_map(|s| s.parse().ok())
            .collect();
    }
    if let Some(layers) = value.get("fsLayers").and_then(Value::as_array) {
        return layers
            .iter()
            .filter_map(|l| l.get("blobSum").and_then(Value::as_str))
            .filter_map(|s| s.parse().ok())
            .collect();
    }
    Vec::new()
}

/// Resolves the `Content-Type` to serve a manifest body under, per the
/// three-step fallback in the distribution spec: the client's declared
/// `mediaType`, else a schema-version-derived default.
pub fn content_type_of(body: &[u8]) -> Result<&'static str, Error> {
    let value: Value = serde_json::from_slice(body)?;
    Ok(content_type_of_value(&value))
}

fn content_type_of_value(value: &Value) -> &'static str {
    if let Some(mt) = value.get("mediaType").and_then(Value::as_str) {
        return match mt {
            OCI_IMAGE_MANIFEST_V1 => OCI_IMAGE_MANIFEST_V1,
            DOCKER_IMAGE_MANIFEST_V2 => DOCKER_IMAGE_MANIFEST_V2,
            _ => {
                // the client declared a type we don't special-case; still
                // prefer the schemaVersion-derived fallback below rather
                // than leaking an arbitrary string as Content-Type
                return schema_version_default(value);
            }
        };
    }
    schema_version_default(value)
}

fn schema_version_default(value: &Value) -> &'static str {
    match value.get("schemaVersion").and_then(Value::as_u64) {
        Some(2) => DOCKER_IMAGE_MANIFEST_V2,
        _ => OCI_IMAGE_MANIFEST_V1,
    }
}
