//! The OCI Distribution v2 HTTP surface (C10). One axum handler dispatches
//! every `/v2/*` request after a plain-string parse of the path — there's no
//! grammar here worth reaching for `nom` over (that crate earns its keep
//! parsing `WWW-Authenticate` challenges on the client side, not this).

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use log::warn;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use ocireg_core::{credential, ContentRef, Credential, Digest};
use ocireg_remote::Opened;

use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;

const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v2/", get(v2_root).head(v2_root))
        .route(
            "/v2/{*rest}",
            get(v2_dispatch)
                .head(v2_dispatch)
                .post(v2_dispatch)
                .patch(v2_dispatch)
                .put(v2_dispatch),
        )
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

async fn v2_root(headers: HeaderMap) -> Response {
    if require_credential(&headers).is_err() {
        return ApiError::Unauthorized.into_response();
    }
    Json(json!({"version": "2.0"})).into_response()
}

/// What a `/v2/<rest>` path resolves to, per the layout in §4.1: the name is
/// everything before the first `/manifests/` or `/blobs/` segment, whichever
/// comes first — names themselves may contain slashes.
enum Route {
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    UploadStart { name: String },
    UploadChunk { name: String, upload_id: String },
}

fn parse_tail(rest: &str) -> Option<Route> {
    const MANIFESTS: &str = "/manifests/";
    const BLOBS: &str = "/blobs/";

    let manifests_pos = rest.find(MANIFESTS);
    let blobs_pos = rest.find(BLOBS);

    let (pos, tail_start, is_blobs) = match (manifests_pos, blobs_pos) {
        (Some(m), Some(b)) if b < m => (b, b + BLOBS.len(), true),
        (Some(m), _) => (m, m + MANIFESTS.len(), false),
        (None, Some(b)) => (b, b + BLOBS.len(), true),
        (None, None) => return None,
    };

    let name = &rest[..pos];
    if name.is_empty() {
        return None;
    }
    let tail = &rest[tail_start..];

    if is_blobs {
        if tail == "uploads" || tail == "uploads/" {
            Some(Route::UploadStart {
                name: name.to_string(),
            })
        } else if let Some(id) = tail.strip_prefix("uploads/") {
            Some(Route::UploadChunk {
                name: name.to_string(),
                upload_id: id.to_string(),
            })
        } else {
            Some(Route::Blob {
                name: name.to_string(),
                digest: tail.to_string(),
            })
        }
    } else {
        Some(Route::Manifest {
            name: name.to_string(),
            reference: tail.to_string(),
        })
    }
}

fn credential_from(headers: &HeaderMap) -> Option<Credential> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    credential::extract(Some(value))
}

fn require_credential(headers: &HeaderMap) -> Result<Credential, ApiError> {
    credential_from(headers).ok_or(ApiError::Unauthorized)
}

pub async fn v2_dispatch(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(rest): Path<String>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let route = parse_tail(&rest).ok_or_else(|| ApiError::bad_request("unrecognized /v2/ path"))?;

    match route {
        Route::Manifest { name, reference } => match method {
            Method::GET | Method::HEAD => get_manifest(&state, method, &name, &reference).await,
            Method::PUT => {
                let cred = require_credential(&headers)?;
                put_manifest(&state, &name, &reference, cred, body).await
            }
            _ => Err(ApiError::bad_request("method not allowed on a manifest")),
        },
        Route::Blob { name, digest } => match method {
            Method::GET | Method::HEAD => get_blob(&state, method, &name, &digest).await,
            _ => Err(ApiError::bad_request("method not allowed on a blob")),
        },
        Route::UploadStart { name } => {
            require_credential(&headers)?;
            if method != Method::POST {
                return Err(ApiError::bad_request("method not allowed on an upload"));
            }
            upload_start(&state, &name).await
        }
        Route::UploadChunk { name, upload_id } => {
            let cred = require_credential(&headers)?;
            let upload_id: Uuid = upload_id
                .parse()
                .map_err(|_| ApiError::bad_request("bad upload id"))?;
            match method {
                Method::PATCH => upload_chunk(&state, &name, upload_id, body).await,
                Method::PUT => {
                    let digest = params.get("digest").cloned();
                    upload_finalize(&state, &name, upload_id, digest, cred, body).await
                }
                _ => Err(ApiError::bad_request("method not allowed on an upload session")),
            }
        }
    }
}

async fn get_manifest(
    state: &AppState,
    method: Method,
    image: &str,
    reference: &str,
) -> Result<Response, ApiError> {
    let content_ref = state
        .mapping
        .lookup_manifest(image, reference)
        .await
        .ok_or(ApiError::NotFound)?;

    if method == Method::HEAD {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(DOCKER_CONTENT_DIGEST, content_ref.to_string())
            .body(Body::empty())
            .expect("static head response is well-formed"));
    }

    // A remote content-id carries no digest of its own; only a digest-form
    // reference (or a plain local ref) tells us what to fall back to if the
    // fetch fails.
    let fallback_digest = match &content_ref {
        ContentRef::Local(d) => Some(d.clone()),
        ContentRef::Remote(_) => reference.parse::<Digest>().ok(),
    };

    let opened = state
        .resolver
        .open_manifest(&content_ref, fallback_digest.as_ref())
        .await?;
    let body = read_opened_to_bytes(opened).await?;
    let content_type = ocireg_core::manifest::content_type_of(&body)?;
    let digest = Digest::from_bytes(&body);
    metrics::PULLS.inc();

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, body.len())
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .body(Body::from(body))
        .expect("manifest response is well-formed"))
}

async fn put_manifest(
    state: &Arc<AppState>,
    image: &str,
    reference: &str,
    cred: Credential,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("empty manifest body"));
    }
    let layers = ocireg_core::manifest::layers_of(&body)?;
    let manifest_digest = state.store.save_manifest(&body)?;

    let mut blob_map = Vec::with_capacity(layers.len());
    for layer in &layers {
        if let Some(cr) = state.mapping.lookup_blob(image, layer).await {
            blob_map.push((layer.clone(), cr));
        }
    }

    let manifest_ref = ContentRef::from(manifest_digest.clone());
    state
        .mapping
        .add_manifest(image, reference, &manifest_ref, &blob_map)
        .await?;

    let digest_str = manifest_digest.to_string();
    let mut references = vec![reference.to_string()];
    if reference != digest_str {
        state
            .mapping
            .add_manifest(image, &digest_str, &manifest_ref, &blob_map)
            .await?;
        references.push(digest_str.clone());
    }

    metrics::PUSHES.inc();
    crate::pin::schedule(
        state.clone(),
        image.to_string(),
        manifest_digest.clone(),
        cred,
        body,
        crate::pin::PinTarget::Manifest { references },
    );

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, format!("/v2/{image}/manifests/{reference}"))
        .header(DOCKER_CONTENT_DIGEST, digest_str)
        .body(Body::empty())
        .expect("manifest-put response is well-formed"))
}

async fn get_blob(
    state: &AppState,
    method: Method,
    image: &str,
    digest_str: &str,
) -> Result<Response, ApiError> {
    let digest: Digest = digest_str
        .parse()
        .map_err(|_| ApiError::bad_request("bad blob digest"))?;
    let content_ref = state
        .mapping
        .lookup_blob(image, &digest)
        .await
        .ok_or(ApiError::NotFound)?;

    if method == Method::HEAD {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(DOCKER_CONTENT_DIGEST, digest.to_string())
            .body(Body::empty())
            .expect("static head response is well-formed"));
    }

    let opened = state.resolver.open_blob(&content_ref, Some(&digest)).await?;
    metrics::PULLS.inc();

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .body(opened_to_body(opened))
        .expect("blob response is well-formed"))
}

async fn upload_start(state: &AppState, image: &str) -> Result<Response, ApiError> {
    let id = state.uploads.start(image.to_string()).await;
    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::LOCATION, format!("/v2/{image}/blobs/uploads/{id}"))
        .header(DOCKER_UPLOAD_UUID, id.to_string())
        .header(header::RANGE, "0-0")
        .body(Body::empty())
        .expect("upload-start response is well-formed"))
}

async fn upload_chunk(
    state: &AppState,
    image: &str,
    upload_id: Uuid,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("no data in PATCH body"));
    }
    let size = state.uploads.append(upload_id, &body).await?;
    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(
            header::LOCATION,
            format!("/v2/{image}/blobs/uploads/{upload_id}"),
        )
        .header(DOCKER_UPLOAD_UUID, upload_id.to_string())
        .header(header::RANGE, format!("0-{}", size.saturating_sub(1)))
        .body(Body::empty())
        .expect("upload-chunk response is well-formed"))
}

async fn upload_finalize(
    state: &Arc<AppState>,
    image: &str,
    upload_id: Uuid,
    digest_query: Option<String>,
    cred: Credential,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !body.is_empty() {
        state.uploads.append(upload_id, &body).await?;
    }
    let digest_str = digest_query.ok_or_else(|| ApiError::bad_request("missing digest query parameter"))?;
    let expected: Digest = digest_str
        .parse()
        .map_err(|_| ApiError::bad_request("bad digest query parameter"))?;

    let actual = state.uploads.finalize(upload_id, Some(&expected)).await?;

    let content_ref = ContentRef::from(actual.clone());
    state.mapping.add_blob(image, &actual, &content_ref).await?;
    metrics::PUSHES.inc();

    let bytes = match state.store.blob_reader(&actual)? {
        Some(file) => {
            let mut file = tokio::fs::File::from_std(file);
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .await
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            bytes::Bytes::from(buf)
        }
        None => {
            warn!("blob {actual} written but unreadable immediately after finalize, skipping pin");
            bytes::Bytes::new()
        }
    };
    if !bytes.is_empty() {
        crate::pin::schedule(
            state.clone(),
            image.to_string(),
            actual.clone(),
            cred,
            bytes,
            crate::pin::PinTarget::Blob,
        );
    }

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, format!("/v2/{image}/blobs/{actual}"))
        .header(DOCKER_CONTENT_DIGEST, actual.to_string())
        .body(Body::empty())
        .expect("upload-finalize response is well-formed"))
}

fn opened_to_body(opened: Opened) -> Body {
    match opened {
        Opened::Local(file) => {
            let file = tokio::fs::File::from_std(file);
            Body::from_stream(ReaderStream::new(file))
        }
        Opened::Remote(stream) => Body::from_stream(stream),
    }
}

async fn read_opened_to_bytes(opened: Opened) -> Result<Bytes, ApiError> {
    match opened {
        Opened::Local(file) => {
            let mut file = tokio::fs::File::from_std(file);
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .await
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            Ok(Bytes::from(buf))
        }
        Opened::Remote(mut stream) => {
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| ApiError::bad_request(e.to_string()))?;
                buf.extend_from_slice(&chunk);
            }
            Ok(Bytes::from(buf))
        }
    }
}
