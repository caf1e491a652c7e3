//! End-to-end exercise of the OCI v2 HTTP surface (C10) against a real
//! bound TCP listener, driven with `reqwest` the way a registry client
//! actually would. Unit tests elsewhere in this workspace cover each
//! component in isolation; this file covers the seams between them: the
//! wire-level status codes, headers, and byte-for-byte round trips called
//! out in the concrete scenarios.

use std::sync::Arc;

use base64::Engine as _;
use ocireg_remote::{Resolver, ServiceManager, StubBackend};
use ocireg_server::{build_router, AppState};
use ocireg_store::{BlobStore, MappingIndex, UploadTable};

struct TestServer {
    base_url: String,
    _dir: tempfile::TempDir,
}

async fn spawn_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobStore::open(&dir.path().join("storage")).unwrap());
    let mapping = Arc::new(
        MappingIndex::open(dir.path().join("mapping.json"), true)
            .await
            .unwrap(),
    );
    let uploads = UploadTable::new(store.clone());
    let services = Arc::new(ServiceManager::new(Arc::new(StubBackend::new()), "ocireg-test"));
    let resolver = Resolver::new(store.clone(), services.clone());

    let state = Arc::new(AppState {
        store,
        mapping,
        uploads,
        services,
        resolver,
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        _dir: dir,
    }
}

fn basic_auth_header() -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("docker:deadbeef")
    )
}

#[tokio::test]
async fn v2_root_requires_auth_then_succeeds() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let unauthenticated = client.get(format!("{}/v2/", server.base_url)).send().await.unwrap();
    assert_eq!(unauthenticated.status(), 401);
    assert!(unauthenticated
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("Basic"));

    let authenticated = client
        .get(format!("{}/v2/", server.base_url))
        .header("Authorization", basic_auth_header())
        .send()
        .await
        .unwrap();
    assert_eq!(authenticated.status(), 200);
    let body: serde_json::Value = authenticated.json().await.unwrap();
    assert_eq!(body["version"], "2.0");
}

#[tokio::test]
async fn empty_patch_body_is_rejected() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let start = client
        .post(format!("{}/v2/library/test/blobs/uploads/", server.base_url))
        .header("Authorization", basic_auth_header())
        .send()
        .await
        .unwrap();
    assert_eq!(start.status(), 202);
    let location = start.headers().get("location").unwrap().to_str().unwrap().to_string();

    let patch = client
        .patch(format!("{}{}", server.base_url, location))
        .header("Authorization", basic_auth_header())
        .body(Vec::<u8>::new())
        .send()
        .await
        .unwrap();
    assert_eq!(patch.status(), 400);
    let body: serde_json::Value = patch.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().to_lowercase().contains("no data"));
}

#[tokio::test]
async fn chunked_upload_with_correct_digest_is_then_pullable() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let start = client
        .post(format!("{}/v2/library/test/blobs/uploads/", server.base_url))
        .header("Authorization", basic_auth_header())
        .send()
        .await
        .unwrap();
    assert_eq!(start.status(), 202);
    let location = start.headers().get("location").unwrap().to_str().unwrap().to_string();
    let upload_uuid = start.headers().get("docker-upload-uuid").unwrap().to_str().unwrap().to_string();
    assert!(!upload_uuid.is_empty());

    let patch = client
        .patch(format!("{}{}", server.base_url, location))
        .header("Authorization", basic_auth_header())
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(patch.status(), 202);
    assert_eq!(patch.headers().get("range").unwrap(), "0-4");

    let digest = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    let finish = client
        .put(format!("{}{}?digest={digest}", server.base_url, location))
        .header("Authorization", basic_auth_header())
        .send()
        .await
        .unwrap();
    assert_eq!(finish.status(), 201);
    assert_eq!(finish.headers().get("docker-content-digest").unwrap(), digest);
    let put_location = finish.headers().get("location").unwrap().to_str().unwrap().to_string();
    assert!(put_location.ends_with(digest));

    let pulled = client
        .get(format!("{}/v2/library/test/blobs/{digest}", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(pulled.status(), 200);
    assert_eq!(pulled.bytes().await.unwrap().as_ref(), b"hello");
}

#[tokio::test]
async fn wrong_digest_on_finalize_is_rejected_and_nothing_is_stored() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let start = client
        .post(format!("{}/v2/library/test/blobs/uploads/", server.base_url))
        .header("Authorization", basic_auth_header())
        .send()
        .await
        .unwrap();
    let location = start.headers().get("location").unwrap().to_str().unwrap().to_string();

    client
        .patch(format!("{}{}", server.base_url, location))
        .header("Authorization", basic_auth_header())
        .body("hello")
        .send()
        .await
        .unwrap();

    let wrong_digest = format!("sha256:{}", "0".repeat(64));
    let finish = client
        .put(format!("{}{}?digest={wrong_digest}", server.base_url, location))
        .header("Authorization", basic_auth_header())
        .send()
        .await
        .unwrap();
    assert_eq!(finish.status(), 400);

    let pulled = client
        .get(format!("{}/v2/library/test/blobs/{wrong_digest}", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(pulled.status(), 404);
}

#[tokio::test]
async fn manifest_put_resolves_by_tag_and_by_digest() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let manifest_body = br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","layers":[]}"#;
    let put = client
        .put(format!("{}/v2/library/test/manifests/latest", server.base_url))
        .header("Authorization", basic_auth_header())
        .header("content-type", "application/vnd.docker.distribution.manifest.v2+json")
        .body(manifest_body.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), 201);
    let digest = put.headers().get("docker-content-digest").unwrap().to_str().unwrap().to_string();

    let by_tag = client
        .get(format!("{}/v2/library/test/manifests/latest", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(by_tag.status(), 200);
    assert_eq!(
        by_tag.headers().get("content-type").unwrap(),
        "application/vnd.docker.distribution.manifest.v2+json"
    );
    let by_tag_body = by_tag.bytes().await.unwrap();
    assert_eq!(by_tag_body.as_ref(), manifest_body);

    let by_digest = client
        .get(format!("{}/v2/library/test/manifests/{digest}", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(by_digest.status(), 200);
    assert_eq!(by_digest.bytes().await.unwrap(), by_tag_body);
}

#[tokio::test]
async fn manifest_layers_become_resolvable_blob_mappings() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let layer_digest = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    let start = client
        .post(format!("{}/v2/library/test/blobs/uploads/", server.base_url))
        .header("Authorization", basic_auth_header())
        .send()
        .await
        .unwrap();
    let location = start.headers().get("location").unwrap().to_str().unwrap().to_string();
    client
        .put(format!("{}{}?digest={layer_digest}", server.base_url, location))
        .header("Authorization", basic_auth_header())
        .body("hello")
        .send()
        .await
        .unwrap();

    let manifest_body = format!(
        r#"{{"schemaVersion":2,"layers":[{{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","digest":"{layer_digest}","size":5}}]}}"#
    );
    let put = client
        .put(format!("{}/v2/library/test/manifests/v1", server.base_url))
        .header("Authorization", basic_auth_header())
        .body(manifest_body)
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), 201);

    let pulled_layer = client
        .get(format!("{}/v2/library/test/blobs/{layer_digest}", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(pulled_layer.status(), 200);
}

#[tokio::test]
async fn health_and_metrics_are_reachable_without_auth() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/health", server.base_url)).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let metrics = client.get(format!("{}/metrics", server.base_url)).send().await.unwrap();
    assert_eq!(metrics.status(), 200);
    let body = metrics.text().await.unwrap();
    assert!(body.contains("ocireg_pushes_total"));
}

#[tokio::test]
async fn write_endpoints_require_auth() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v2/library/test/blobs/uploads/", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
