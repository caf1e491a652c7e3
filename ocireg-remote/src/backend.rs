//! The swappable remote-pinning interface (C14): a thin HTTP client against
//! the configured RPC/warm-storage endpoints, plus an in-memory stub used by
//! the rest of this crate's test suite. The core never speaks to wallets,
//! payment rails, or proof-of-data-possession directly; it only ever calls
//! through this trait.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use log::{error, trace, warn};
use serde::Serialize;

use ocireg_core::Credential;

const REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("backend returned malformed response: {0}")]
    BadResponse(String),
    #[error("content id {0} not found at backend")]
    NotFound(String),
    #[error("backend reported insufficient funds, see {0}")]
    InsufficientFunds(String),
}

/// Identifies an already-initialized per-credential wallet/RPC session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseServiceHandle(pub String);

/// Identifies a per-image dataset provisioned on top of a base service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetHandle(pub String);

/// Opaque acknowledgement that a payload landed durably at the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinReceipt(pub String);

#[derive(Debug, Clone, Serialize)]
pub struct DatasetMetadata {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "imageName")]
    pub image_name: String,
    pub source: String,
}

impl DatasetMetadata {
    pub fn for_image(image_name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: "oci-image",
            image_name: image_name.into(),
            source: source.into(),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn initialize(&self, cred: &Credential) -> Result<BaseServiceHandle, BackendError>;

    async fn create_dataset(
        &self,
        base: &BaseServiceHandle,
        metadata: &DatasetMetadata,
    ) -> Result<DatasetHandle, BackendError>;

    async fn pin(
        &self,
        base: &BaseServiceHandle,
        dataset: &DatasetHandle,
        payload: Bytes,
        content_id: &str,
        metadata: &DatasetMetadata,
    ) -> Result<PinReceipt, BackendError>;

    async fn fetch(&self, content_id: &str) -> Result<ByteStream, BackendError>;

    async fn teardown(&self);
}

/// Thin `reqwest`-based client for a Filecoin-style warm storage pinning
/// service. POSTs to `rpc_url`-rooted endpoints for service/dataset/pin
/// lifecycle, GETs `{warm_storage_address}/ipfs/{content_id}` for fetch.
pub struct HttpBackend {
    client: reqwest::Client,
    rpc_url: String,
    warm_storage_address: String,
    source_name: String,
}

impl HttpBackend {
    pub fn new(
        rpc_url: impl Into<String>,
        warm_storage_address: impl Into<String>,
        source_name: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(REMOTE_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            rpc_url: rpc_url.into(),
            warm_storage_address: warm_storage_address.into(),
            source_name: source_name.into(),
        })
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    fn insufficient_funds(status: reqwest::StatusCode, body: &str) -> Option<BackendError> {
        if status == reqwest::StatusCode::PAYMENT_REQUIRED
            || body.to_ascii_lowercase().contains("insufficient")
        {
            Some(BackendError::InsufficientFunds(body.to_string()))
        } else {
            None
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn initialize(&self, cred: &Credential) -> Result<BaseServiceHandle, BackendError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            service_id: String,
        }
        let url = format!("{}/services", self.rpc_url);
        trace!("POST {url}");
        let res = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "credential": cred.as_str() }))
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            if let Some(e) = Self::insufficient_funds(status, &body) {
                return Err(e);
            }
            return Err(BackendError::BadResponse(format!(
                "initialize: status {status}, body {body}"
            )));
        }
        let resp: Resp = res
            .json()
            .await
            .map_err(|e| BackendError::BadResponse(e.to_string()))?;
        Ok(BaseServiceHandle(resp.service_id))
    }

    async fn create_dataset(
        &self,
        base: &BaseServiceHandle,
        metadata: &DatasetMetadata,
    ) -> Result<DatasetHandle, BackendError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            dataset_id: String,
        }
        let url = format!("{}/services/{}/datasets", self.rpc_url, base.0);
        trace!("POST {url}");
        let res = self.client.post(&url).json(metadata).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            if let Some(e) = Self::insufficient_funds(status, &body) {
                return Err(e);
            }
            return Err(BackendError::BadResponse(format!(
                "create_dataset: status {status}, body {body}"
            )));
        }
        let resp: Resp = res
            .json()
            .await
            .map_err(|e| BackendError::BadResponse(e.to_string()))?;
        Ok(DatasetHandle(resp.dataset_id))
    }

    async fn pin(
        &self,
        base: &BaseServiceHandle,
        dataset: &DatasetHandle,
        payload: Bytes,
        content_id: &str,
        metadata: &DatasetMetadata,
    ) -> Result<PinReceipt, BackendError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            receipt: String,
        }
        let url = format!(
            "{}/services/{}/datasets/{}/pins",
            self.rpc_url, base.0, dataset.0
        );
        trace!("POST {url} content_id={content_id}");
        let res = self
            .client
            .post(&url)
            .query(&[("content_id", content_id), ("source", &metadata.source)])
            .body(payload)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            if let Some(e) = Self::insufficient_funds(status, &body) {
                warn!("pin {content_id} rejected, insufficient funds: {body}");
                return Err(e);
            }
            error!("pin {content_id} failed: status {status}, body {body}");
            return Err(BackendError::BadResponse(format!(
                "pin: status {status}, body {body}"
            )));
        }
        let resp: Resp = res
            .json()
            .await
            .map_err(|e| BackendError::BadResponse(e.to_string()))?;
        Ok(PinReceipt(resp.receipt))
    }

    async fn fetch(&self, content_id: &str) -> Result<ByteStream, BackendError> {
        let url = format!("{}/ipfs/{content_id}", self.warm_storage_address);
        trace!("GET {url}");
        let res = self.client.get(&url).send().await?;
        match res.status() {
            reqwest::StatusCode::OK => {
                let stream = res.bytes_stream().map(|r| r.map_err(BackendError::from));
                Ok(Box::pin(stream))
            }
            reqwest::StatusCode::NOT_FOUND => Err(BackendError::NotFound(content_id.to_string())),
            status => Err(BackendError::BadResponse(format!(
                "fetch {content_id}: status {status}"
            ))),
        }
    }

    async fn teardown(&self) {
        trace!("http backend teardown, nothing to drain");
    }
}

/// In-memory [`Backend`] used by tests: pins are held in a map keyed by
/// content id, fetch replays whatever was pinned, no network involved.
#[derive(Default)]
pub struct StubBackend {
    pins: Mutex<HashMap<String, Bytes>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pinned_content_ids(&self) -> Vec<String> {
        self.pins.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl Backend for StubBackend {
    async fn initialize(&self, cred: &Credential) -> Result<BaseServiceHandle, BackendError> {
        Ok(BaseServiceHandle(format!("base-{}", cred.as_str())))
    }

    async fn create_dataset(
        &self,
        base: &BaseServiceHandle,
        metadata: &DatasetMetadata,
    ) -> Result<DatasetHandle, BackendError> {
        Ok(DatasetHandle(format!("{}-{}", base.0, metadata.image_name)))
    }

    async fn pin(
        &self,
        _base: &BaseServiceHandle,
        _dataset: &DatasetHandle,
        payload: Bytes,
        content_id: &str,
        _metadata: &DatasetMetadata,
    ) -> Result<PinReceipt, BackendError> {
        self.pins
            .lock()
            .unwrap()
            .insert(content_id.to_string(), payload);
        Ok(PinReceipt(format!("receipt-{content_id}")))
    }

    async fn fetch(&self, content_id: &str) -> Result<ByteStream, BackendError> {
        let payload = self
            .pins
            .lock()
            .unwrap()
            .get(content_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(content_id.to_string()))?;
        Ok(Box::pin(stream::once(async move { Ok(payload) })))
    }

    async fn teardown(&self) {
        self.pins.lock().unwrap().clear();
    }
}
