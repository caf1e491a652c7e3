//! Two-level cache of remote service handles (C7): one expensive
//! per-credential base service, and one per-(credential, image) dataset
//! built lazily on top of it. Pinning a layer and its manifest into the
//! same dataset keeps one image atomic from the backend's perspective.

use std::sync::Arc;

use bytes::Bytes;
use log::{info, trace};
use moka::future::Cache;

use ocireg_core::Credential;

use crate::backend::{
    Backend, BackendError, BaseServiceHandle, ByteStream, DatasetHandle, DatasetMetadata,
    PinReceipt,
};

/// A provisioned per-image dataset, ready to accept pins.
pub struct ImageService {
    base: Arc<BaseServiceHandle>,
    dataset: DatasetHandle,
    metadata: DatasetMetadata,
}

impl ImageService {
    pub fn dataset(&self) -> &DatasetHandle {
        &self.dataset
    }
}

pub struct ServiceManager {
    backend: Arc<dyn Backend>,
    source_name: String,
    base_services: Cache<Credential, Arc<BaseServiceHandle>>,
    image_services: Cache<(Credential, String), Arc<ImageService>>,
}

impl ServiceManager {
    pub fn new(backend: Arc<dyn Backend>, source_name: impl Into<String>) -> Self {
        Self {
            backend,
            source_name: source_name.into(),
            base_services: Cache::builder().max_capacity(10_000).build(),
            image_services: Cache::builder().max_capacity(10_000).build(),
        }
    }

    async fn base_for(&self, cred: &Credential) -> Result<Arc<BaseServiceHandle>, BackendError> {
        if let Some(base) = self.base_services.get(cred).await {
            return Ok(base);
        }
        trace!("initializing base service for credential");
        let base = Arc::new(self.backend.initialize(cred).await?);
        self.base_services.insert(cred.clone(), base.clone()).await;
        Ok(base)
    }

    /// Returns the [`ImageService`] for `(cred, image)`, provisioning a new
    /// remote dataset on first use and caching it process-wide thereafter.
    pub async fn service_for(
        &self,
        cred: &Credential,
        image: &str,
    ) -> Result<Arc<ImageService>, BackendError> {
        let key = (cred.clone(), image.to_string());
        if let Some(service) = self.image_services.get(&key).await {
            return Ok(service);
        }

        let base = self.base_for(cred).await?;
        let metadata = DatasetMetadata::for_image(image, self.source_name.clone());
        trace!("creating dataset for image {image}");
        let dataset = self.backend.create_dataset(&base, &metadata).await?;
        let service = Arc::new(ImageService {
            base,
            dataset,
            metadata,
        });
        self.image_services.insert(key, service.clone()).await;
        Ok(service)
    }

    pub async fn pin(
        &self,
        cred: &Credential,
        image: &str,
        payload: Bytes,
        content_id: &str,
    ) -> Result<PinReceipt, BackendError> {
        let service = self.service_for(cred, image).await?;
        self.backend
            .pin(
                &service.base,
                &service.dataset,
                payload,
                content_id,
                &service.metadata,
            )
            .await
    }

    pub async fn fetch(&self, content_id: &str) -> Result<ByteStream, BackendError> {
        self.backend.fetch(content_id).await
    }

    /// Drains both caches and tears down the backend. Called on process
    /// shutdown; in-flight pins started before this call may be lost.
    pub async fn shutdown(&self) {
        self.base_services.invalidate_all();
        self.image_services.invalidate_all();
        self.base_services.run_pending_tasks().await;
        self.image_services.run_pending_tasks().await;
        self.backend.teardown().await;
        info!("service manager shut down");
    }
}
