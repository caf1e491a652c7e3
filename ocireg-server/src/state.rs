use std::sync::Arc;

use ocireg_remote::{Resolver, ServiceManager};
use ocireg_store::{BlobStore, MappingIndex, UploadTable};

/// Everything a handler needs, wired once at startup and shared behind
/// `Arc` across every request task and every detached pin task.
pub struct AppState {
    pub store: Arc<BlobStore>,
    pub mapping: Arc<MappingIndex>,
    pub uploads: UploadTable,
    pub services: Arc<ServiceManager>,
    pub resolver: Resolver,
}
