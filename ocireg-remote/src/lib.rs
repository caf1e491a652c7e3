//! The remote pinning backend: a narrow, swappable interface (`Backend`),
//! a per-credential/per-image dataset cache built on top of it (C7), and
//! the local-first-with-remote-fallback resolver (C9) that dispatches on
//! a [`ContentRef`](ocireg_core::ContentRef).

pub mod backend;
pub mod resolver;
pub mod service;

pub use backend::{Backend, BackendError, DatasetMetadata, HttpBackend, StubBackend};
pub use resolver::{Opened, Resolver};
pub use service::{ImageService, ServiceManager};
