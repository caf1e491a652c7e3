pub mod atomicfile;
pub mod blobstore;
pub mod mapping;
pub mod upload;

pub use blobstore::BlobStore;
pub use mapping::MappingIndex;
pub use upload::UploadTable;
