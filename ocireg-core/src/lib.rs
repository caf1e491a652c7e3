pub mod car;
pub mod credential;
pub mod digest;
pub mod manifest;
pub mod reference;

pub use credential::Credential;
pub use digest::{Digest, DigestHasher};
pub use reference::ContentRef;
