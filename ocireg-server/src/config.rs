//! Startup configuration (C12). Every field is backed by an environment
//! variable; `clap` additionally exposes each as a CLI flag so local
//! development can override a variable without exporting it, with flags
//! taking precedence over the environment per clap's own resolution order.

use std::path::PathBuf;

use clap::Parser;

/// Used when the operator hasn't pointed us at a real backend deployment.
/// The `HttpBackend` will simply fail its first request against these, which
/// surfaces as a logged `ErrBackendPin` rather than a startup error: the
/// registry is usable in local-only mode (pulls/pushes resolve from the
/// local store) even with no backend configured.
const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_WARM_STORAGE_ADDRESS: &str = "http://127.0.0.1:8080";

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Path to the durable OCI-coordinate -> content-ref mapping index.
    #[arg(long, env = "MAPPING_FILE", default_value = "image_mapping.json")]
    pub mapping_file: PathBuf,

    /// Root of the local blob/manifest store.
    #[arg(long, env = "STORAGE_DIR", default_value = "storage")]
    pub storage_dir: PathBuf,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 5002)]
    pub port: u16,

    #[arg(long, env = "RPC_URL")]
    pub rpc_url: Option<String>,

    #[arg(long, env = "WARM_STORAGE_ADDRESS")]
    pub warm_storage_address: Option<String>,

    /// A malformed mapping file on disk is a fatal startup error by default;
    /// set to fall back to an empty index with a logged warning instead.
    #[arg(long, env = "MAPPING_LENIENT", default_value_t = false)]
    pub mapping_lenient: bool,
}

impl Config {
    pub fn rpc_url(&self) -> &str {
        self.rpc_url.as_deref().unwrap_or(DEFAULT_RPC_URL)
    }

    pub fn warm_storage_address(&self) -> &str {
        self.warm_storage_address
            .as_deref()
            .unwrap_or(DEFAULT_WARM_STORAGE_ADDRESS)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
