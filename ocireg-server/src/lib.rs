pub mod config;
pub mod error;
pub mod metrics;
pub mod pin;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::ApiError;
pub use routes::build_router;
pub use state::AppState;
