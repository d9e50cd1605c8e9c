pub mod config;
pub mod error;
pub mod gateway;
pub mod model;
pub mod provider;
pub mod repository;
pub mod runner;
pub mod store;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use repository::Repository;
pub use store::Store;

use std::sync::Arc;

/// Shared application state passed to every Gateway handler.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub repo: Arc<Repository>,
    pub started_at: std::time::Instant,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, repo: Arc<Repository>) -> Self {
        Self {
            config,
            repo,
            started_at: std::time::Instant::now(),
        }
    }
}
