use std::sync::Arc;

use db::DBService;
use tokio::sync::watch;

use crate::services::{config::AppConfig, email::EmailClient};

pub mod services;

/// Explicit dependency record threaded through the materialiser, processor
/// and scheduler; the store behind `db` is the only shared mutable state.
#[derive(Clone)]
pub struct ServiceContext {
    pub db: DBService,
    pub config: Arc<AppConfig>,
    pub email: Arc<EmailClient>,
    /// Flips true exactly once, at shutdown.
    pub shutdown: watch::Receiver<bool>,
}
