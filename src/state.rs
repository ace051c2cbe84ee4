//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;

use crate::config::Config;
use crate::putio::PutioClient;

/// Shared state for the RPC endpoint.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// put.io API client, shared with the download manager.
    pub putio: Arc<PutioClient>,
}
