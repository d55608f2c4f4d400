use std::sync::Arc;

use crate::agent::ProtocolHandler;
use crate::config::AppConfig;
use crate::persistence::Store;

/// Shared state handed to every route handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub handler: Arc<ProtocolHandler>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        handler: Arc<ProtocolHandler>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            handler,
            config,
        }
    }
}
