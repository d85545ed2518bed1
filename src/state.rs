use std::sync::Arc;

use crate::config::Settings;
use crate::session::SessionRegistry;

/// Shared state of the HTTP layer.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(settings: Settings) -> Arc<Self> {
        let settings = Arc::new(settings);
        Arc::new(Self {
            sessions: Arc::new(SessionRegistry::new(Arc::clone(&settings))),
            settings,
        })
    }
}
