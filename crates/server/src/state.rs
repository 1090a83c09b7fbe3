//! Shared application state.

use std::sync::Arc;

use lumina_config::Settings;

use crate::session::SessionManager;

/// Handles shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let max_sessions = settings.server.max_sessions;
        Self {
            settings: Arc::new(settings),
            sessions: Arc::new(SessionManager::new(max_sessions)),
        }
    }
}
