use std::sync::Arc;

use parley_agent::GenerationBridge;
use parley_core::config::Config;
use parley_core::recorder::EventRecorder;
use parley_core::session::{SessionLimits, SessionStore};
use parley_core::utils::sanitize_sid;
use parley_providers::LLMProvider;

use crate::registry::ConnectionRegistry;

/// Everything a handler needs, cheap to clone
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub bridge: Arc<GenerationBridge>,
    pub recorder: Arc<dyn EventRecorder>,
    pub room: Arc<ConnectionRegistry>,
}

impl AppState {
    pub fn new(
        config: Config,
        provider: Arc<dyn LLMProvider>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        let sessions = SessionStore::new(SessionLimits::from(&config.session));
        let bridge = GenerationBridge::from_config(provider, &config);
        Self {
            config: Arc::new(config),
            sessions: Arc::new(sessions),
            bridge: Arc::new(bridge),
            recorder,
            room: Arc::new(ConnectionRegistry::new()),
        }
    }

    /// Session id for a connection, from the client-supplied value.
    ///
    /// Absent or malformed ids fall back to the placeholder, or to a fresh
    /// UUID when `session.assign_missing_ids` is set.
    pub fn resolve_sid(&self, raw: Option<&str>) -> String {
        let session = &self.config.session;
        match sanitize_sid(raw, session.max_sid_chars) {
            Some(sid) => sid,
            None if session.assign_missing_ids => uuid::Uuid::new_v4().to_string(),
            None => session.placeholder_sid.clone(),
        }
    }
}
