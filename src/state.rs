//! Shared application state and the directory of connected sessions.

use crate::config::Config;
use crate::session::SessionHandle;
use crate::stream::Output;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::info;

/// A connected session as seen by the HTTP surface. The session's process
/// lives inside its actor; this only holds the handle used to reach it.
#[derive(Clone)]
pub struct SessionEntry {
    pub handle: SessionHandle,
    pub created_at: Instant,
}

/// Thread-safe session lookup by key.
pub type Sessions = Arc<RwLock<HashMap<String, SessionEntry>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Sessions,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Assign a fresh key and start a session whose output goes to `output`.
    pub async fn open_session(&self, output: Output) -> SessionHandle {
        let key = uuid::Uuid::new_v4().to_string();
        let handle = SessionHandle::spawn(key.clone(), &self.config, output);
        let entry = SessionEntry {
            handle: handle.clone(),
            created_at: Instant::now(),
        };
        self.sessions.write().await.insert(key.clone(), entry);
        info!(session = %key, "Created session");
        handle
    }

    /// Disconnect and forget `key`. Returns whether it existed.
    pub async fn close_session(&self, key: &str) -> bool {
        let entry = self.sessions.write().await.remove(key);
        match entry {
            Some(entry) => {
                entry.handle.disconnect().await;
                info!(session = %key, "Deleted session");
                true
            }
            None => false,
        }
    }
}
