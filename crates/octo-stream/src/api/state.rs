//! Application state shared across handlers.

use std::sync::Arc;

use crate::chat::ChatStore;
use crate::db::Database;
use crate::pi::SessionRegistry;
use crate::stream::StreamCoordinator;
use crate::subagent::SubagentTracker;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Conversation, message and subagent storage.
    pub store: Arc<dyn ChatStore>,
    /// Agent sessions, one per conversation.
    pub registry: Arc<SessionRegistry>,
    /// Opens response streams.
    pub coordinator: StreamCoordinator,
    /// Database handle for health checks, absent for custom stores.
    pub db: Option<Database>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<SessionRegistry>,
        coordinator: StreamCoordinator,
    ) -> Self {
        Self {
            store,
            registry,
            coordinator,
            db: None,
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn tracker(&self) -> &SubagentTracker {
        self.registry.tracker()
    }
}
