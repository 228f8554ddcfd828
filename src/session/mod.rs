//! Session records and the session service.
//!
//! The durable store behind sessions lives outside this crate; the
//! runtime only needs the mutate + subscribe surface, backed here by an
//! in-memory map.  Every mutation publishes a [`pubsub::Event`] that the
//! integration layer forwards into extension hooks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tracing::debug;

use crate::pubsub::{Broker, Event, EventKind};

/// A conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// Parent session for nested agent runs, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Unix-epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Unix-epoch timestamp in milliseconds.
    pub updated_at: i64,
}

/// Mutating + subscribing surface over sessions.
#[derive(Debug, Default)]
pub struct SessionService {
    sessions: RwLock<HashMap<String, Session>>,
    broker: Broker<Session>,
}

impl SessionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to session events (created / updated / deleted).
    pub fn subscribe(&self) -> broadcast::Receiver<Event<Session>> {
        self.broker.subscribe()
    }

    /// Create a session and publish a `Created` event.
    pub async fn create(&self, title: impl Into<String>) -> Session {
        let now = chrono::Utc::now().timestamp_millis();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            parent_id: None,
            created_at: now,
            updated_at: now,
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, "session created");
        self.broker.publish(EventKind::Created, session.clone());
        session
    }

    /// Replace a session record and publish an `Updated` event.
    pub async fn update(&self, mut session: Session) -> Session {
        session.updated_at = chrono::Utc::now().timestamp_millis();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        self.broker.publish(EventKind::Updated, session.clone());
        session
    }

    /// Delete a session and publish a `Deleted` event carrying the
    /// removed record.  Unknown ids are a no-op.
    pub async fn delete(&self, id: &str) {
        let removed = self.sessions.write().await.remove(id);
        if let Some(session) = removed {
            debug!(session_id = %id, "session deleted");
            self.broker.publish(EventKind::Deleted, session);
        }
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }
}
