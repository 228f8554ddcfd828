//! Message records and the message service.
//!
//! Mirrors [`crate::session`]: the runtime consumes the mutate +
//! subscribe surface only, so the store here is an in-memory map keyed
//! by message id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::RwLock;

use crate::pubsub::{Broker, Event, EventKind};

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Message role: `"user"`, `"assistant"`, `"system"`, `"tool"`.
    pub role: String,
    /// Message text.
    pub content: String,
    /// Unix-epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Optional extra metadata (tool results, attachments, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Mutating + subscribing surface over messages.
#[derive(Debug, Default)]
pub struct MessageService {
    messages: RwLock<HashMap<String, Message>>,
    broker: Broker<Message>,
}

impl MessageService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to message events (created / updated).
    pub fn subscribe(&self) -> broadcast::Receiver<Event<Message>> {
        self.broker.subscribe()
    }

    /// Create a message and publish a `Created` event.
    pub async fn create(
        &self,
        session_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Message {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role: role.into(),
            content: content.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            metadata: None,
        };
        self.messages
            .write()
            .await
            .insert(message.id.clone(), message.clone());
        self.broker.publish(EventKind::Created, message.clone());
        message
    }

    /// Replace a message record and publish an `Updated` event.
    pub async fn update(&self, message: Message) -> Message {
        self.messages
            .write()
            .await
            .insert(message.id.clone(), message.clone());
        self.broker.publish(EventKind::Updated, message.clone());
        message
    }

    pub async fn get(&self, id: &str) -> Option<Message> {
        self.messages.read().await.get(id).cloned()
    }

    /// All messages belonging to `session_id`, oldest first.
    pub async fn list_for_session(&self, session_id: &str) -> Vec<Message> {
        let mut out: Vec<Message> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_publishes_created_event() {
        let svc = MessageService::new();
        let mut rx = svc.subscribe();

        let msg = svc.create("s1", "user", "hello").await;

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Created);
        assert_eq!(ev.payload.id, msg.id);
        assert_eq!(ev.payload.role, "user");
    }

    #[tokio::test]
    async fn update_publishes_updated_event() {
        let svc = MessageService::new();
        let msg = svc.create("s1", "assistant", "draft").await;
        let mut rx = svc.subscribe();

        let mut edited = msg.clone();
        edited.content = "final".into();
        svc.update(edited).await;

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Updated);
        assert_eq!(ev.payload.content, "final");
    }

    #[tokio::test]
    async fn list_for_session_filters_and_orders() {
        let svc = MessageService::new();
        svc.create("s1", "user", "one").await;
        svc.create("s2", "user", "other").await;
        svc.create("s1", "assistant", "two").await;

        let msgs = svc.list_for_session("s1").await;
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "one");
        assert_eq!(msgs[1].content, "two");
    }
}
