//! Event system infrastructure for the peer-support platform.
//!
//! This crate provides the event system that decouples business services
//! (posts, responses, circles, notifications) from delivery concerns like
//! the real-time WebSocket hub.
//!
//! # Architecture
//!
//! - **DomainEvent**: Enum representing all business events in the system
//! - **EventHandler**: Trait for implementing event handlers
//! - **EventPublisher**: Publishes events to registered handlers
//!
//! This crate has no dependencies on internal crates, avoiding circular
//! dependencies. Entity data is carried as serialized JSON values.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Identifier of any platform entity as it travels through the event system.
/// Upstream services stringify their own key types before publishing.
pub type Id = String;

/// Domain events that represent business-level changes in the system.
/// These events are emitted after a business operation has committed.
///
/// Upstream services decide *what* happened; the handlers decide who gets
/// told about it. Entity data is carried as `serde_json::Value`.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// A post was published, either to the open feed or inside a support circle.
    PostCreated {
        post_id: Id,
        /// Set when the post is only visible to members of a circle.
        circle_id: Option<Id>,
        /// Complete serialized post as the author's audience sees it.
        post: Value,
    },
    /// Someone responded to a post.
    ResponseCreated {
        post_id: Id,
        response_id: Id,
        response: Value,
    },
    /// A supporter offered to support the author of a post.
    SupporterJoined {
        post_id: Id,
        supporter_id: Id,
        /// Absent when the supporter chose to stay anonymous.
        display_name: Option<String>,
    },
    /// A post was removed by its author or by moderation.
    PostDeleted { post_id: Id },
    /// A notification addressed to a single user.
    NotificationCreated {
        recipient_id: Id,
        notification: Value,
    },
}

impl DomainEvent {
    /// Short stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::PostCreated { .. } => "post_created",
            DomainEvent::ResponseCreated { .. } => "response_created",
            DomainEvent::SupporterJoined { .. } => "supporter_joined",
            DomainEvent::PostDeleted { .. } => "post_deleted",
            DomainEvent::NotificationCreated { .. } => "notification_created",
        }
    }
}

/// Trait for handling domain events.
/// Implementations can perform side effects like pushing real-time updates,
/// updating caches, logging, etc.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent);
}

/// Publishes domain events to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Clone)]
pub struct EventPublisher {
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    /// Register a new event handler.
    /// Note: This creates a new publisher instance with the additional handler.
    /// Store the returned publisher in your application state.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.push(handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Publish an event to all registered handlers.
    /// Handlers are called sequentially and never report failures back to
    /// the publisher.
    pub async fn publish(&self, event: DomainEvent) {
        for handler in self.handlers.iter() {
            handler.handle(&event).await;
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        tag: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &DomainEvent) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.tag, event.name()));
        }
    }

    #[tokio::test]
    async fn publish_calls_handlers_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let publisher = EventPublisher::new()
            .with_handler(Arc::new(Recorder {
                tag: "first",
                seen: seen.clone(),
            }))
            .with_handler(Arc::new(Recorder {
                tag: "second",
                seen: seen.clone(),
            }));

        publisher
            .publish(DomainEvent::PostDeleted {
                post_id: "7".to_string(),
            })
            .await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:post_deleted", "second:post_deleted"]
        );
    }

    #[tokio::test]
    async fn with_handler_leaves_original_publisher_untouched() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = EventPublisher::new();
        let extended = base.clone().with_handler(Arc::new(Recorder {
            tag: "only",
            seen: seen.clone(),
        }));
        let event = DomainEvent::PostDeleted {
            post_id: "7".to_string(),
        };

        base.publish(event.clone()).await;
        assert!(seen.lock().unwrap().is_empty());

        extended.publish(event).await;
        assert_eq!(*seen.lock().unwrap(), vec!["only:post_deleted"]);
    }
}
