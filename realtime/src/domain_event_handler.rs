use crate::hub::Hub;
use crate::message::Event;
use crate::topic::Topic;
use async_trait::async_trait;
use events::{DomainEvent, EventHandler};
use log::*;

/// Handles domain events by converting them to realtime events and handing
/// them to the hub.
///
/// Upstream services decide what happened and who owns it; this handler only
/// picks the topics (or the single recipient) and never learns whether anyone
/// was listening.
pub struct RealtimeDomainEventHandler {
    hub: Hub,
}

impl RealtimeDomainEventHandler {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    fn broadcast_to(&self, topics: &[Topic], event: Event) {
        for topic in topics {
            self.hub.broadcast(topic, event.clone());
        }

        debug!("Broadcast event to {} topic(s): {:?}", topics.len(), topics);
    }
}

#[async_trait]
impl EventHandler for RealtimeDomainEventHandler {
    async fn handle(&self, event: &DomainEvent) {
        debug!("Handling {} domain event", event.name());

        match event {
            DomainEvent::PostCreated {
                post_id,
                circle_id,
                post,
            } => {
                let topic = match circle_id {
                    Some(circle_id) => Topic::Circle(circle_id.clone()),
                    None => Topic::Posts,
                };
                let realtime_event = Event::NewPost {
                    post_id: post_id.clone(),
                    post: post.clone(),
                };

                self.broadcast_to(&[topic], realtime_event);
            }

            DomainEvent::ResponseCreated {
                post_id,
                response_id,
                response,
            } => {
                let realtime_event = Event::NewResponse {
                    post_id: post_id.clone(),
                    response_id: response_id.clone(),
                    response: response.clone(),
                };

                self.broadcast_to(
                    &[Topic::Responses, Topic::Post(post_id.clone())],
                    realtime_event,
                );
            }

            DomainEvent::SupporterJoined {
                post_id,
                supporter_id,
                display_name,
            } => {
                let realtime_event = Event::SupporterJoined {
                    post_id: post_id.clone(),
                    supporter_id: supporter_id.clone(),
                    display_name: display_name.clone(),
                };

                self.broadcast_to(&[Topic::Post(post_id.clone())], realtime_event);
            }

            DomainEvent::PostDeleted { post_id } => {
                let realtime_event = Event::PostDeleted {
                    post_id: post_id.clone(),
                };

                self.broadcast_to(
                    &[Topic::Posts, Topic::Post(post_id.clone())],
                    realtime_event,
                );
            }

            DomainEvent::NotificationCreated {
                recipient_id,
                notification,
            } => {
                self.hub.send_to_user(
                    recipient_id,
                    Event::Notification {
                        user_id: recipient_id.clone(),
                        notification: notification.clone(),
                    },
                );
            }
        }
    }
}
