use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trait for getting the wire name of a typed message
pub trait EventType {
    fn event_type(&self) -> &'static str;
}

/// Domain events pushed to clients. Payload values are produced upstream
/// and carried through the hub untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "eventType",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Event {
    // Feed (posts / responses / post:{id} / circle:{id})
    NewPost {
        post_id: String,
        post: Value,
    },
    NewResponse {
        post_id: String,
        response_id: String,
        response: Value,
    },
    SupporterJoined {
        post_id: String,
        supporter_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    PostDeleted {
        post_id: String,
    },

    // Direct (user:{id})
    Notification {
        user_id: String,
        notification: Value,
    },

    // Presence
    UserOnline {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    UserOffline {
        user_id: String,
    },
}

impl EventType for Event {
    fn event_type(&self) -> &'static str {
        match self {
            Event::NewPost { .. } => "new_post",
            Event::NewResponse { .. } => "new_response",
            Event::SupporterJoined { .. } => "supporter_joined",
            Event::PostDeleted { .. } => "post_deleted",
            Event::Notification { .. } => "notification",
            Event::UserOnline { .. } => "user_online",
            Event::UserOffline { .. } => "user_offline",
        }
    }
}

/// Everything the server writes to a client. `Event` carries domain events,
/// the rest answer the client's own control frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    Event(Event),
    AuthOk { user_id: String },
    AuthError { code: String, reason: String },
    Subscribed { channels: Vec<String> },
    SubscribeRejected { channel: String, reason: String },
    Unsubscribed { channels: Vec<String> },
    Error { code: String, message: String },
}

impl EventType for Message {
    fn event_type(&self) -> &'static str {
        match self {
            Message::Event(event) => event.event_type(),
            Message::AuthOk { .. } => "auth_ok",
            Message::AuthError { .. } => "auth_error",
            Message::Subscribed { .. } => "subscribed",
            Message::SubscribeRejected { .. } => "subscribe_rejected",
            Message::Unsubscribed { .. } => "unsubscribed",
            Message::Error { .. } => "error",
        }
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Message::Event(event)
    }
}

/// Frames a client is allowed to send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Auth { token: String },
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
}

impl ControlFrame {
    /// Wire names of every control frame type.
    pub const TYPES: [&'static str; 3] = ["auth", "subscribe", "unsubscribe"];
}

impl EventType for ControlFrame {
    fn event_type(&self) -> &'static str {
        match self {
            ControlFrame::Auth { .. } => "auth",
            ControlFrame::Subscribe { .. } => "subscribe",
            ControlFrame::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_snake_case_type_and_camel_case_fields() {
        let event = Event::NewResponse {
            post_id: "1".into(),
            response_id: "2".into(),
            response: json!({"body": "you are not alone"}),
        };
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["eventType"], "new_response");
        assert_eq!(value["postId"], "1");
        assert_eq!(value["responseId"], "2");
        assert_eq!(event.event_type(), "new_response");
    }

    #[test]
    fn anonymous_presence_omits_display_name() {
        let value = serde_json::to_value(Event::UserOnline {
            user_id: "u1".into(),
            display_name: None,
        })
        .unwrap();

        assert_eq!(value, json!({"eventType": "user_online", "userId": "u1"}));
    }

    #[test]
    fn control_frames_parse_from_documented_shapes() {
        let auth: ControlFrame =
            serde_json::from_str(r#"{"type":"auth","token":"abc"}"#).unwrap();
        let subscribe: ControlFrame =
            serde_json::from_str(r#"{"type":"subscribe","channels":["posts","circle:42"]}"#)
                .unwrap();

        assert_eq!(auth, ControlFrame::Auth { token: "abc".into() });
        assert_eq!(
            subscribe,
            ControlFrame::Subscribe {
                channels: vec!["posts".into(), "circle:42".into()]
            }
        );
    }

    #[test]
    fn control_frame_types_match_wire_names() {
        let frames = [
            ControlFrame::Auth { token: String::new() },
            ControlFrame::Subscribe { channels: vec![] },
            ControlFrame::Unsubscribe { channels: vec![] },
        ];
        for (frame, name) in frames.iter().zip(ControlFrame::TYPES) {
            assert_eq!(frame.event_type(), name);
        }
    }
}
