//! Wire format for everything that crosses a WebSocket.
//!
//! Outbound frames are versioned envelopes:
//!
//! ```json
//! {"version":"v1","type":"event","timestamp":"2024-05-01T12:00:00Z",
//!  "eventType":"new_post","postId":"17","post":{...}}
//! ```
//!
//! Decoding is two-phase. Only the header is read first; a version outside
//! [`SchemaVersion::SUPPORTED`] is rejected before any payload field is
//! interpreted. Inbound control frames get the same treatment for their
//! optional `version` and their `type` discriminator.

use crate::error::{protocol_error, Error, ErrorKind, InternalErrorKind, ProtocolErrorKind};
use crate::message::{ControlFrame, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Upper bound on channels named in a single subscribe/unsubscribe frame.
pub const MAX_CHANNELS_PER_FRAME: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "v1")]
    V1,
}

impl SchemaVersion {
    pub const CURRENT: SchemaVersion = SchemaVersion::V1;
    // Expand this list when a new schema ships. Versions that have been
    // retired must be removed from it.
    pub const SUPPORTED: &'static [SchemaVersion] = &[SchemaVersion::V1];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "v1",
        }
    }

    /// Look up a supported version by its wire name.
    pub fn from_wire(version: &str) -> Option<SchemaVersion> {
        Self::SUPPORTED
            .iter()
            .copied()
            .find(|v| v.as_str() == version)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: SchemaVersion,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: Message,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    version: Option<String>,
}

#[derive(Deserialize)]
struct ControlHeader {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    version: Option<String>,
}

/// Rewrites an encoded frame from one schema version to another.
pub type Migration = fn(&[u8]) -> Result<Vec<u8>, Error>;

pub struct Codec {
    migrations: HashMap<(String, String), Migration>,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            migrations: HashMap::new(),
        }
    }

    /// Wrap `message` in an envelope stamped with the current schema version
    /// and the send time, then serialize it.
    pub fn encode(&self, message: impl Into<Message>) -> Result<String, Error> {
        let envelope = Envelope {
            version: SchemaVersion::CURRENT,
            timestamp: Utc::now(),
            message: message.into(),
        };

        serde_json::to_string(&envelope).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::Internal(InternalErrorKind::Encode),
        })
    }

    /// Decode a server envelope.
    pub fn decode_envelope(&self, text: &str) -> Result<Envelope, Error> {
        let header: EnvelopeHeader = serde_json::from_str(text)?;
        let version = header.version.ok_or_else(|| {
            protocol_error(
                ProtocolErrorKind::InvalidFrame("missing version".to_string()),
                "Envelope has no version",
            )
        })?;
        check_version(&version)?;

        Ok(serde_json::from_str(text)?)
    }

    /// Decode and validate a frame sent by a client.
    pub fn decode_control(&self, text: &str) -> Result<ControlFrame, Error> {
        let header: ControlHeader = serde_json::from_str(text)?;

        if let Some(version) = &header.version {
            check_version(version)?;
        }

        let frame_type = header.frame_type.ok_or_else(|| {
            protocol_error(
                ProtocolErrorKind::InvalidFrame("missing type".to_string()),
                "Control frame has no type",
            )
        })?;

        if frame_type == "event" {
            return Err(protocol_error(
                ProtocolErrorKind::ClientEventFrame,
                "Clients may not publish events",
            ));
        }
        if !ControlFrame::TYPES.contains(&frame_type.as_str()) {
            return Err(protocol_error(
                ProtocolErrorKind::UnknownControlType(frame_type),
                "Unrecognised control frame type",
            ));
        }

        let frame: ControlFrame = serde_json::from_str(text)?;

        match &frame {
            ControlFrame::Subscribe { channels } | ControlFrame::Unsubscribe { channels } => {
                if channels.is_empty() {
                    return Err(protocol_error(
                        ProtocolErrorKind::InvalidFrame("no channels".to_string()),
                        "Channel list is empty",
                    ));
                }
                if channels.len() > MAX_CHANNELS_PER_FRAME {
                    return Err(protocol_error(
                        ProtocolErrorKind::InvalidFrame("too many channels".to_string()),
                        "Channel list exceeds the per-frame limit",
                    ));
                }
            }
            ControlFrame::Auth { .. } => {}
        }

        Ok(frame)
    }

    /// Register a function that rewrites frames from `from` to `to`.
    pub fn register_migration(&mut self, from: &str, to: &str, migration: Migration) {
        self.migrations
            .insert((from.to_string(), to.to_string()), migration);
    }

    /// Rewrite an encoded frame between schema versions.
    ///
    /// Identical versions pass through. Any other pair needs a registered
    /// migration; without one the request fails instead of handing the bytes
    /// on uninterpreted.
    pub fn migrate(&self, bytes: &[u8], from: &str, to: &str) -> Result<Vec<u8>, Error> {
        if from == to {
            check_version(from)?;
            return Ok(bytes.to_vec());
        }

        match self.migrations.get(&(from.to_string(), to.to_string())) {
            Some(migration) => migration(bytes),
            None => Err(protocol_error(
                ProtocolErrorKind::MigrationNotImplemented {
                    from: from.to_string(),
                    to: to.to_string(),
                },
                "No migration registered between these schema versions",
            )),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

fn check_version(version: &str) -> Result<SchemaVersion, Error> {
    SchemaVersion::from_wire(version).ok_or_else(|| {
        protocol_error(
            ProtocolErrorKind::UnsupportedVersion(version.to_string()),
            "Unsupported schema version",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Event;
    use serde_json::{json, Value};

    fn all_events() -> Vec<Event> {
        vec![
            Event::NewPost {
                post_id: "1".into(),
                post: json!({"title": "rough week", "anonymous": true}),
            },
            Event::NewResponse {
                post_id: "1".into(),
                response_id: "9".into(),
                response: json!({"body": "sending strength"}),
            },
            Event::SupporterJoined {
                post_id: "1".into(),
                supporter_id: "u3".into(),
                display_name: Some("Sam".into()),
            },
            Event::PostDeleted { post_id: "1".into() },
            Event::Notification {
                user_id: "u1".into(),
                notification: json!({"kind": "reply"}),
            },
            Event::UserOnline {
                user_id: "u2".into(),
                display_name: None,
            },
            Event::UserOffline { user_id: "u2".into() },
        ]
    }

    #[test]
    fn every_event_survives_encode_then_decode() {
        let codec = Codec::new();
        for event in all_events() {
            let text = codec.encode(event.clone()).unwrap();
            let envelope = codec.decode_envelope(&text).unwrap();

            assert_eq!(envelope.version, SchemaVersion::CURRENT);
            assert_eq!(envelope.message, Message::Event(event));
        }
    }

    #[test]
    fn encode_stamps_version_type_and_timestamp() {
        let before = Utc::now();
        let text = Codec::new()
            .encode(Event::PostDeleted { post_id: "5".into() })
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["version"], "v1");
        assert_eq!(value["type"], "event");
        assert_eq!(value["eventType"], "post_deleted");
        assert_eq!(value["postId"], "5");

        let stamped: DateTime<Utc> = value["timestamp"].as_str().unwrap().parse().unwrap();
        assert!(stamped >= before);
    }

    #[test]
    fn unsupported_version_rejected_before_payload_is_read() {
        // The payload is garbage for every event shape; the version check must win.
        let text = r#"{"version":"v99","type":"event","eventType":"no_such_event","postId":42}"#;
        let err = Codec::new().decode_envelope(text).unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::Protocol(ProtocolErrorKind::UnsupportedVersion("v99".into()))
        );
    }

    #[test]
    fn envelope_without_version_is_invalid() {
        let err = Codec::new()
            .decode_envelope(r#"{"type":"event","eventType":"post_deleted","postId":"1"}"#)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_frame");
    }

    #[test]
    fn control_frames_decode_by_type() {
        let codec = Codec::new();

        assert_eq!(
            codec
                .decode_control(r#"{"type":"unsubscribe","channels":["circle:42"]}"#)
                .unwrap(),
            ControlFrame::Unsubscribe {
                channels: vec!["circle:42".into()]
            }
        );
        assert_eq!(
            codec
                .decode_control(r#"{"version":"v1","type":"auth","token":"t"}"#)
                .unwrap(),
            ControlFrame::Auth { token: "t".into() }
        );
    }

    #[test]
    fn control_frame_failures() {
        let codec = Codec::new();
        let cases = [
            ("not json", ProtocolErrorKind::Malformed),
            (r#"{"type":"auth"}"#, ProtocolErrorKind::Malformed),
            (
                r#"{"channels":["posts"]}"#,
                ProtocolErrorKind::InvalidFrame("missing type".into()),
            ),
            (
                r#"{"type":"publish","channels":["posts"]}"#,
                ProtocolErrorKind::UnknownControlType("publish".into()),
            ),
            (
                r#"{"type":"event","eventType":"new_post"}"#,
                ProtocolErrorKind::ClientEventFrame,
            ),
            (
                r#"{"type":"subscribe","channels":[]}"#,
                ProtocolErrorKind::InvalidFrame("no channels".into()),
            ),
            (
                r#"{"version":"v0","type":"auth","token":"t"}"#,
                ProtocolErrorKind::UnsupportedVersion("v0".into()),
            ),
        ];

        for (text, expected) in cases {
            let err = codec.decode_control(text).unwrap_err();
            assert_eq!(err.error_kind, ErrorKind::Protocol(expected), "{text}");
        }
    }

    #[test]
    fn too_many_channels_is_invalid() {
        let channels: Vec<String> = (0..=MAX_CHANNELS_PER_FRAME)
            .map(|i| format!("post:{i}"))
            .collect();
        let text = json!({"type": "subscribe", "channels": channels}).to_string();

        let err = Codec::new().decode_control(&text).unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Protocol(ProtocolErrorKind::InvalidFrame("too many channels".into()))
        );
    }

    #[test]
    fn migrate_same_version_passes_through() {
        let bytes = br#"{"version":"v1"}"#;
        assert_eq!(Codec::new().migrate(bytes, "v1", "v1").unwrap(), bytes.to_vec());
    }

    #[test]
    fn migrate_between_distinct_versions_is_not_implemented() {
        let err = Codec::new().migrate(b"{}", "v1", "v2").unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Protocol(ProtocolErrorKind::MigrationNotImplemented {
                from: "v1".into(),
                to: "v2".into()
            })
        );
    }

    #[test]
    fn migrate_uses_registered_function() {
        fn upgrade(bytes: &[u8]) -> Result<Vec<u8>, Error> {
            let mut out = bytes.to_vec();
            out.extend_from_slice(b"!");
            Ok(out)
        }

        let mut codec = Codec::new();
        codec.register_migration("v1", "v2", upgrade);
        assert_eq!(codec.migrate(b"x", "v1", "v2").unwrap(), b"x!".to_vec());
    }

    #[test]
    fn migrate_from_unknown_version_to_itself_fails() {
        let err = Codec::new().migrate(b"{}", "v99", "v99").unwrap_err();
        assert_eq!(err.code(), "unsupported_version");
    }
}
