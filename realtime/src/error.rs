//! Error types for the `realtime` crate.
//!
//! Follows the platform's layered error pattern: a root `Error` struct holding
//! an `ErrorKind` tree and an optional boxed source. The kinds mirror how a
//! failure affects the connection that caused it:
//!
//! - `Protocol`: fatal to the connection, no retry on the same socket.
//! - `Auth`: fatal to the handshake attempt, the socket stays open.
//! - `Authorization`: reported per subscribe request, never fatal.
//! - `Delivery`: fatal only to the destination connection, never surfaced to publishers.

use crate::authorizer::DenyReason;
use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in the real-time layer.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    Protocol(ProtocolErrorKind),
    Auth(AuthErrorKind),
    Authorization(DenyReason),
    Delivery(DeliveryErrorKind),
    Internal(InternalErrorKind),
}

/// Malformed or disallowed traffic from a client.
#[derive(Debug, PartialEq)]
pub enum ProtocolErrorKind {
    Malformed,
    UnsupportedVersion(String),
    UnknownControlType(String),
    /// Clients may only send control frames.
    ClientEventFrame,
    InvalidFrame(String),
    FrameTooLarge,
    BinaryFrame,
    NotAuthenticated,
    AlreadyAuthenticated,
    MigrationNotImplemented { from: String, to: String },
}

/// Handshake failures.
#[derive(Debug, PartialEq)]
pub enum AuthErrorKind {
    MissingToken,
    InvalidToken,
    Expired,
}

#[derive(Debug, PartialEq)]
pub enum DeliveryErrorKind {
    QueueFull,
    QueueClosed,
}

#[derive(Debug, PartialEq)]
pub enum InternalErrorKind {
    Encode,
    HubUnavailable,
}

impl Error {
    /// Whether this error must terminate the connection that produced it.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.error_kind,
            ErrorKind::Protocol(_) | ErrorKind::Delivery(_) | ErrorKind::Internal(_)
        )
    }

    /// Machine readable code sent to clients in `error` and `auth_error` frames.
    pub fn code(&self) -> &'static str {
        match &self.error_kind {
            ErrorKind::Protocol(kind) => match kind {
                ProtocolErrorKind::Malformed => "malformed_frame",
                ProtocolErrorKind::UnsupportedVersion(_) => "unsupported_version",
                ProtocolErrorKind::UnknownControlType(_) => "unknown_control_type",
                ProtocolErrorKind::ClientEventFrame => "event_frame_not_allowed",
                ProtocolErrorKind::InvalidFrame(_) => "invalid_frame",
                ProtocolErrorKind::FrameTooLarge => "frame_too_large",
                ProtocolErrorKind::BinaryFrame => "binary_frame_not_allowed",
                ProtocolErrorKind::NotAuthenticated => "not_authenticated",
                ProtocolErrorKind::AlreadyAuthenticated => "already_authenticated",
                ProtocolErrorKind::MigrationNotImplemented { .. } => "migration_not_implemented",
            },
            ErrorKind::Auth(kind) => match kind {
                AuthErrorKind::MissingToken => "missing_token",
                AuthErrorKind::InvalidToken => "invalid_token",
                AuthErrorKind::Expired => "token_expired",
            },
            ErrorKind::Authorization(reason) => reason.as_str(),
            ErrorKind::Delivery(_) => "delivery_failed",
            ErrorKind::Internal(_) => "internal_error",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Protocol(kind) => write!(f, "Protocol error: {:?}", kind),
            ErrorKind::Auth(kind) => write!(f, "Authentication error: {:?}", kind),
            ErrorKind::Authorization(reason) => write!(f, "Authorization denied: {:?}", reason),
            ErrorKind::Delivery(kind) => write!(f, "Delivery error: {:?}", kind),
            ErrorKind::Internal(kind) => write!(f, "Internal error: {:?}", kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

// Inbound JSON that fails to parse is a client problem; outbound encode
// failures are constructed explicitly with `internal_error`.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Protocol(ProtocolErrorKind::Malformed),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        let kind = match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthErrorKind::Expired,
            _ => AuthErrorKind::InvalidToken,
        };
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Auth(kind),
        }
    }
}

impl From<DenyReason> for Error {
    fn from(reason: DenyReason) -> Self {
        Error {
            source: None,
            error_kind: ErrorKind::Authorization(reason),
        }
    }
}

/// Helper function to create protocol errors.
pub fn protocol_error(kind: ProtocolErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Protocol(kind),
    }
}

/// Helper function to create authentication errors.
pub fn auth_error(kind: AuthErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Auth(kind),
    }
}

/// Helper function to create delivery errors.
pub fn delivery_error(kind: DeliveryErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Delivery(kind),
    }
}

/// Helper function to create internal errors.
pub fn internal_error(kind: InternalErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Internal(kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_connection_fatal() {
        let err = protocol_error(ProtocolErrorKind::Malformed, "bad json");
        assert!(err.is_connection_fatal());
        assert_eq!(err.code(), "malformed_frame");
    }

    #[test]
    fn auth_and_authorization_errors_are_not_connection_fatal() {
        assert!(!auth_error(AuthErrorKind::Expired, "old").is_connection_fatal());

        let denied = Error::from(DenyReason::NotMember);
        assert!(!denied.is_connection_fatal());
        assert_eq!(denied.code(), "not_member");
    }

    #[test]
    fn serde_errors_map_to_malformed() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(
            err.error_kind,
            ErrorKind::Protocol(ProtocolErrorKind::Malformed)
        );
        assert!(err.source().is_some());
    }
}
