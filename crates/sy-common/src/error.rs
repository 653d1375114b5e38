//! Runtime failure taxonomy carried on exchanges
//!
//! `MediationError` is the failure a processor raises while an exchange is in
//! flight. Exception policies match on `ErrorKind`, which forms a closed
//! hierarchy; specificity is the number of `parent()` hops between the raised
//! kind and the kind a policy declares.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed hierarchy of runtime failure kinds.
///
/// `Any` is the root and matches every failure. `Timeout` and `Cancelled` are
/// distinct so callers can tell "gave up waiting" from "processing raised an
/// error".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Root of the hierarchy, matches any failure
    Any,
    /// A processing stage failed
    Processing,
    /// Input failed validation (child of Processing)
    Validation,
    /// A transformation step failed (child of Processing)
    Transform,
    /// Failure talking to an external collaborator
    Transport,
    /// Connection-level failure (child of Transport)
    Connection,
    /// Peer violated the expected protocol (child of Transport)
    ProtocolViolation,
    /// An operation gave up waiting
    Timeout,
    /// The exchange was cancelled before completion
    Cancelled,
    /// A single-read stream body was consumed more than once
    StreamConsumed,
    /// A recipient URI did not resolve to a registered endpoint
    NoSuchEndpoint,
}

impl ErrorKind {
    /// Parent kind in the hierarchy, `None` for the root.
    pub fn parent(&self) -> Option<ErrorKind> {
        match self {
            ErrorKind::Any => None,
            ErrorKind::Validation | ErrorKind::Transform => Some(ErrorKind::Processing),
            ErrorKind::Connection | ErrorKind::ProtocolViolation => Some(ErrorKind::Transport),
            _ => Some(ErrorKind::Any),
        }
    }

    /// Number of parent hops from `self` up to `ancestor`, or `None` if
    /// `ancestor` is not on the parent chain. Distance 0 means an exact match.
    pub fn distance_to(&self, ancestor: ErrorKind) -> Option<u32> {
        let mut current = *self;
        let mut distance = 0;
        loop {
            if current == ancestor {
                return Some(distance);
            }
            current = current.parent()?;
            distance += 1;
        }
    }

    /// Whether `self` is `ancestor` or a descendant of it.
    pub fn is_a(&self, ancestor: ErrorKind) -> bool {
        self.distance_to(ancestor).is_some()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Any => "any",
            ErrorKind::Processing => "processing",
            ErrorKind::Validation => "validation",
            ErrorKind::Transform => "transform",
            ErrorKind::Transport => "transport",
            ErrorKind::Connection => "connection",
            ErrorKind::ProtocolViolation => "protocol-violation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StreamConsumed => "stream-consumed",
            ErrorKind::NoSuchEndpoint => "no-such-endpoint",
        };
        write!(f, "{}", name)
    }
}

/// A runtime mediation failure attached to an exchange.
///
/// Cloneable so it can travel between the exchange, redelivery state and the
/// caught-exception property without ownership gymnastics.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct MediationError {
    kind: ErrorKind,
    message: String,
}

impl MediationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Processing, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn transform(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transform, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn stream_consumed() -> Self {
        Self::new(
            ErrorKind::StreamConsumed,
            "stream body was already consumed and caching is not enabled",
        )
    }

    pub fn no_such_endpoint(uri: &str) -> Self {
        Self::new(
            ErrorKind::NoSuchEndpoint,
            format!("no endpoint registered for uri '{}'", uri),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// JSON form used when the failure is stashed in an exchange property.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "kind": self.kind, "message": self.message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_walks_parent_chain() {
        assert_eq!(ErrorKind::Validation.distance_to(ErrorKind::Validation), Some(0));
        assert_eq!(ErrorKind::Validation.distance_to(ErrorKind::Processing), Some(1));
        assert_eq!(ErrorKind::Validation.distance_to(ErrorKind::Any), Some(2));
        assert_eq!(ErrorKind::Validation.distance_to(ErrorKind::Transport), None);
    }

    #[test]
    fn test_any_is_universal_ancestor() {
        for kind in [
            ErrorKind::Processing,
            ErrorKind::Connection,
            ErrorKind::Timeout,
            ErrorKind::Cancelled,
        ] {
            assert!(kind.is_a(ErrorKind::Any));
        }
        assert!(!ErrorKind::Any.is_a(ErrorKind::Processing));
    }

    #[test]
    fn test_error_display() {
        let err = MediationError::validation("bad payload");
        assert_eq!(err.to_string(), "validation error: bad payload");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
