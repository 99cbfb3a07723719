//! The message type carried by the server's broker.
//!
//! The broker itself is generic over its payload; `Message` is what the
//! WebSocket service publishes and forwards to remote subscribers.

use serde::{Deserialize, Serialize};

/// A published message.
///
/// - `subject` - The subject it was published on.
/// - `payload` - Opaque text supplied by the publisher.
/// - `timestamp` - Milliseconds since the Unix epoch, set when the message is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub subject: String,
    pub payload: String,
    pub timestamp: i64,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
