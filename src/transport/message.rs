//! JSON frames exchanged with remote peers, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::broker::Message;

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { subject: String },
    Unsubscribe { subject: String },
    Publish { subject: String, payload: String },
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        subject: String,
    },
    Unsubscribed {
        subject: String,
    },
    Published {
        subject: String,
    },
    Message {
        subject: String,
        payload: String,
        timestamp: i64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The broker is closed (shutting down).
    Unavailable,
    NotSubscribed,
    InvalidFrame,
    Internal,
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

impl From<Message> for ServerMessage {
    fn from(msg: Message) -> Self {
        ServerMessage::Message {
            subject: msg.subject,
            payload: msg.payload,
            timestamp: msg.timestamp,
        }
    }
}
