//! Client representation
//!
//! `Client` models one connected remote peer. It holds the sending side of
//! the per-connection channel drained by the transport's writer task, and the
//! broker subscriptions the peer has opened, keyed by subject.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::{Broker, Message, Subscription};
use crate::transport::message::ServerMessage;
use crate::utils::error::Result;

#[derive(Debug)]
pub struct Client {
    pub id: String,
    pub sender: UnboundedSender<WsMessage>,
    subscriptions: HashMap<String, Subscription<Message>>,
}

impl Client {
    /// Create a new client with a sender channel. The `id` is a UUID used
    /// in log fields.
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            subscriptions: HashMap::new(),
        }
    }

    /// Queue a frame for the writer task. Returns `false` if the peer is gone.
    pub fn send(&self, frame: &ServerMessage) -> bool {
        deliver(&self.sender, &self.id, frame)
    }

    /// Subscribe this peer to `subject`, forwarding each delivered message.
    ///
    /// Returns `Ok(false)` if the peer already holds a subscription on it.
    pub fn subscribe(&mut self, broker: &Broker<Message>, subject: &str) -> Result<bool> {
        if self.subscriptions.contains_key(subject) {
            return Ok(false);
        }

        let sender = self.sender.clone();
        let client_id = self.id.clone();
        let subscription = broker.subscribe(subject, move |msg: Message| {
            deliver(&sender, &client_id, &ServerMessage::from(msg));
        })?;

        debug!(client = %self.id, subject, "client subscribed");
        self.subscriptions.insert(subject.to_string(), subscription);
        Ok(true)
    }

    /// Drop the subscription on `subject`. Returns `false` if there was none.
    pub fn unsubscribe(&mut self, subject: &str) -> bool {
        match self.subscriptions.remove(subject) {
            Some(subscription) => {
                subscription.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// Unsubscribe from everything; called when the connection ends.
    pub fn unsubscribe_all(&mut self) {
        for (_, subscription) in self.subscriptions.drain() {
            subscription.unsubscribe();
        }
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }
}

fn deliver(sender: &UnboundedSender<WsMessage>, client_id: &str, frame: &ServerMessage) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            warn!(client = %client_id, error = %e, "failed to serialize frame");
            return false;
        }
    };
    if sender.send(WsMessage::text(text)).is_err() {
        warn!(client = %client_id, "send to client failed");
        return false;
    }
    true
}
