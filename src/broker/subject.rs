//! Subject membership
//!
//! A `Subject` holds the subscriptions currently registered under one name,
//! in insertion order. Fan-out order follows that order, but callers must not
//! rely on it.
//!
//! Concurrency note: callers must synchronize access to `Subject` (the broker
//! keeps every subject behind its registry lock).

use std::sync::Arc;

use crate::broker::subscription::{Mailbox, SubscriptionId};

pub(crate) struct Subject<M> {
    pub name: String,
    subscribers: Vec<Arc<Mailbox<M>>>,
}

impl<M> Subject<M> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, mailbox: Arc<Mailbox<M>>) {
        self.subscribers.push(mailbox);
    }

    /// Remove the subscription with `id`. Returns the removed mailbox, if it was present.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<Arc<Mailbox<M>>> {
        let pos = self.subscribers.iter().position(|m| m.id() == id)?;
        Some(self.subscribers.remove(pos))
    }

    /// Copy of the current subscriber list, for delivery outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<Mailbox<M>>> {
        self.subscribers.clone()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn into_subscribers(self) -> Vec<Arc<Mailbox<M>>> {
        self.subscribers
    }
}
