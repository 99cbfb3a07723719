//! The `error` module defines the error type surfaced by the broker.
//!
//! Every failure is returned synchronously to the direct caller; nothing in
//! the broker retries internally.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by [`Broker`](crate::broker::Broker) operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The broker has transitioned to closed; no subscribe or publish is accepted.
    #[error("broker is closed")]
    Closed,

    /// `close` gave up waiting for subscriptions to drain. The remaining
    /// workers keep running in the background.
    #[error("close deadline {deadline:?} exceeded; {outstanding} subscription(s) still draining")]
    DeadlineExceeded {
        deadline: Duration,
        outstanding: usize,
    },

    /// `close_with` observed its cancellation signal before the drain finished.
    #[error("close cancelled; {outstanding} subscription(s) still draining")]
    Cancelled { outstanding: usize },

    /// The delivery worker thread could not be started.
    #[error("failed to spawn delivery worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

impl BrokerError {
    /// Short stable label (snake_case) for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::Closed => "broker_closed",
            BrokerError::DeadlineExceeded { .. } => "close_deadline_exceeded",
            BrokerError::Cancelled { .. } => "close_cancelled",
            BrokerError::WorkerSpawn(_) => "worker_spawn_failed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, BrokerError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
