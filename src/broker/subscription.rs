//! Subscriptions and their delivery workers
//!
//! Each subscription owns an unbounded FIFO (a tokio `mpsc` channel) and a
//! dedicated OS thread that drains it, invoking the handler once per message.
//! The handler is therefore never called concurrently with itself, and
//! messages reach it in exactly the order they were enqueued.
//!
//! Draining is expressed by dropping the sending half: the worker keeps
//! delivering until the channel reports closed, which happens only after the
//! last queued message has been received.
//!
//! A message published at the same instant as `unsubscribe` may land on
//! either side of the cut. That nondeterminism is accepted; callers that need
//! a hard boundary must stop publishing before unsubscribing.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error};
use uuid::Uuid;

use crate::broker::engine::Shared;
use crate::utils::error::Result;

pub type SubscriptionId = Uuid;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Accepting enqueues and delivering.
    Running,
    /// No longer accepting enqueues; already-queued messages are still delivered.
    Draining,
    /// Queue empty, worker stopped.
    Terminated,
}

/// The broker-side half of a subscription: the enqueue end of its queue.
pub(crate) struct Mailbox<M> {
    id: SubscriptionId,
    subject: String,
    sender: Mutex<Option<mpsc::UnboundedSender<M>>>,
    terminated: Arc<AtomicBool>,
}

impl<M> Mailbox<M> {
    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn subject(&self) -> &str {
        &self.subject
    }

    /// Append to the queue. Silently ignored once draining.
    pub(crate) fn enqueue(&self, message: M) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = sender.as_ref() {
            // Only fails if the worker is gone, which means it was told to drain.
            let _ = tx.send(message);
        }
    }

    /// Stop accepting enqueues and let the worker finish what is queued.
    pub(crate) fn drain(&self) {
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.take().is_some() {
            debug!(subject = %self.subject, id = %self.id, "subscription draining");
        }
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        if self.terminated.load(Ordering::Acquire) {
            return SubscriptionState::Terminated;
        }
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.is_some() {
            SubscriptionState::Running
        } else {
            SubscriptionState::Draining
        }
    }
}

/// Decrements the broker's live-worker count when the worker exits, however it exits.
pub(crate) struct LiveGuard(Arc<watch::Sender<usize>>);

impl LiveGuard {
    pub(crate) fn acquire(live: &Arc<watch::Sender<usize>>) -> Self {
        live.send_modify(|n| *n += 1);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Create the mailbox for a new subscription and start its worker thread.
///
/// The worker holds only the receiving end and the termination flag, never
/// the mailbox itself, so dropping every mailbox reference also closes the
/// queue.
pub(crate) fn spawn<M, F>(
    subject: &str,
    handler: F,
    live: &Arc<watch::Sender<usize>>,
) -> Result<Arc<Mailbox<M>>>
where
    M: Send + 'static,
    F: FnMut(M) + Send + 'static,
{
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    let terminated = Arc::new(AtomicBool::new(false));

    let worker = Worker {
        id,
        subject: subject.to_string(),
        queue: rx,
        handler,
        terminated: Arc::clone(&terminated),
        _live: LiveGuard::acquire(live),
    };

    // On spawn failure the closure is dropped, and the guard with it.
    thread::Builder::new()
        .name(format!("subpub-worker-{}", id.simple()))
        .spawn(move || worker.run())?;

    Ok(Arc::new(Mailbox {
        id,
        subject: subject.to_string(),
        sender: Mutex::new(Some(tx)),
        terminated,
    }))
}

struct Worker<M, F> {
    id: SubscriptionId,
    subject: String,
    queue: mpsc::UnboundedReceiver<M>,
    handler: F,
    terminated: Arc<AtomicBool>,
    _live: LiveGuard,
}

impl<M, F> Worker<M, F>
where
    F: FnMut(M),
{
    fn run(mut self) {
        debug!(subject = %self.subject, id = %self.id, "delivery worker started");

        while let Some(message) = self.queue.blocking_recv() {
            let handler = &mut self.handler;
            // Isolate-and-continue: a panicking handler loses only the message it panicked on.
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
                error!(
                    subject = %self.subject,
                    id = %self.id,
                    reason = %panic_message(panic.as_ref()),
                    "handler panicked; continuing with next message"
                );
            }
        }

        self.terminated.store(true, Ordering::Release);
        debug!(subject = %self.subject, id = %self.id, "delivery worker terminated");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle returned by [`Broker::subscribe`](crate::broker::Broker::subscribe).
///
/// Dropping the handle does not unsubscribe; the registration lives until
/// [`unsubscribe`](Self::unsubscribe) or broker close.
pub struct Subscription<M> {
    mailbox: Arc<Mailbox<M>>,
    broker: Weak<Shared<M>>,
}

impl<M> Subscription<M> {
    pub(crate) fn new(mailbox: Arc<Mailbox<M>>, broker: Weak<Shared<M>>) -> Self {
        Self { mailbox, broker }
    }

    pub fn id(&self) -> SubscriptionId {
        self.mailbox.id()
    }

    pub fn subject(&self) -> &str {
        self.mailbox.subject()
    }

    pub fn state(&self) -> SubscriptionState {
        self.mailbox.state()
    }

    /// Remove this subscription from its subject and start draining.
    ///
    /// Messages already queued are still delivered, in order. Calling this
    /// more than once is a no-op.
    pub fn unsubscribe(&self) {
        match self.broker.upgrade() {
            Some(shared) => shared.remove(&self.mailbox),
            None => self.mailbox.drain(),
        }
    }
}

impl<M> fmt::Debug for Subscription<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("subject", &self.subject())
            .field("state", &self.state())
            .finish()
    }
}
