//! Broker engine
//!
//! This module contains the in-process broker responsible for:
//! - managing subjects and their subscription lists
//! - fanning published messages out to every subscription of a subject
//! - coordinated, deadline-bounded shutdown of all delivery workers
//!
//! Concurrency and usage notes:
//! - `subscribe` and `publish` are synchronous and may be called from any
//!   thread, inside or outside a tokio runtime. `close` is async and must be
//!   awaited on a tokio runtime (it uses `tokio::time`).
//! - The registry lock is only ever held for map mutation or for copying a
//!   subscriber list. Handlers never run under it, so a slow handler cannot
//!   stall publishers or other subscriptions.
//! - After a `close` deadline expires the remaining workers are abandoned, not
//!   killed: they finish draining in the background and their resources are
//!   released when they exit.

use std::collections::HashMap;
use std::fmt;
use std::future::{self, Future};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::subject::Subject;
use crate::broker::subscription::{self, Mailbox, Subscription};
use crate::utils::error::{BrokerError, Result};

struct Registry<M> {
    subjects: HashMap<String, Subject<M>>,
    closed: bool,
}

pub(crate) struct Shared<M> {
    registry: RwLock<Registry<M>>,
    /// Number of delivery workers that have not terminated yet.
    live: Arc<watch::Sender<usize>>,
}

impl<M> Shared<M> {
    fn read(&self) -> RwLockReadGuard<'_, Registry<M>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry<M>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unregister `mailbox` and start draining it. Idempotent.
    pub(crate) fn remove(&self, mailbox: &Mailbox<M>) {
        let mut registry = self.write();
        if let Some(subject) = registry.subjects.get_mut(mailbox.subject()) {
            subject.unsubscribe(mailbox.id());
            if subject.is_empty() {
                registry.subjects.remove(mailbox.subject());
            }
        }
        mailbox.drain();
    }
}

/// In-process publish/subscribe broker.
///
/// Cloning a `Broker` yields another handle to the same broker. Separate
/// `Broker::new()` instances share nothing.
pub struct Broker<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for Broker<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M> Default for Broker<M>
where
    M: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Broker<M>
where
    M: Clone + Send + 'static,
{
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(Registry {
                    subjects: HashMap::new(),
                    closed: false,
                }),
                live: Arc::new(live),
            }),
        }
    }

    /// Register `handler` for `subject` and start its delivery worker.
    ///
    /// The handler runs on a dedicated thread, one message at a time, in
    /// publish order. A panic inside it is logged and delivery continues with
    /// the next message.
    pub fn subscribe<F>(&self, subject: &str, handler: F) -> Result<Subscription<M>>
    where
        F: FnMut(M) + Send + 'static,
    {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        // Started outside the lock; re-checked below in case close won the race.
        let mailbox = subscription::spawn(subject, handler, &self.shared.live)?;
        let mut registry = self.shared.write();
        if registry.closed {
            drop(registry);
            mailbox.drain();
            return Err(BrokerError::Closed);
        }
        registry
            .subjects
            .entry(subject.to_string())
            .or_insert_with(|| Subject::new(subject))
            .subscribe(Arc::clone(&mailbox));
        drop(registry);

        debug!(subject, id = %mailbox.id(), "subscribed");
        Ok(Subscription::new(mailbox, Arc::downgrade(&self.shared)))
    }

    /// Enqueue `message` for every current subscriber of `subject`.
    ///
    /// Returns once every enqueue has completed; it never waits for a handler.
    /// Publishing to a subject nobody listens on is not an error. A message
    /// racing with `unsubscribe` or `close` may be dropped for the
    /// subscriptions being drained.
    pub fn publish(&self, subject: &str, message: M) -> Result<()> {
        let subscribers = {
            let registry = self.shared.read();
            if registry.closed {
                return Err(BrokerError::Closed);
            }
            match registry.subjects.get(subject) {
                Some(s) => s.snapshot(),
                None => return Ok(()),
            }
        };

        if let Some((last, rest)) = subscribers.split_last() {
            for mailbox in rest {
                mailbox.enqueue(message.clone());
            }
            last.enqueue(message);
        }
        Ok(())
    }

    /// Close the broker and wait for every subscription to drain.
    ///
    /// `None` waits without limit. If the deadline elapses first this returns
    /// [`BrokerError::DeadlineExceeded`]; the workers still running are left
    /// to finish on their own. Calling `close` on a closed broker returns
    /// `Ok(())` immediately.
    pub async fn close(&self, deadline: Option<Duration>) -> Result<()> {
        match deadline {
            None => self.close_with(future::pending::<()>()).await,
            Some(deadline) => {
                self.close_with(tokio::time::sleep(deadline))
                    .await
                    .map_err(|e| match e {
                        BrokerError::Cancelled { outstanding } => BrokerError::DeadlineExceeded {
                            deadline,
                            outstanding,
                        },
                        other => other,
                    })
            }
        }
    }

    /// Like [`close`](Self::close), but stops waiting when `cancel` resolves.
    pub async fn close_with<F>(&self, cancel: F) -> Result<()>
    where
        F: Future,
    {
        let mailboxes: Vec<Arc<Mailbox<M>>> = {
            let mut registry = self.shared.write();
            if registry.closed {
                return Ok(());
            }
            registry.closed = true;
            registry
                .subjects
                .drain()
                .flat_map(|(_, subject)| subject.into_subscribers())
                .collect()
        };

        info!(subscriptions = mailboxes.len(), "closing broker");
        for mailbox in &mailboxes {
            mailbox.drain();
        }
        drop(mailboxes);

        let mut live = self.shared.live.subscribe();
        tokio::select! {
            // A finished drain wins over a cancel signal that is ready at the same time.
            biased;

            // Err only if the sender is dropped, and `self` keeps it alive.
            _ = live.wait_for(|n| *n == 0) => {
                info!("broker closed; all subscriptions drained");
                Ok(())
            }
            _ = cancel => {
                let outstanding = self.outstanding();
                if outstanding == 0 {
                    info!("broker closed; all subscriptions drained");
                    return Ok(());
                }
                warn!(outstanding, "broker close abandoned before drain finished");
                Err(BrokerError::Cancelled { outstanding })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.read().closed
    }

    /// Number of subscriptions currently registered on `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.shared
            .read()
            .subjects
            .get(subject)
            .map_or(0, Subject::len)
    }

    /// Subjects with at least one subscriber, sorted.
    pub fn subjects(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .read()
            .subjects
            .values()
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of delivery workers that have not terminated yet.
    pub fn outstanding(&self) -> usize {
        *self.shared.live.borrow()
    }
}

impl<M> fmt::Debug for Broker<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.shared.read();
        f.debug_struct("Broker")
            .field("subjects", &registry.subjects.len())
            .field("closed", &registry.closed)
            .field("outstanding", &*self.shared.live.borrow())
            .finish()
    }
}
