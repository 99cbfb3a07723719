//! # subpub
//!
//! `subpub` is an in-process publish/subscribe broker. Independent parts of a
//! program exchange asynchronous messages keyed by a subject name through a
//! shared [`Broker`], without referring to each other.
//!
//! Each subscription gets its own unbounded queue and delivery thread, so a
//! slow handler only ever delays itself. Shutdown is coordinated and
//! deadline-bounded: [`Broker::close`] waits for every queue to drain, and
//! gives up with an error (leaving the stragglers to finish) once the
//! deadline passes.
//!
//! ```rust
//! use std::sync::mpsc;
//! use subpub::Broker;
//!
//! let broker = Broker::new();
//! let (tx, rx) = mpsc::channel();
//! broker.subscribe("topic", move |n: i32| tx.send(n).unwrap())?;
//! broker.publish("topic", 1)?;
//! assert_eq!(rx.recv().unwrap(), 1);
//! # Ok::<(), subpub::BrokerError>(())
//! ```
//!
//! ## Modules
//!
//! - `broker`: the engine, subscriptions and the `Message` type served remotely.
//! - `client`: per-connection state of a remote peer.
//! - `config`: loads server settings from file and environment.
//! - `transport`: the WebSocket service exposing a broker to remote peers.
//! - `utils`: the error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::{Broker, Message, Subscription, SubscriptionId, SubscriptionState};
pub use utils::error::BrokerError;
