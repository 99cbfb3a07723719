//! The `client` module represents a remote peer connected to the service.
//!
//! It provides the `Client` struct, which holds the peer's identifier, the
//! channel for sending frames to it, and the broker subscriptions it owns.

pub mod pubsub_client;
pub use pubsub_client::Client;
