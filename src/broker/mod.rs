pub mod engine;
pub mod message;
mod subject;
pub mod subscription;

pub use engine::Broker;
pub use message::Message;
pub use subscription::{Subscription, SubscriptionId, SubscriptionState};

#[cfg(test)]
mod tests;
