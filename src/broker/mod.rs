//! msgbus broker core
//!
//! Backend-agnostic pieces every adapter and bridge builds on:
//! - `message`: the canonical envelope and its binary codec
//! - `topic`: the `channels.<channel>[.<subtopic>]` grammar
//! - `pubsub`: the Publisher / PubSub / MessageHandler contracts
//! - `subscription`: per-subscription workers and the subscription registry

pub mod message;
pub mod pubsub;
pub mod subscription;
pub mod topic;

pub use message::Message;
pub use pubsub::{MessageHandler, PubSub, Publisher};
pub use subscription::{Subscription, SubscriptionRegistry, Worker};

#[cfg(test)]
pub(crate) mod testing;
