//! Publisher and PubSub contracts
//!
//! Every backend adapter implements these traits; the rest of the platform
//! only ever holds `Box<dyn Publisher>` or `Arc<dyn PubSub>`.
//!
//! Blocking behavior: `publish`, `subscribe` and `unsubscribe` may perform
//! network I/O and can take up to the adapter's operation timeout.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::message::Message;
use crate::utils::error::{Error, Result};

/// Callback pair bound to one subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Invoked once per delivered message. Errors are logged by the adapter
    /// and delivery continues.
    async fn handle(&self, msg: Message) -> Result<()>;

    /// Invoked exactly once when the subscription is torn down.
    async fn cancel(&self) -> Result<()>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Hands `msg` to the backend on `topic`.
    ///
    /// Returning `Ok` means the backend accepted the message, not that any
    /// subscriber received it.
    async fn publish(&self, topic: &str, msg: &Message) -> Result<()>;

    /// Releases backend connections. Calling it more than once is a no-op.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PubSub: Publisher {
    /// Binds `handler` to `topic` on behalf of subscriber `id`.
    ///
    /// Adapters differ on an existing live subscription for the same pair:
    /// some replace it, others fail with [`Error::AlreadySubscribed`].
    async fn subscribe(&self, id: &str, topic: &str, handler: Arc<dyn MessageHandler>)
    -> Result<()>;

    /// Tears down the subscription of `id` on `topic`, running the handler's
    /// cancel callback and propagating its error.
    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<()>;
}

/// Precondition shared by every `publish` implementation. No network call is
/// attempted when it fails.
pub fn validate_publish(topic: &str, msg: &Message) -> Result<()> {
    if topic.is_empty() || msg.channel.is_empty() {
        return Err(Error::EmptyTopic);
    }
    Ok(())
}

/// Precondition shared by every `subscribe`/`unsubscribe` implementation.
pub fn validate_subscription(id: &str, topic: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::EmptyId);
    }
    if topic.is_empty() {
        return Err(Error::EmptyTopic);
    }
    Ok(())
}
