//! In-process backend
//!
//! A broker-less PubSub that routes messages between subscribers of the same
//! process. Topic matching follows NATS wildcard rules and a repeated
//! subscribe for the same `(id, topic)` replaces the live subscription, so it
//! behaves like the JetStream adapter minus durability.
//!
//! Useful for tests and single-process development; it is not reachable
//! through the backend selector.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::message::Message;
use crate::broker::pubsub::{
    MessageHandler, PubSub, Publisher, validate_publish, validate_subscription,
};
use crate::broker::subscription::{Subscription, SubscriptionRegistry, Worker, deliver};
use crate::broker::topic;
use crate::utils::error::{Error, Result};

type Inbox = mpsc::UnboundedSender<Vec<u8>>;

#[derive(Debug, Default)]
pub struct InMemoryPubSub {
    registry: SubscriptionRegistry<Inbox>,
    closed: AtomicBool,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for InMemoryPubSub {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
        validate_publish(topic, msg)?;
        self.ensure_open()?;

        let data = msg.encode();
        let inboxes = self
            .registry
            .collect_matching(|pattern| topic::matches(pattern, topic), |_, tx| tx.clone());

        if inboxes.is_empty() {
            debug!("no subscribers for {topic}");
        }
        for inbox in inboxes {
            // A closed inbox belongs to a subscription being torn down.
            let _ = inbox.send(data.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for (topic, id, sub) in self.registry.drain() {
            let (_, cancelled) = sub.shutdown().await;
            if let Err(e) = cancelled {
                warn!(subscriber = %id, topic = %topic, "cancel failed during close: {e}");
            }
        }
        info!("in-memory pubsub closed");
        Ok(())
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn subscribe(
        &self,
        id: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        validate_subscription(id, topic)?;
        self.ensure_open()?;

        if let Some(old) = self.registry.remove(topic, id) {
            let (_, cancelled) = old.shutdown().await;
            if let Err(e) = cancelled {
                warn!(subscriber = %id, topic = %topic, "cancel of replaced subscription failed: {e}");
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let worker = {
            let handler = handler.clone();
            let (id, topic) = (id.to_string(), topic.to_string());
            Worker::spawn(move |mut stopped| async move {
                loop {
                    tokio::select! {
                        _ = &mut stopped => break,
                        data = rx.recv() => match data {
                            Some(data) => deliver(handler.as_ref(), &id, &topic, &data).await,
                            None => break,
                        },
                    }
                }
            })
        };

        let mut pending = Subscription::new(handler, tx, worker);
        loop {
            match self.registry.insert(topic, id, pending) {
                Ok(()) => break,
                Err(back) => {
                    pending = back;
                    if let Some(raced) = self.registry.remove(topic, id) {
                        let (_, cancelled) = raced.shutdown().await;
                        if let Err(e) = cancelled {
                            warn!(subscriber = %id, topic = %topic, "cancel of raced subscription failed: {e}");
                        }
                    }
                }
            }
        }
        // A close that started after the check above has already drained
        // the registry.
        if self.closed.load(Ordering::SeqCst) {
            if let Some(late) = self.registry.remove(topic, id) {
                late.discard().await;
            }
            return Err(Error::Closed);
        }
        debug!("{id} subscribed to {topic}");
        Ok(())
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<()> {
        validate_subscription(id, topic)?;
        let sub = self.registry.remove(topic, id).ok_or(Error::NotSubscribed)?;
        let (_, cancelled) = sub.shutdown().await;
        debug!("{id} unsubscribed from {topic}");
        cancelled
    }
}
