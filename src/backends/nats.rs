//! NATS JetStream backend
//!
//! All channel traffic lives in one stream, `channels`, capturing
//! `channels.>`. Every subscription is a durable pull consumer filtered on
//! the subscribed topic, so it survives client reconnects and only sees
//! messages published after it was created.
//!
//! Subscribing again with the same `(id, topic)` replaces the live
//! subscription: the old one is cancelled and its consumer deleted first.

use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{AckPolicy, DeliverPolicy, pull},
    stream::{self, RetentionPolicy},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::broker::message::Message;
use crate::broker::pubsub::{
    MessageHandler, PubSub, Publisher, validate_publish, validate_subscription,
};
use crate::broker::subscription::{Subscription, SubscriptionRegistry, Worker, deliver};
use crate::broker::topic::ALL_CHANNELS;
use crate::config::MessagingSettings;
use crate::utils::error::{Error, Result};
use crate::utils::{connect_within, within};

const BACKEND: &str = "nats";

pub const STREAM_NAME: &str = "channels";
const STREAM_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const STREAM_MAX_MSG_SIZE: i32 = 1024 * 1024;
const STREAM_MAX_MSGS_PER_SUBJECT: i64 = 1_000_000;

/// Configuration of the `channels` stream.
pub fn stream_config() -> stream::Config {
    stream::Config {
        name: STREAM_NAME.to_string(),
        description: Some("stream for all channel messages".to_string()),
        subjects: vec![ALL_CHANNELS.to_string()],
        retention: RetentionPolicy::Limits,
        max_age: STREAM_MAX_AGE,
        max_message_size: STREAM_MAX_MSG_SIZE,
        max_messages_per_subject: STREAM_MAX_MSGS_PER_SUBJECT,
        ..Default::default()
    }
}

/// Durable consumer name for a subscription.
///
/// Durable names may not contain whitespace, `.`, `*`, `>` or path
/// separators, so those are flattened to `_` in the topic part.
pub fn consumer_name(topic: &str, id: &str) -> String {
    let topic: String = topic
        .chars()
        .map(|c| match c {
            ' ' | '.' | '*' | '>' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    format!("{topic}-{id}")
}

pub fn consumer_config(topic: &str, id: &str) -> pull::Config {
    let name = consumer_name(topic, id);
    pull::Config {
        name: Some(name.clone()),
        durable_name: Some(name),
        description: Some(format!("consumer of {id} for topic {topic}")),
        deliver_policy: DeliverPolicy::New,
        ack_policy: AckPolicy::Explicit,
        filter_subject: topic.to_string(),
        ..Default::default()
    }
}

pub struct NatsPublisher {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream: stream::Stream,
    timeout: Duration,
    closed: AtomicBool,
}

impl NatsPublisher {
    /// Connects to NATS and makes sure the `channels` stream exists.
    pub async fn connect(settings: &MessagingSettings) -> Result<Self> {
        let limit = settings.connect_timeout();
        let client =
            connect_within(BACKEND, limit, async_nats::connect(settings.url.as_str())).await?;
        let jetstream = jetstream::new(client.clone());
        let stream =
            connect_within(BACKEND, limit, jetstream.get_or_create_stream(stream_config())).await?;

        info!("connected to NATS at {}", settings.url);
        Ok(Self {
            client,
            jetstream,
            stream,
            timeout: settings.operation_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
        validate_publish(topic, msg)?;
        self.ensure_open()?;

        let ack = within(
            self.timeout,
            self.jetstream
                .publish(topic.to_string(), Bytes::from(msg.encode())),
        )
        .await?;
        within(self.timeout, ack.into_future()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        within(self.timeout, self.client.flush()).await?;
        info!("NATS publisher closed");
        Ok(())
    }
}

pub struct NatsPubSub {
    publisher: NatsPublisher,
    registry: SubscriptionRegistry<String>,
    closed: AtomicBool,
}

impl NatsPubSub {
    pub async fn connect(settings: &MessagingSettings) -> Result<Self> {
        Ok(Self {
            publisher: NatsPublisher::connect(settings).await?,
            registry: SubscriptionRegistry::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Stops the subscription and deletes its durable consumer. The cancel
    /// callback's error wins over a failed deletion.
    async fn release(&self, sub: Subscription<String>) -> Result<()> {
        let (name, cancelled) = sub.shutdown().await;
        let deleted = within(self.publisher.timeout, self.publisher.stream.delete_consumer(&name))
            .await
            .map(|_| ());
        if let Err(e) = &deleted {
            error!("failed to delete consumer {name}: {e}");
        }
        cancelled.and(deleted)
    }
}

#[async_trait]
impl Publisher for NatsPubSub {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
        self.publisher.publish(topic, msg).await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            for (topic, id, sub) in self.registry.drain() {
                if let Err(e) = self.release(sub).await {
                    warn!(subscriber = %id, topic = %topic, "failed to release subscription: {e}");
                }
            }
        }
        self.publisher.close().await
    }
}

#[async_trait]
impl PubSub for NatsPubSub {
    async fn subscribe(
        &self,
        id: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        validate_subscription(id, topic)?;
        self.ensure_open()?;

        if let Some(old) = self.registry.remove(topic, id) {
            debug!("replacing subscription of {id} on {topic}");
            if let Err(e) = self.release(old).await {
                warn!(subscriber = %id, topic = %topic, "failed to release replaced subscription: {e}");
            }
        }

        let config = consumer_config(topic, id);
        let name = consumer_name(topic, id);
        let timeout = self.publisher.timeout;
        let consumer: jetstream::consumer::PullConsumer = within(
            timeout,
            self.publisher.stream.get_or_create_consumer(&name, config),
        )
        .await?;
        let messages = within(timeout, consumer.messages()).await?;

        let worker = {
            let handler = handler.clone();
            let (id, topic) = (id.to_string(), topic.to_string());
            Worker::spawn(move |mut stopped| async move {
                let mut messages = Box::pin(messages);
                loop {
                    tokio::select! {
                        _ = &mut stopped => break,
                        next = messages.next() => match next {
                            Some(Ok(m)) => {
                                deliver(handler.as_ref(), &id, &topic, &m.message.payload).await;
                                if let Err(e) = m.ack().await {
                                    warn!(subscriber = %id, topic = %topic, "failed to ack message: {e}");
                                }
                            }
                            Some(Err(e)) => {
                                error!(subscriber = %id, topic = %topic, "failed to read from consumer: {e}");
                            }
                            None => break,
                        },
                    }
                }
            })
        };

        let mut pending = Subscription::new(handler, name, worker);
        loop {
            match self.registry.insert(topic, id, pending) {
                Ok(()) => break,
                Err(back) => {
                    // A concurrent subscribe for the same pair won the race.
                    // It shares our durable consumer, so only its worker and
                    // handler are torn down.
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
                let name = late.discard().await;
                if let Err(e) = within(timeout, self.publisher.stream.delete_consumer(&name)).await {
                    error!("failed to delete consumer {name}: {e}");
                }
            }
            return Err(Error::Closed);
        }
        debug!("{id} subscribed to {topic}");
        Ok(())
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<()> {
        validate_subscription(id, topic)?;
        let sub = self.registry.remove(topic, id).ok_or(Error::NotSubscribed)?;
        self.release(sub).await?;
        debug!("{id} unsubscribed from {topic}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_config_matches_channel_layout() {
        let cfg = stream_config();
        assert_eq!(cfg.name, "channels");
        assert_eq!(cfg.subjects, vec!["channels.>".to_string()]);
        assert_eq!(cfg.max_age, Duration::from_secs(86_400));
        assert_eq!(cfg.max_message_size, 1_048_576);
        assert_eq!(cfg.max_messages_per_subject, 1_000_000);
        assert_eq!(cfg.retention, RetentionPolicy::Limits);
    }

    #[test]
    fn consumer_name_flattens_reserved_characters() {
        assert_eq!(consumer_name("channels.c1.>", "dev-1"), "channels_c1__-dev-1");
        assert_eq!(consumer_name("channels.*.a b", "x"), "channels___a_b-x");
    }

    #[test]
    fn consumer_config_is_durable_and_skips_history() {
        let cfg = consumer_config("channels.c1", "dev-1");
        assert_eq!(cfg.durable_name.as_deref(), Some("channels_c1-dev-1"));
        assert_eq!(cfg.name, cfg.durable_name);
        assert_eq!(cfg.deliver_policy, DeliverPolicy::New);
        assert_eq!(cfg.filter_subject, "channels.c1");
    }

    mod live {
        use super::*;
        use crate::backends::BrokerKind;
        use crate::backends::tests::{assert_resubscribe_replaces, fresh_topic, live_settings};
        use crate::broker::testing::RecordingHandler;

        async fn connect() -> NatsPubSub {
            let settings = live_settings(BrokerKind::Nats, "NATS_TEST_URL", "nats://localhost:4222");
            NatsPubSub::connect(&settings).await.unwrap()
        }

        #[tokio::test]
        #[ignore = "needs a NATS server with JetStream"]
        async fn resubscribe_replaces_and_consumer_is_deleted() {
            let ps = connect().await;
            let topic = fresh_topic();
            assert_resubscribe_replaces(&ps, &topic, || ps.registry.len()).await;

            let name = consumer_name(&topic, "dev-1");
            let gone = ps.publisher.stream.get_consumer::<pull::Config>(&name).await;
            assert!(gone.is_err());
            ps.close().await.unwrap();
        }

        #[tokio::test]
        #[ignore = "needs a NATS server with JetStream"]
        async fn subscribe_after_close_fails() {
            let ps = connect().await;
            let topic = fresh_topic();
            let (h, _rx) = RecordingHandler::new();
            ps.subscribe("dev-1", &topic, h.clone()).await.unwrap();
            ps.close().await.unwrap();
            assert_eq!(h.cancel_count(), 1);

            let (late, _rx) = RecordingHandler::new();
            let err = ps.subscribe("dev-1", &topic, late).await.unwrap_err();
            assert!(matches!(err, Error::Closed));
            // Closing twice is fine.
            ps.close().await.unwrap();
        }
    }
}
