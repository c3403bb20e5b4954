//! Kafka backend
//!
//! Topics are Kafka topics named exactly like internal topics. Each
//! subscription is a member of its own consumer group, `<queue>-<id>`, with
//! auto-committed offsets starting at the latest record. Kafka has no
//! dot-hierarchy wildcards, so a wildcard topic is turned into a `^`-prefixed
//! regex subscription.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::Message as _;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info, warn};

use crate::broker::message::Message;
use crate::broker::pubsub::{
    MessageHandler, PubSub, Publisher, validate_publish, validate_subscription,
};
use crate::broker::subscription::{Subscription, SubscriptionRegistry, Worker, deliver};
use crate::broker::topic::has_wildcard;
use crate::config::MessagingSettings;
use crate::utils::deadline;
use crate::utils::error::{Error, Result};

const BACKEND: &str = "kafka";

/// Strips the scheme and trailing path from a broker URL, leaving the
/// comma-separated `host:port` list librdkafka expects.
pub fn bootstrap_servers(url: &str) -> String {
    let servers = url.split_once("://").map_or(url, |(_, rest)| rest);
    servers.trim_end_matches('/').to_string()
}

/// Kafka subscription for an internal topic. Literal topics pass through;
/// topics with `*` or `>` segments become an anchored regex.
pub fn subscription_pattern(topic: &str) -> String {
    if !has_wildcard(topic) {
        return topic.to_string();
    }
    let segments: Vec<String> = topic
        .split('.')
        .map(|segment| match segment {
            "*" => "[^.]+".to_string(),
            ">" => ".+".to_string(),
            literal => regex::escape(literal),
        })
        .collect();
    format!("^{}$", segments.join("\\."))
}

pub fn group_id(queue: &str, id: &str) -> String {
    format!("{queue}-{id}")
}

fn owned_payload(msg: KafkaResult<BorrowedMessage<'_>>) -> KafkaResult<Option<Vec<u8>>> {
    msg.map(|m| m.payload().map(<[u8]>::to_vec))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, String> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(Error::backend)?
        .map_err(Error::Backend)
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    servers: String,
    timeout: Duration,
    closed: AtomicBool,
}

impl KafkaPublisher {
    /// Creates the producer and fetches cluster metadata once, so an
    /// unreachable cluster fails here rather than on the first publish.
    pub async fn connect(settings: &MessagingSettings) -> Result<Self> {
        let servers = bootstrap_servers(&settings.url);
        let timeout = settings.operation_timeout();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &servers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .create()
            .map_err(|e| Error::connect(BACKEND, e))?;

        let limit = settings.connect_timeout();
        let metadata = producer.clone();
        blocking(move || {
            metadata
                .client()
                .fetch_metadata(None, Timeout::After(limit))
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| Error::connect(BACKEND, e))?;

        info!("connected to Kafka at {servers}");
        Ok(Self {
            producer,
            servers,
            timeout,
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
impl Publisher for KafkaPublisher {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
        validate_publish(topic, msg)?;
        self.ensure_open()?;

        let data = msg.encode();
        let record = FutureRecord::<(), [u8]>::to(topic).payload(data.as_slice());
        deadline(
            self.timeout,
            self.producer.send(record, Timeout::After(self.timeout)),
        )
        .await?
        .map_err(|(e, _)| Error::backend(e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let producer = self.producer.clone();
        let limit = self.timeout;
        blocking(move || producer.flush(Timeout::After(limit)).map_err(|e| e.to_string())).await?;
        info!("Kafka publisher closed");
        Ok(())
    }
}

pub struct KafkaPubSub {
    publisher: KafkaPublisher,
    queue: String,
    registry: SubscriptionRegistry<Arc<StreamConsumer>>,
    closed: AtomicBool,
}

impl KafkaPubSub {
    pub async fn connect(settings: &MessagingSettings) -> Result<Self> {
        Ok(Self {
            publisher: KafkaPublisher::connect(settings).await?,
            queue: settings.queue.clone(),
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

    fn consumer(&self, id: &str, topic: &str) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.publisher.servers)
            .set("group.id", group_id(&self.queue, id))
            .set("client.id", id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(Error::backend)?;
        consumer
            .subscribe(&[subscription_pattern(topic).as_str()])
            .map_err(Error::backend)?;
        Ok(consumer)
    }

    async fn release(sub: Subscription<Arc<StreamConsumer>>) -> Result<()> {
        let (consumer, cancelled) = sub.shutdown().await;
        consumer.unsubscribe();
        cancelled
    }
}

#[async_trait]
impl Publisher for KafkaPubSub {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
        self.publisher.publish(topic, msg).await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            for (topic, id, sub) in self.registry.drain() {
                if let Err(e) = Self::release(sub).await {
                    warn!(subscriber = %id, topic = %topic, "failed to release subscription: {e}");
                }
            }
        }
        self.publisher.close().await
    }
}

#[async_trait]
impl PubSub for KafkaPubSub {
    async fn subscribe(
        &self,
        id: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        validate_subscription(id, topic)?;
        self.ensure_open()?;
        if self.registry.contains(topic, id) {
            return Err(Error::AlreadySubscribed);
        }

        let consumer = Arc::new(self.consumer(id, topic)?);
        let worker = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            let (id, topic) = (id.to_string(), topic.to_string());
            Worker::spawn(move |mut stopped| async move {
                loop {
                    tokio::select! {
                        _ = &mut stopped => break,
                        next = consumer.recv() => {
                            let payload = owned_payload(next);
                            match payload {
                                Ok(Some(data)) => deliver(handler.as_ref(), &id, &topic, &data).await,
                                Ok(None) => debug!(subscriber = %id, topic = %topic, "skipping empty record"),
                                Err(e) => error!(subscriber = %id, topic = %topic, "failed to poll consumer: {e}"),
                            }
                        }
                    }
                }
            })
        };

        if let Err(rejected) = self
            .registry
            .insert(topic, id, Subscription::new(handler, consumer, worker))
        {
            rejected.discard().await.unsubscribe();
            return Err(Error::AlreadySubscribed);
        }
        // A close that started after the check above has already drained
        // the registry.
        if self.closed.load(Ordering::SeqCst) {
            if let Some(late) = self.registry.remove(topic, id) {
                late.discard().await.unsubscribe();
            }
            return Err(Error::Closed);
        }
        debug!("{id} subscribed to {topic}");
        Ok(())
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<()> {
        validate_subscription(id, topic)?;
        let sub = self.registry.remove(topic, id).ok_or(Error::NotSubscribed)?;
        Self::release(sub).await?;
        debug!("{id} unsubscribed from {topic}");
        Ok(())
    }
}
