//! Backend adapters and the backend selector.
//!
//! Each adapter implements the Publisher/PubSub contracts against one broker
//! technology, and they differ on purpose:
//!
//! | Backend | Consumer | Duplicate subscribe |
//! |---|---|---|
//! | NATS JetStream | durable pull consumer per `(id, topic)` | replaces the live one |
//! | RabbitMQ | one shared queue, one fanout exchange per topic | `AlreadySubscribed` (any id) |
//! | Kafka | consumer group member per subscriber | `AlreadySubscribed` |
//! | MQTT | broker-native subscription per `(id, topic)` | `AlreadySubscribed` |
//!
//! The selector below is the only place a backend is chosen; everything
//! else depends on `dyn Publisher` / `dyn PubSub`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::broker::pubsub::{PubSub, Publisher};
use crate::config::MessagingSettings;
use crate::utils::error::{Error, Result};

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Nats,
    RabbitMq,
    Kafka,
    Mqtt,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Nats => "nats",
            BrokerKind::RabbitMq => "rabbitmq",
            BrokerKind::Kafka => "kafka",
            BrokerKind::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nats" => Ok(BrokerKind::Nats),
            "rabbitmq" => Ok(BrokerKind::RabbitMq),
            "kafka" => Ok(BrokerKind::Kafka),
            "mqtt" => Ok(BrokerKind::Mqtt),
            _ => Err(Error::EmptyBrokerType),
        }
    }
}

/// Connects a publisher for `backend` at `url` using default tuning.
///
/// Fails with [`Error::EmptyBrokerType`] for an unknown backend tag before
/// anything is constructed.
pub async fn new_publisher(backend: &str, url: &str) -> Result<Box<dyn Publisher>> {
    let kind: BrokerKind = backend.parse()?;
    let settings = MessagingSettings {
        backend: kind,
        url: url.to_string(),
        ..MessagingSettings::default()
    };
    connect_publisher(&settings).await
}

/// Connects a pubsub for `backend` at `url`. `queue` names the RabbitMQ
/// queue or Kafka group prefix; empty keeps the default.
pub async fn new_pubsub(backend: &str, url: &str, queue: &str) -> Result<Arc<dyn PubSub>> {
    let kind: BrokerKind = backend.parse()?;
    let defaults = MessagingSettings::default();
    let settings = MessagingSettings {
        backend: kind,
        url: url.to_string(),
        queue: if queue.is_empty() {
            defaults.queue.clone()
        } else {
            queue.to_string()
        },
        ..defaults
    };
    connect_pubsub(&settings).await
}

pub async fn connect_publisher(settings: &MessagingSettings) -> Result<Box<dyn Publisher>> {
    info!("connecting {} publisher", settings.backend);
    match settings.backend {
        #[cfg(feature = "nats")]
        BrokerKind::Nats => Ok(Box::new(nats::NatsPublisher::connect(settings).await?)),
        #[cfg(feature = "rabbitmq")]
        BrokerKind::RabbitMq => Ok(Box::new(rabbitmq::RabbitPublisher::connect(settings).await?)),
        #[cfg(feature = "kafka")]
        BrokerKind::Kafka => Ok(Box::new(kafka::KafkaPublisher::connect(settings).await?)),
        #[cfg(feature = "mqtt")]
        BrokerKind::Mqtt => Ok(Box::new(mqtt::MqttPublisher::connect(settings).await?)),
        #[allow(unreachable_patterns)]
        other => Err(Error::BackendUnavailable(other)),
    }
}

pub async fn connect_pubsub(settings: &MessagingSettings) -> Result<Arc<dyn PubSub>> {
    info!("connecting {} pubsub", settings.backend);
    match settings.backend {
        #[cfg(feature = "nats")]
        BrokerKind::Nats => Ok(Arc::new(nats::NatsPubSub::connect(settings).await?)),
        #[cfg(feature = "rabbitmq")]
        BrokerKind::RabbitMq => Ok(Arc::new(rabbitmq::RabbitPubSub::connect(settings).await?)),
        #[cfg(feature = "kafka")]
        BrokerKind::Kafka => Ok(Arc::new(kafka::KafkaPubSub::connect(settings).await?)),
        #[cfg(feature = "mqtt")]
        BrokerKind::Mqtt => Ok(Arc::new(mqtt::MqttPubSub::connect(settings).await?)),
        #[allow(unreachable_patterns)]
        other => Err(Error::BackendUnavailable(other)),
    }
}
