use std::time::Duration;

use serde::Deserialize;

use crate::backends::BrokerKind;

/// Top-level configuration settings for the application.
///
/// Includes logging and messaging backend settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub log: LogSettings,
    pub messaging: MessagingSettings,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Configuration of the broker backend.
///
/// `backend` is resolved once at startup into a concrete adapter.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MessagingSettings {
    pub backend: BrokerKind,
    pub url: String,
    /// Queue name (RabbitMQ) or consumer group prefix (Kafka).
    pub queue: String,
    pub connect_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub rabbitmq: RabbitMqSettings,
    pub mqtt: MqttSettings,
}

impl MessagingSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RabbitMqSettings {
    /// Put the publishing channel in confirm mode and wait for broker acks.
    pub confirm: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MqttSettings {
    pub username: String,
    pub password: String,
    pub qos: u8,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub log: Option<PartialLogSettings>,
    pub messaging: Option<PartialMessagingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialMessagingSettings {
    pub backend: Option<BrokerKind>,
    pub url: Option<String>,
    pub queue: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub operation_timeout_secs: Option<u64>,
    pub rabbitmq: Option<PartialRabbitMqSettings>,
    pub mqtt: Option<PartialMqttSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRabbitMqSettings {
    pub confirm: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialMqttSettings {
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: Option<u8>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: LogSettings {
                level: "info".to_string(),
            },
            messaging: MessagingSettings::default(),
        }
    }
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            backend: BrokerKind::Nats,
            url: "nats://localhost:4222".to_string(),
            queue: "msgbus".to_string(),
            connect_timeout_secs: 10,
            operation_timeout_secs: 5,
            rabbitmq: RabbitMqSettings { confirm: false },
            mqtt: MqttSettings {
                username: "msgbus".to_string(),
                password: String::new(),
                qos: 1,
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let log = self.log.unwrap_or(PartialLogSettings { level: None });
        Settings {
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
            messaging: match self.messaging {
                Some(partial) => partial.merge(default.messaging),
                None => default.messaging,
            },
        }
    }
}

impl PartialMessagingSettings {
    pub fn merge(self, default: MessagingSettings) -> MessagingSettings {
        MessagingSettings {
            backend: self.backend.unwrap_or(default.backend),
            url: self.url.unwrap_or(default.url),
            queue: self.queue.unwrap_or(default.queue),
            connect_timeout_secs: self
                .connect_timeout_secs
                .unwrap_or(default.connect_timeout_secs),
            operation_timeout_secs: self
                .operation_timeout_secs
                .unwrap_or(default.operation_timeout_secs),
            rabbitmq: RabbitMqSettings {
                confirm: self
                    .rabbitmq
                    .and_then(|r| r.confirm)
                    .unwrap_or(default.rabbitmq.confirm),
            },
            mqtt: match self.mqtt {
                Some(mqtt) => MqttSettings {
                    username: mqtt.username.unwrap_or(default.mqtt.username),
                    password: mqtt.password.unwrap_or(default.mqtt.password),
                    qos: mqtt.qos.unwrap_or(default.mqtt.qos),
                },
                None => default.mqtt,
            },
        }
    }
}
