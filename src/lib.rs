//! # msgbus
//!
//! `msgbus` is the messaging backbone of an IoT platform: a protocol-agnostic
//! publish/subscribe fabric between device-facing protocols (MQTT, CoAP) and
//! one of several interchangeable brokers (NATS JetStream, RabbitMQ, Kafka
//! or MQTT).
//!
//! ## Core Modules
//!
//! - `broker`: the message envelope, topic grammar, the `Publisher`/`PubSub`
//!   contracts and the subscription bookkeeping shared by every backend.
//! - `backends`: one adapter per broker technology plus the backend selector.
//! - `transport`: the MQTT bridge hooks and the CoAP observer.
//! - `auth`: the seam to the external client and channel services.
//! - `client`: device session state used by the bridges.
//! - `config`: loads settings from files and the environment.
//! - `utils`: the error type, logging and deadline helpers.

pub mod auth;
pub mod backends;
pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use backends::{BrokerKind, connect_pubsub, connect_publisher, new_pubsub, new_publisher};
pub use broker::{Message, MessageHandler, PubSub, Publisher};
pub use utils::error::{Error, Result};
