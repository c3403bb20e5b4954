//! Message envelope
//!
//! `Message` is the canonical record exchanged between protocol bridges and
//! the Publisher/PubSub contracts. It is built once at ingress, encoded once
//! at the publisher boundary and decoded once per delivery.
//!
//! The wire form is protobuf (field numbers below are stable), so every
//! backend transports it as an opaque blob.
//!
//! Notes on fields:
//! - `channel`: target channel id, required for routing
//! - `subtopic`: normalized dot-separated suffix, may be empty
//! - `publisher`: identity of the sending device or client
//! - `protocol`: ingress protocol name (`mqtt`, `http`, `coap`, ...)
//! - `payload`: opaque bytes
//! - `created`: nanoseconds since UNIX epoch

use prost::Message as _;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Error, Result};

#[derive(Clone, PartialEq, Eq, ::prost::Message, Serialize, Deserialize)]
pub struct Message {
    #[prost(string, tag = "1")]
    pub channel: String,
    #[prost(string, tag = "2")]
    pub subtopic: String,
    #[prost(string, tag = "3")]
    pub publisher: String,
    #[prost(string, tag = "4")]
    pub protocol: String,
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
    #[prost(int64, tag = "6")]
    pub created: i64,
}

impl Message {
    /// Builds a message stamped with the current time.
    pub fn new(
        channel: impl Into<String>,
        subtopic: impl Into<String>,
        publisher: impl Into<String>,
        protocol: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            subtopic: subtopic.into(),
            publisher: publisher.into(),
            protocol: protocol.into(),
            payload: payload.into(),
            created: now_nanos(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decodes an envelope received from a backend.
    ///
    /// Fails with [`Error::MalformedEnvelope`] when the bytes are not a valid
    /// envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        <Self as prost::Message>::decode(bytes).map_err(Error::from)
    }
}

pub(crate) fn now_nanos() -> i64 {
    let now = chrono::Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}
