//! The `error` module defines the error taxonomy shared by every part of
//! `msgbus`: the codec, the Publisher/PubSub contracts, the backend adapters
//! and the protocol bridges.
//!
//! Variants fall into five groups:
//! - validation errors (empty ids/topics, malformed topics and envelopes),
//!   never retried;
//! - authentication/authorization errors, which fail closed;
//! - subscription bookkeeping errors (`AlreadySubscribed`, `NotSubscribed`),
//!   reported as ordinary values since double (un)subscribe is an expected
//!   race under reconnect;
//! - backend connectivity errors, fatal at construction and per-operation
//!   afterwards;
//! - handler errors, which adapters log and otherwise ignore.

use thiserror::Error;

use crate::backends::BrokerKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("empty topic")]
    EmptyTopic,

    #[error("empty id")]
    EmptyId,

    #[error("malformed message envelope: {0}")]
    MalformedEnvelope(String),

    #[error("malformed subtopic")]
    MalformedSubtopic,

    #[error("malformed topic")]
    MalformedTopic,

    #[error("failed to parse subtopic")]
    FailedParseSubtopic,

    #[error("already subscribed to topic")]
    AlreadySubscribed,

    #[error("not subscribed")]
    NotSubscribed,

    #[error("unrecognized broker type")]
    EmptyBrokerType,

    #[error("{0} backend is not compiled into this build")]
    BackendUnavailable(BrokerKind),

    #[error("failed to connect to {backend}: {reason}")]
    FailedConnect {
        backend: &'static str,
        reason: String,
    },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("client is not initialized")]
    Unauthenticated,

    #[error("missing client id")]
    MissingClientId,

    #[error("invalid user id")]
    InvalidUserId,

    #[error("failed to perform authentication over the entity")]
    Authentication,

    #[error("failed to perform authorization over the entity")]
    Authorization,

    #[error("missing topic")]
    MissingTopic,

    #[error("connection already closed")]
    ConnectionClosed,

    #[error("handler error: {0}")]
    Handler(String),

    #[error("pubsub is closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Wraps a broker client failure encountered mid-session.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Error::Backend(err.to_string())
    }

    pub fn connect(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Error::FailedConnect {
            backend,
            reason: err.to_string(),
        }
    }

    /// Validation failures are surfaced to the device as-is; everything else
    /// is reported without internal detail.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::EmptyTopic
                | Error::EmptyId
                | Error::MalformedEnvelope(_)
                | Error::MalformedSubtopic
                | Error::MalformedTopic
                | Error::FailedParseSubtopic
                | Error::MissingTopic
        )
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::MalformedEnvelope(err.to_string())
    }
}

