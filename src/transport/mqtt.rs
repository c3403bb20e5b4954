//! MQTT protocol bridge
//!
//! Session hooks invoked by an MQTT proxy in front of the platform broker.
//! Devices talk in terms of `channels/<channel>/messages[/<subtopic>]`; the
//! hooks authenticate and authorize them, rewrite their topics to internal
//! topics, and move payloads through the `PubSub` contract in both
//! directions.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::auth::{self, ChannelAuthorizer, ClientAuthenticator, Permission};
use crate::broker::message::Message;
use crate::broker::pubsub::{MessageHandler, PubSub};
use crate::broker::topic::{build_topic, from_mqtt, normalize_subtopic, subscription_topic};
use crate::client::Session;
use crate::utils::error::{Error, Result};

pub const PROTOCOL: &str = "mqtt";

const DEVICE_BACKEND_ERROR: &str = "broker operation failed";

static CHANNEL_TOPIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/?channels/([\w\-]+)/messages(/[^?]*)?(\?.*)?$")
        .expect("channel topic pattern is valid")
});

/// Splits a device topic into its channel id and raw subtopic. The query
/// part, if any, is dropped.
pub fn parse_device_topic(topic: &str) -> Result<(String, String)> {
    let caps = CHANNEL_TOPIC.captures(topic).ok_or(Error::MalformedTopic)?;
    let channel = caps.get(1).map_or("", |m| m.as_str());
    let subtopic = caps.get(2).map_or("", |m| m.as_str());
    Ok((channel.to_string(), subtopic.to_string()))
}

/// Device topic under which a message for `channel`/`subtopic` is delivered.
pub fn device_topic(channel: &str, subtopic: &str) -> String {
    if subtopic.is_empty() {
        format!("channels/{channel}/messages")
    } else {
        format!("channels/{channel}/messages/{}", subtopic.replace('.', "/"))
    }
}

/// Internal topic a device subscription maps to. `+` and `#` become `*` and
/// `>`.
pub fn device_subscription(topic: &str) -> Result<String> {
    let (channel, subtopic) = parse_device_topic(topic)?;
    subscription_topic(&channel, &from_mqtt(&subtopic))
}

/// Strips broker detail from an error headed for the device. Validation and
/// bookkeeping errors pass through.
fn device_error(client_id: &str, action: &str, err: Error) -> Error {
    if err.is_validation()
        || matches!(
            err,
            Error::AlreadySubscribed | Error::NotSubscribed | Error::Unauthenticated
        )
    {
        return err;
    }
    error!(client = %client_id, "{action} failed: {err}");
    Error::Backend(DEVICE_BACKEND_ERROR.to_string())
}

/// Sends broker messages back to the device session, skipping the ones that
/// came in over MQTT.
pub struct Forwarder {
    session: Arc<Session>,
}

impl Forwarder {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl MessageHandler for Forwarder {
    async fn handle(&self, msg: Message) -> Result<()> {
        if msg.protocol == PROTOCOL {
            return Ok(());
        }
        let topic = device_topic(&msg.channel, &msg.subtopic);
        self.session.send(topic, msg.payload)
    }

    async fn cancel(&self) -> Result<()> {
        debug!("stopped forwarding to {}", self.session.client_id);
        Ok(())
    }
}

pub struct MqttHandler {
    pubsub: Arc<dyn PubSub>,
    auth: Arc<dyn ClientAuthenticator>,
    authz: Arc<dyn ChannelAuthorizer>,
}

impl MqttHandler {
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        auth: Arc<dyn ClientAuthenticator>,
        authz: Arc<dyn ChannelAuthorizer>,
    ) -> Self {
        Self {
            pubsub,
            auth,
            authz,
        }
    }

    /// Authenticates the session's secret. A supplied username must name
    /// the authenticated client.
    pub async fn auth_connect(&self, session: &Session) -> Result<()> {
        if session.client_id.is_empty() {
            warn!("connect without client id");
            return Err(Error::MissingClientId);
        }
        let id = auth::identify(self.auth.as_ref(), &session.password).await?;
        if let Some(username) = session.username.as_deref() {
            if !username.is_empty() && username != id {
                warn!(client = %session.client_id, "username does not match client identity");
                return Err(Error::InvalidUserId);
            }
        }
        session.set_identity(id);
        Ok(())
    }

    pub async fn auth_publish(&self, session: &Session, topic: &str, _payload: &[u8]) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::MissingTopic);
        }
        self.authorize(session, topic, Permission::Publish).await
    }

    pub async fn auth_subscribe(&self, session: &Session, topics: &[String]) -> Result<()> {
        if topics.is_empty() {
            return Err(Error::MissingTopic);
        }
        for topic in topics {
            self.authorize(session, topic, Permission::Subscribe).await?;
        }
        Ok(())
    }

    async fn authorize(&self, session: &Session, topic: &str, permission: Permission) -> Result<()> {
        let identity = session.identity()?;
        let (channel, _) = parse_device_topic(topic).inspect_err(|_| {
            warn!(client = %session.client_id, "{permission} on malformed topic {topic}");
        })?;
        auth::check(self.authz.as_ref(), &identity, &channel, permission).await
    }

    pub async fn connect(&self, session: &Session) -> Result<()> {
        let identity = session.identity()?;
        info!(client = %session.client_id, "connected as {identity}");
        Ok(())
    }

    /// Wraps the payload into a message and publishes it on the internal
    /// topic of the device topic.
    pub async fn publish(&self, session: &Session, topic: &str, payload: Vec<u8>) -> Result<()> {
        let identity = session.identity()?;
        let (channel, subtopic) = parse_device_topic(topic)?;
        let subtopic = normalize_subtopic(&subtopic).map_err(|_| Error::FailedParseSubtopic)?;
        let internal = build_topic(&channel, &subtopic).map_err(|e| match e {
            Error::MalformedSubtopic => Error::FailedParseSubtopic,
            other => other,
        })?;

        let msg = Message::new(channel, subtopic, identity, PROTOCOL, payload);
        self.pubsub
            .publish(&internal, &msg)
            .await
            .map_err(|e| device_error(&session.client_id, "publish", e))
    }

    /// Subscribes the session to every topic, forwarding broker messages back
    /// to the device.
    pub async fn subscribe(&self, session: &Arc<Session>, topics: &[String]) -> Result<()> {
        session.identity()?;
        for topic in topics {
            let internal = device_subscription(topic)?;
            let handler = Arc::new(Forwarder::new(session.clone()));
            self.pubsub
                .subscribe(&session.client_id, &internal, handler)
                .await
                .map_err(|e| device_error(&session.client_id, "subscribe", e))?;
            info!(client = %session.client_id, "subscribed to {internal}");
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, session: &Session, topics: &[String]) -> Result<()> {
        session.identity()?;
        for topic in topics {
            let internal = device_subscription(topic)?;
            self.pubsub
                .unsubscribe(&session.client_id, &internal)
                .await
                .map_err(|e| device_error(&session.client_id, "unsubscribe", e))?;
            info!(client = %session.client_id, "unsubscribed from {internal}");
        }
        Ok(())
    }

    /// Logs the disconnect. Subscriptions are left in place until they are
    /// unsubscribed or the pubsub is closed.
    pub async fn disconnect(&self, session: &Session) {
        match session.identity() {
            Ok(identity) => info!(client = %session.client_id, "disconnected {identity}"),
            Err(_) => info!(client = %session.client_id, "disconnected before authenticating"),
        }
    }
}
