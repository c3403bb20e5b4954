//! CoAP observer
//!
//! Binds a device's CoAP observation to a broker subscription held under
//! the observation token. Messages published on the observed topic are sent
//! to the device as notifications until the observation is cancelled.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::broker::message::Message;
use crate::broker::pubsub::{MessageHandler, PubSub};
use crate::utils::error::{Error, Result};

/// A device that registered a CoAP observation.
#[async_trait]
pub trait CoapClient: Send + Sync {
    /// Observation token, unique per observing device.
    fn token(&self) -> &str;

    /// Sends `msg` to the device as an observe notification.
    async fn send_message(&self, msg: Message) -> Result<()>;

    /// Ends the observation on the device side.
    async fn cancel(&self) -> Result<()>;
}

struct Notifier {
    client: Arc<dyn CoapClient>,
}

#[async_trait]
impl MessageHandler for Notifier {
    async fn handle(&self, msg: Message) -> Result<()> {
        self.client.send_message(msg).await
    }

    /// Ends the device's observation whenever the subscription goes away,
    /// whether through `Observer::cancel`, a replacing subscribe or the
    /// pubsub closing. A client whose connection is already gone counts as
    /// cancelled.
    async fn cancel(&self) -> Result<()> {
        match self.client.cancel().await {
            Err(Error::ConnectionClosed) => {
                debug!("observation {} was already closed", self.client.token());
                Ok(())
            }
            res => res,
        }
    }
}

pub struct Observer {
    client: Arc<dyn CoapClient>,
    pubsub: Arc<dyn PubSub>,
}

impl Observer {
    /// Subscribes `client` to `topic` under its token.
    pub async fn new(
        topic: &str,
        client: Arc<dyn CoapClient>,
        pubsub: Arc<dyn PubSub>,
    ) -> Result<Self> {
        let handler = Arc::new(Notifier {
            client: client.clone(),
        });
        pubsub.subscribe(client.token(), topic, handler).await?;
        info!("observation {} on {topic}", client.token());
        Ok(Self { client, pubsub })
    }

    pub fn token(&self) -> &str {
        self.client.token()
    }

    /// Unsubscribes from `topic`. The subscription's teardown cancels the
    /// client; its error, if any, is returned.
    pub async fn cancel(&self, topic: &str) -> Result<()> {
        self.pubsub.unsubscribe(self.client.token(), topic).await?;
        info!("observation {} on {topic} cancelled", self.client.token());
        Ok(())
    }
}

#[cfg(test)]
#[path = "coap_tests.rs"]
mod tests;
