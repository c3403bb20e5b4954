use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use crate::utils::error::{Error, Result};

/// A message on its way back to a device, addressed by a protocol topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPublish {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Represents one connected device session.
///
/// The identity is empty until the session has been authenticated; hooks
/// that act on behalf of the device read it through [`Session::identity`].
#[derive(Debug)]
pub struct Session {
    /// Client identifier presented by the device.
    pub client_id: String,

    pub username: Option<String>,

    /// Secret checked against the client service.
    pub password: String,

    identity: RwLock<Option<String>>,

    /// Channel to the device's outbound writer.
    sender: UnboundedSender<OutboundPublish>,
}

impl Session {
    pub fn new(
        client_id: impl Into<String>,
        username: Option<String>,
        password: impl Into<String>,
        sender: UnboundedSender<OutboundPublish>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            username,
            password: password.into(),
            identity: RwLock::new(None),
            sender,
        }
    }

    /// The authenticated identity, or [`Error::Unauthenticated`].
    pub fn identity(&self) -> Result<String> {
        self.identity.read().clone().ok_or(Error::Unauthenticated)
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.read().is_some()
    }

    pub(crate) fn set_identity(&self, id: String) {
        *self.identity.write() = Some(id);
    }

    /// Queues `payload` for delivery to the device on `topic`.
    pub fn send(&self, topic: impl Into<String>, payload: Vec<u8>) -> Result<()> {
        self.sender
            .send(OutboundPublish {
                topic: topic.into(),
                payload,
            })
            .map_err(|_| Error::ConnectionClosed)
    }
}
