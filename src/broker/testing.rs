//! Test doubles shared by unit tests across the crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backends::memory::InMemoryPubSub;
use crate::broker::message::Message;
use crate::broker::pubsub::{MessageHandler, PubSub, Publisher};
use crate::utils::error::{Error, Result};

/// Handler that forwards every message to a channel and counts callbacks.
pub struct RecordingHandler {
    pub handled: AtomicUsize,
    pub cancelled: AtomicUsize,
    tx: mpsc::UnboundedSender<Message>,
    fail_handle: bool,
    fail_cancel: bool,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        Self::build(false, false)
    }

    pub fn failing_handle() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        Self::build(true, false)
    }

    pub fn failing_cancel() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        Self::build(false, true)
    }

    fn build(fail_handle: bool, fail_cancel: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            handled: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            tx,
            fail_handle,
            fail_cancel,
        });
        (handler, rx)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn handle_count(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, msg: Message) -> Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(msg);
        if self.fail_handle {
            return Err(Error::Handler("rejected".to_string()));
        }
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        if self.fail_cancel {
            return Err(Error::Handler("cancel failed".to_string()));
        }
        Ok(())
    }
}

/// In-memory pubsub that also records every accepted publish.
#[derive(Default)]
pub struct RecordingPubSub {
    pub inner: InMemoryPubSub,
    published: Mutex<Vec<(String, Message)>>,
}

impl RecordingPubSub {
    pub fn take(&self) -> Vec<(String, Message)> {
        std::mem::take(&mut *self.published.lock())
    }
}

#[async_trait]
impl Publisher for RecordingPubSub {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
        self.inner.publish(topic, msg).await?;
        self.published.lock().push((topic.to_string(), msg.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl PubSub for RecordingPubSub {
    async fn subscribe(&self, id: &str, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.inner.subscribe(id, topic, handler).await
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<()> {
        self.inner.unsubscribe(id, topic).await
    }
}

pub fn sample_message(channel: &str, subtopic: &str, protocol: &str) -> Message {
    Message::new(channel, subtopic, "device-1", protocol, b"21.5".to_vec())
}
