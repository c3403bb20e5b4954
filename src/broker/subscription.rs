//! Subscription bookkeeping
//!
//! A `Subscription` ties a handler to the background worker that feeds it and
//! to a backend-native consumer handle `C`. The `SubscriptionRegistry` is the
//! adapter-local map `topic -> (subscriber id -> Subscription)`.
//!
//! Concurrency notes:
//! - The registry lock guards map mutations only. It is never held across an
//!   `.await`, so handlers and broker I/O always run outside of it.
//! - Teardown is explicit: the worker receives a stop signal and is awaited
//!   until it has drained, and only then is the handler's `cancel` run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::broker::message::Message;
use crate::broker::pubsub::MessageHandler;
use crate::broker::topic::SubscriberId;
use crate::utils::error::Result;

/// Background task delivering messages for one subscription.
#[derive(Debug)]
pub struct Worker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawns `task`, handing it the receiving end of the stop signal.
    pub fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(task(stopped));
        Self { stop, handle }
    }

    /// Signals the task to stop and waits for it to finish.
    pub async fn stop(self) {
        // The task may already have exited on its own (stream ended).
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!("subscription worker panicked: {e}");
            }
        }
    }
}

pub struct Subscription<C> {
    handler: Arc<dyn MessageHandler>,
    consumer: C,
    worker: Worker,
}

impl<C> Subscription<C> {
    pub fn new(handler: Arc<dyn MessageHandler>, consumer: C, worker: Worker) -> Self {
        Self {
            handler,
            consumer,
            worker,
        }
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// Stops the worker, then runs the handler's cancel callback.
    ///
    /// The consumer handle is returned so the adapter can release the
    /// broker-side resource; the cancel result is returned alongside it.
    pub async fn shutdown(self) -> (C, Result<()>) {
        self.worker.stop().await;
        let cancelled = self.handler.cancel().await;
        (self.consumer, cancelled)
    }

    /// Stops the worker of a subscription that never went live. The handler
    /// was not registered, so its cancel callback is not run.
    pub async fn discard(self) -> C {
        self.worker.stop().await;
        self.consumer
    }
}

impl<C> std::fmt::Debug for Subscription<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Decodes a raw delivery and passes it to the handler.
///
/// Malformed envelopes and handler failures are logged; neither ends the
/// subscription.
pub async fn deliver(handler: &dyn MessageHandler, id: &str, topic: &str, data: &[u8]) {
    let msg = match Message::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(subscriber = %id, topic = %topic, "dropping undecodable delivery: {e}");
            return;
        }
    };
    if let Err(e) = handler.handle(msg).await {
        warn!(subscriber = %id, topic = %topic, "failed to handle message: {e}");
    }
}

type Subscribers<C> = HashMap<SubscriberId, Subscription<C>>;

pub struct SubscriptionRegistry<C> {
    topics: Mutex<HashMap<String, Subscribers<C>>>,
}

impl<C> Default for SubscriptionRegistry<C> {
    fn default() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> SubscriptionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, topic: &str, id: &str) -> bool {
        self.topics
            .lock()
            .get(topic)
            .is_some_and(|subs| subs.contains_key(id))
    }

    /// Whether any subscriber holds `topic`.
    pub fn is_topic_taken(&self, topic: &str) -> bool {
        self.topics
            .lock()
            .get(topic)
            .is_some_and(|subs| !subs.is_empty())
    }

    /// Records a subscription for `(topic, id)`. If that pair is already
    /// live, the new subscription is handed back untouched.
    pub fn insert(
        &self,
        topic: &str,
        id: &str,
        sub: Subscription<C>,
    ) -> std::result::Result<(), Subscription<C>> {
        let mut topics = self.topics.lock();
        let subs = topics.entry(topic.to_string()).or_default();
        if subs.contains_key(id) {
            return Err(sub);
        }
        subs.insert(id.to_string(), sub);
        Ok(())
    }

    /// Like [`insert`](Self::insert), but refuses when any subscriber holds
    /// the topic.
    pub fn insert_exclusive(
        &self,
        topic: &str,
        id: &str,
        sub: Subscription<C>,
    ) -> std::result::Result<(), Subscription<C>> {
        let mut topics = self.topics.lock();
        let subs = topics.entry(topic.to_string()).or_default();
        if !subs.is_empty() {
            return Err(sub);
        }
        subs.insert(id.to_string(), sub);
        Ok(())
    }

    pub fn remove(&self, topic: &str, id: &str) -> Option<Subscription<C>> {
        let mut topics = self.topics.lock();
        let subs = topics.get_mut(topic)?;
        let sub = subs.remove(id);
        if subs.is_empty() {
            topics.remove(topic);
        }
        sub
    }

    /// Empties the registry, returning every live subscription.
    pub fn drain(&self) -> Vec<(String, SubscriberId, Subscription<C>)> {
        let mut topics = self.topics.lock();
        topics
            .drain()
            .flat_map(|(topic, subs)| {
                subs.into_iter()
                    .map(move |(id, sub)| (topic.clone(), id, sub))
            })
            .collect()
    }

    /// Applies `f` to the consumer of every subscription on `topic`.
    pub fn collect<R>(&self, topic: &str, mut f: impl FnMut(&str, &C) -> R) -> Vec<R> {
        self.topics
            .lock()
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .map(|(id, sub)| f(id.as_str(), sub.consumer()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Applies `f` to every subscription whose topic satisfies `pred`.
    pub fn collect_matching<R>(
        &self,
        mut pred: impl FnMut(&str) -> bool,
        mut f: impl FnMut(&str, &C) -> R,
    ) -> Vec<R> {
        self.topics
            .lock()
            .iter()
            .filter(|(topic, _)| pred(topic.as_str()))
            .flat_map(|(_, subs)| subs.iter())
            .map(|(id, sub)| f(id.as_str(), sub.consumer()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.topics.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C> std::fmt::Debug for SubscriptionRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}
