//! MQTT as a backend
//!
//! Plain broker-native publish/subscribe. Internal topics are translated to
//! MQTT syntax (`.` to `/`, `*` to `+`, `>` to `#`) and wildcard matching is
//! left to the broker. Every subscription runs its own clean-session client,
//! so tearing it down drops the broker-side subscription with it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::broker::message::Message;
use crate::broker::pubsub::{
    MessageHandler, PubSub, Publisher, validate_publish, validate_subscription,
};
use crate::broker::subscription::{Subscription, SubscriptionRegistry, Worker, deliver};
use crate::broker::topic::to_mqtt;
use crate::config::{MessagingSettings, MqttSettings};
use crate::utils::error::{Error, Result};
use crate::utils::{connect_within, deadline, within};

const BACKEND: &str = "mqtt";

pub const DEFAULT_PORT: u16 = 1883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;

/// Splits a broker URL such as `tcp://broker:1883` into host and port.
pub fn endpoint(url: &str) -> Result<(String, u16)> {
    let parsed = Url::parse(url).map_err(|e| Error::connect(BACKEND, e))?;
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| Error::connect(BACKEND, format!("no host in {url}")))?;
    Ok((host.to_string(), parsed.port().unwrap_or(DEFAULT_PORT)))
}

pub fn to_qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn options(client_id: String, host: &str, port: u16, mqtt: &MqttSettings) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, host, port);
    opts.set_keep_alive(KEEP_ALIVE)
        .set_credentials(mqtt.username.clone(), mqtt.password.clone())
        .set_clean_session(true);
    opts
}

fn short_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Polls until `pick` accepts an event. Connection errors end the wait.
async fn wait_for<T>(
    eventloop: &mut EventLoop,
    mut pick: impl FnMut(Event) -> Option<T>,
) -> std::result::Result<T, ConnectionError> {
    loop {
        if let Some(found) = pick(eventloop.poll().await?) {
            return Ok(found);
        }
    }
}

fn is_connack(event: Event) -> Option<()> {
    matches!(event, Event::Incoming(Packet::ConnAck(_))).then_some(())
}

/// Drains outgoing requests until the DISCONNECT is written, bounded by
/// `limit`.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop, limit: Duration) {
    if client.try_disconnect().is_err() {
        return;
    }
    let sent = deadline(
        limit,
        wait_for(eventloop, |event| {
            matches!(event, Event::Outgoing(Outgoing::Disconnect)).then_some(())
        }),
    )
    .await;
    if let Ok(Err(e)) = sent {
        debug!("connection ended while disconnecting: {e}");
    }
}

/// Waits out the reconnect delay unless asked to stop. Returns whether the
/// caller should stop.
async fn backoff(stopped: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = stopped => true,
        _ = tokio::time::sleep(RECONNECT_DELAY) => false,
    }
}

/// Publishes waiting for the broker's PUBACK (QoS 1) or PUBCOMP (QoS 2).
///
/// Waiters are queued in the order their packets were handed to the client.
/// The event loop writes them out in that same order, so each outgoing
/// publish moves the oldest queued waiter under its packet id.
#[derive(Debug, Default)]
struct Acks {
    queued: VecDeque<oneshot::Sender<()>>,
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

impl Acks {
    fn wait(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(tx);
        rx
    }

    fn sent(&mut self, pkid: u16) {
        // Waiters that timed out no longer hold their packet id.
        self.in_flight.retain(|_, tx| !tx.is_closed());
        // A packet id that is still pending is a retransmission.
        if self.in_flight.contains_key(&pkid) {
            return;
        }
        if let Some(tx) = self.queued.pop_front() {
            self.in_flight.insert(pkid, tx);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(tx) = self.in_flight.remove(&pkid) {
            let _ = tx.send(());
        }
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    driver: Mutex<Option<Worker>>,
    acks: Arc<Mutex<Acks>>,
    qos: QoS,
    timeout: Duration,
    closed: AtomicBool,
}

impl MqttPublisher {
    /// Connects with the platform credentials and waits for the CONNACK.
    pub async fn connect(settings: &MessagingSettings) -> Result<Self> {
        let (host, port) = endpoint(&settings.url)?;
        let client_id = format!("msgbus-publisher-{}", uuid::Uuid::new_v4().simple());
        let (client, mut eventloop) = AsyncClient::new(
            options(client_id, &host, port, &settings.mqtt),
            REQUEST_CAPACITY,
        );
        connect_within(
            BACKEND,
            settings.connect_timeout(),
            wait_for(&mut eventloop, is_connack),
        )
        .await?;

        let timeout = settings.operation_timeout();
        let acks = Arc::new(Mutex::new(Acks::default()));
        let driver = {
            let client = client.clone();
            let acks = acks.clone();
            Worker::spawn(move |mut stopped| async move {
                loop {
                    tokio::select! {
                        _ = &mut stopped => {
                            disconnect(&client, &mut eventloop, timeout).await;
                            break;
                        }
                        event = eventloop.poll() => match event {
                            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.lock().sent(pkid),
                            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.lock().acked(ack.pkid),
                            Ok(Event::Incoming(Packet::PubComp(comp))) => acks.lock().acked(comp.pkid),
                            Ok(_) => {}
                            Err(e) => {
                                error!("publisher connection error: {e}");
                                if backoff(&mut stopped).await {
                                    break;
                                }
                            }
                        },
                    }
                }
            })
        };

        info!("connected to MQTT broker at {host}:{port}");
        Ok(Self {
            client,
            driver: Mutex::new(Some(driver)),
            acks,
            qos: to_qos(settings.mqtt.qos),
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    /// At QoS 0 the message is handed to the client and not confirmed. At
    /// higher levels this waits for the broker's acknowledgement.
    async fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
        validate_publish(topic, msg)?;
        self.ensure_open()?;
        let (topic, data) = (to_mqtt(topic), msg.encode());
        if self.qos == QoS::AtMostOnce {
            return within(self.timeout, self.client.publish(topic, self.qos, false, data)).await;
        }

        let acked = {
            let mut acks = self.acks.lock();
            self.client
                .try_publish(topic, self.qos, false, data)
                .map_err(Error::backend)?;
            acks.wait()
        };
        deadline(self.timeout, acked)
            .await?
            .map_err(|_| Error::backend("publisher stopped before the broker acknowledged"))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.stop().await;
        }
        info!("MQTT publisher closed");
        Ok(())
    }
}

pub struct MqttPubSub {
    publisher: MqttPublisher,
    settings: MessagingSettings,
    registry: SubscriptionRegistry<AsyncClient>,
    closed: AtomicBool,
}

impl MqttPubSub {
    pub async fn connect(settings: &MessagingSettings) -> Result<Self> {
        Ok(Self {
            publisher: MqttPublisher::connect(settings).await?,
            settings: settings.clone(),
            registry: SubscriptionRegistry::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Opens a dedicated session for `id` and waits until the broker has
    /// granted the subscription to `filter`.
    async fn session(&self, id: &str, filter: &str) -> Result<(AsyncClient, EventLoop)> {
        let (host, port) = endpoint(&self.settings.url)?;
        let client_id = format!("{id}-{}", short_uuid());
        let (client, mut eventloop) = AsyncClient::new(
            options(client_id, &host, port, &self.settings.mqtt),
            REQUEST_CAPACITY,
        );
        let timeout = self.publisher.timeout;
        within(timeout, wait_for(&mut eventloop, is_connack)).await?;

        within(timeout, client.subscribe(filter, self.publisher.qos)).await?;
        let codes = within(
            timeout,
            wait_for(&mut eventloop, |event| match event {
                Event::Incoming(Packet::SubAck(ack)) => Some(ack.return_codes),
                _ => None,
            }),
        )
        .await?;
        if codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(Error::backend(format!("broker refused subscription to {filter}")));
        }
        Ok((client, eventloop))
    }
}

#[async_trait]
impl Publisher for MqttPubSub {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
        self.publisher.publish(topic, msg).await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            for (topic, id, sub) in self.registry.drain() {
                let (_, cancelled) = sub.shutdown().await;
                if let Err(e) = cancelled {
                    warn!(subscriber = %id, topic = %topic, "cancel failed during close: {e}");
                }
            }
        }
        self.publisher.close().await
    }
}

#[async_trait]
impl PubSub for MqttPubSub {
    async fn subscribe(
        &self,
        id: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        validate_subscription(id, topic)?;
        self.ensure_open()?;
        if self.registry.contains(topic, id) {
            return Err(Error::AlreadySubscribed);
        }

        let filter = to_mqtt(topic);
        let (client, mut eventloop) = self.session(id, &filter).await?;
        let qos = self.publisher.qos;
        let timeout = self.publisher.timeout;

        let worker = {
            let client = client.clone();
            let handler = handler.clone();
            let (id, topic) = (id.to_string(), topic.to_string());
            Worker::spawn(move |mut stopped| async move {
                loop {
                    tokio::select! {
                        _ = &mut stopped => {
                            disconnect(&client, &mut eventloop, timeout).await;
                            break;
                        }
                        event = eventloop.poll() => match event {
                            Ok(Event::Incoming(Packet::Publish(p))) => {
                                deliver(handler.as_ref(), &id, &topic, &p.payload).await;
                            }
                            // Clean sessions lose their subscriptions on reconnect.
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                if let Err(e) = client.try_subscribe(filter.clone(), qos) {
                                    warn!(subscriber = %id, topic = %topic, "failed to resubscribe: {e}");
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(subscriber = %id, topic = %topic, "connection error: {e}");
                                if backoff(&mut stopped).await {
                                    break;
                                }
                            }
                        },
                    }
                }
            })
        };

        if let Err(rejected) = self
            .registry
            .insert(topic, id, Subscription::new(handler, client, worker))
        {
            rejected.discard().await;
            return Err(Error::AlreadySubscribed);
        }
        // A close that started after the check above has already drained
        // the registry.
        if self.closed.load(Ordering::SeqCst) {
            if let Some(late) = self.registry.remove(topic, id) {
                late.discard().await;
            }
            return Err(Error::Closed);
        }
        debug!("{id} subscribed to {topic}");
        Ok(())
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<()> {
        validate_subscription(id, topic)?;
        let sub = self.registry.remove(topic, id).ok_or(Error::NotSubscribed)?;
        let (_, cancelled) = sub.shutdown().await;
        debug!("{id} unsubscribed from {topic}");
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_port() {
        assert_eq!(
            endpoint("tcp://broker:1884").unwrap(),
            ("broker".to_string(), 1884)
        );
        assert_eq!(
            endpoint("mqtt://localhost").unwrap(),
            ("localhost".to_string(), DEFAULT_PORT)
        );
    }

    #[test]
    fn endpoint_rejects_garbage() {
        assert!(matches!(
            endpoint("broker:1883/"),
            Err(Error::FailedConnect { .. })
        ));
        assert!(matches!(
            endpoint("localhost"),
            Err(Error::FailedConnect { .. })
        ));
    }

    #[test]
    fn qos_levels() {
        assert_eq!(to_qos(0), QoS::AtMostOnce);
        assert_eq!(to_qos(1), QoS::AtLeastOnce);
        assert_eq!(to_qos(2), QoS::ExactlyOnce);
    }

    #[test]
    fn options_use_platform_credentials() {
        let mqtt = MqttSettings {
            username: "msgbus".to_string(),
            password: "pw".to_string(),
            qos: 1,
        };
        let opts = options("pub-1".to_string(), "broker", 1883, &mqtt);
        assert_eq!(opts.client_id(), "pub-1");
        assert_eq!(
            opts.credentials(),
            Some(("msgbus".to_string(), "pw".to_string()))
        );
        assert!(opts.clean_session());
        assert_eq!(opts.keep_alive(), KEEP_ALIVE);
    }

    #[test]
    fn acks_follow_send_order() {
        let mut acks = Acks::default();
        let mut first = acks.wait();
        let mut second = acks.wait();
        acks.sent(7);
        acks.sent(8);

        acks.acked(8);
        assert!(second.try_recv().is_ok());
        assert!(first.try_recv().is_err());
        acks.acked(7);
        assert!(first.try_recv().is_ok());
        assert!(acks.in_flight.is_empty());
    }

    #[test]
    fn retransmission_keeps_its_waiter() {
        let mut acks = Acks::default();
        let mut first = acks.wait();
        let mut second = acks.wait();
        acks.sent(1);
        // The broker connection dropped and packet 1 went out again.
        acks.sent(1);
        assert_eq!(acks.queued.len(), 1);

        acks.sent(2);
        acks.acked(1);
        acks.acked(2);
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
    }

    #[test]
    fn abandoned_waiter_frees_its_packet_id() {
        let mut acks = Acks::default();
        drop(acks.wait());
        acks.sent(1);

        let mut next = acks.wait();
        acks.sent(1);
        acks.acked(1);
        assert!(next.try_recv().is_ok());
    }

    #[test]
    fn unknown_acks_are_ignored() {
        let mut acks = Acks::default();
        let mut pending = acks.wait();
        acks.acked(3);
        assert!(pending.try_recv().is_err());
        assert_eq!(acks.queued.len(), 1);
    }

    mod live {
        use super::*;
        use crate::backends::BrokerKind;
        use crate::backends::tests::{assert_duplicate_rejected, fresh_topic, live_settings};

        #[tokio::test]
        #[ignore = "needs an MQTT broker"]
        async fn duplicate_subscribe_is_rejected() {
            let settings = live_settings(BrokerKind::Mqtt, "MQTT_TEST_URL", "tcp://localhost:1883");
            let ps = MqttPubSub::connect(&settings).await.unwrap();
            let topic = fresh_topic();
            assert_duplicate_rejected(&ps, &topic, || ps.registry.len()).await;
            ps.close().await.unwrap();
        }
    }
}
