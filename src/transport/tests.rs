use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::auth::Permission;
use crate::auth::testing::StaticAuth;
use crate::broker::message::Message;
use crate::broker::pubsub::Publisher;
use crate::broker::testing::RecordingPubSub;
use crate::client::{OutboundPublish, Session};
use crate::transport::mqtt::{
    MqttHandler, device_subscription, device_topic, parse_device_topic,
};
use crate::utils::error::Error;

fn auth() -> StaticAuth {
    StaticAuth::new()
        .client("s3cret", "thing-1")
        .grant("thing-1", "c1", Permission::Publish)
        .grant("thing-1", "c1", Permission::Subscribe)
}

fn bridge(auth: StaticAuth) -> (MqttHandler, Arc<RecordingPubSub>) {
    let pubsub = Arc::new(RecordingPubSub::default());
    let auth = Arc::new(auth);
    (
        MqttHandler::new(pubsub.clone(), auth.clone(), auth),
        pubsub,
    )
}

fn session(
    client_id: &str,
    username: Option<&str>,
    password: &str,
) -> (Arc<Session>, mpsc::UnboundedReceiver<OutboundPublish>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::new(client_id, username.map(str::to_string), password, tx);
    (Arc::new(session), rx)
}

async fn connected(handler: &MqttHandler) -> (Arc<Session>, mpsc::UnboundedReceiver<OutboundPublish>) {
    let (session, rx) = session("mqtt-conn-1", Some("thing-1"), "s3cret");
    handler.auth_connect(&session).await.unwrap();
    handler.connect(&session).await.unwrap();
    (session, rx)
}

fn topics(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

#[test]
fn test_parse_device_topic() {
    let cases = [
        ("channels/c1/messages", ("c1", "")),
        ("/channels/c1/messages", ("c1", "")),
        ("channels/c-1_x/messages/temp/zone1", ("c-1_x", "/temp/zone1")),
        ("channels/c1/messages/temp?qos=1", ("c1", "/temp")),
    ];
    for (topic, (channel, subtopic)) in cases {
        let (c, s) = parse_device_topic(topic).unwrap();
        assert_eq!((c.as_str(), s.as_str()), (channel, subtopic), "{topic}");
    }

    for topic in ["channels/c1", "channel/c1/messages", "channels/c.1/messages", "x"] {
        assert!(
            matches!(parse_device_topic(topic), Err(Error::MalformedTopic)),
            "{topic}"
        );
    }
}

#[test]
fn test_device_topic_and_subscription() {
    assert_eq!(device_topic("c1", ""), "channels/c1/messages");
    assert_eq!(device_topic("c1", "temp.zone1"), "channels/c1/messages/temp/zone1");

    assert_eq!(device_subscription("channels/c1/messages").unwrap(), "channels.c1");
    assert_eq!(
        device_subscription("channels/c1/messages/+/temp").unwrap(),
        "channels.c1.*.temp"
    );
    assert_eq!(
        device_subscription("channels/c1/messages/#").unwrap(),
        "channels.c1.>"
    );
}

#[tokio::test]
async fn test_auth_connect() {
    let (handler, _) = bridge(auth());

    let (s, _rx) = session("conn", Some("thing-1"), "s3cret");
    handler.auth_connect(&s).await.unwrap();
    assert_eq!(s.identity().unwrap(), "thing-1");

    // No username is fine.
    let (s, _rx) = session("conn", None, "s3cret");
    handler.auth_connect(&s).await.unwrap();

    let (s, _rx) = session("", Some("thing-1"), "s3cret");
    let err = handler.auth_connect(&s).await.unwrap_err();
    assert!(matches!(err, Error::MissingClientId));

    let (s, _rx) = session("conn", Some("someone-else"), "s3cret");
    let err = handler.auth_connect(&s).await.unwrap_err();
    assert!(matches!(err, Error::InvalidUserId));
    assert!(!s.is_authenticated());

    let (s, _rx) = session("conn", Some("thing-1"), "wrong");
    let err = handler.auth_connect(&s).await.unwrap_err();
    assert!(matches!(err, Error::Authentication));
}

#[tokio::test]
async fn test_auth_connect_fails_closed() {
    let (handler, _) = bridge(auth().unreachable());
    let (s, _rx) = session("conn", Some("thing-1"), "s3cret");
    let err = handler.auth_connect(&s).await.unwrap_err();
    assert!(matches!(err, Error::Authentication));
}

#[tokio::test]
async fn test_auth_publish() {
    let (handler, _) = bridge(auth());
    let (s, _rx) = connected(&handler).await;

    handler
        .auth_publish(&s, "channels/c1/messages/temp", b"21")
        .await
        .unwrap();

    let err = handler.auth_publish(&s, "", b"21").await.unwrap_err();
    assert!(matches!(err, Error::MissingTopic));
    let err = handler
        .auth_publish(&s, "devices/c1", b"21")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedTopic));
    let err = handler
        .auth_publish(&s, "channels/c2/messages", b"21")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization));
}

#[tokio::test]
async fn test_auth_requires_connected_session() {
    let (handler, _) = bridge(auth());
    let (s, _rx) = session("conn", None, "s3cret");
    let err = handler
        .auth_publish(&s, "channels/c1/messages", b"")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthenticated));
}

#[tokio::test]
async fn test_auth_subscribe() {
    let auth = auth().grant("thing-1", "c2", Permission::Publish);
    let (handler, _) = bridge(auth);
    let (s, _rx) = connected(&handler).await;

    handler
        .auth_subscribe(&s, &topics(&["channels/c1/messages", "channels/c1/messages/#"]))
        .await
        .unwrap();

    let err = handler.auth_subscribe(&s, &[]).await.unwrap_err();
    assert!(matches!(err, Error::MissingTopic));

    // Publish rights on c2 do not grant subscribe rights.
    let err = handler
        .auth_subscribe(&s, &topics(&["channels/c1/messages", "channels/c2/messages"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization));
}

#[tokio::test]
async fn test_publish_to_channel() {
    let (handler, pubsub) = bridge(auth());
    let (s, _rx) = connected(&handler).await;

    handler
        .publish(&s, "channels/c1/messages", b"21.5".to_vec())
        .await
        .unwrap();

    let published = pubsub.take();
    assert_eq!(published.len(), 1);
    let (topic, msg) = &published[0];
    assert_eq!(topic, "channels.c1");
    assert_eq!(msg.channel, "c1");
    assert_eq!(msg.subtopic, "");
    assert_eq!(msg.protocol, "mqtt");
    assert_eq!(msg.publisher, "thing-1");
    assert_eq!(msg.payload, b"21.5".to_vec());
    assert!(msg.created > 0);
}

#[tokio::test]
async fn test_publish_normalizes_subtopic() {
    let (handler, pubsub) = bridge(auth());
    let (s, _rx) = connected(&handler).await;

    handler
        .publish(&s, "channels/c1/messages/temp%2Fzone1", vec![1])
        .await
        .unwrap();

    let published = pubsub.take();
    let (topic, msg) = &published[0];
    assert_eq!(topic, "channels.c1.temp.zone1");
    assert_eq!(msg.subtopic, "temp.zone1");
}

#[tokio::test]
async fn test_publish_rejects_bad_topics() {
    let (handler, pubsub) = bridge(auth());
    let (s, _rx) = connected(&handler).await;

    let err = handler
        .publish(&s, "channels/c1/messages/temp/*", vec![1])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FailedParseSubtopic));
    let err = handler
        .publish(&s, "channels/c1/messages/a%FF", vec![1])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FailedParseSubtopic));
    let err = handler
        .publish(&s, "channels/c1", vec![1])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedTopic));
    assert!(pubsub.take().is_empty());
}

#[tokio::test]
async fn test_subscribe_forwards_and_suppresses_echo() {
    let (handler, pubsub) = bridge(auth());
    let (s, mut rx) = connected(&handler).await;

    handler
        .subscribe(&s, &topics(&["channels/c1/messages"]))
        .await
        .unwrap();

    let echo = Message::new("c1", "", "thing-2", "mqtt", b"from-mqtt".to_vec());
    let http = Message::new("c1", "", "svc", "http", b"from-http".to_vec());
    pubsub.publish("channels.c1", &echo).await.unwrap();
    pubsub.publish("channels.c1", &http).await.unwrap();

    let out = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out.topic, "channels/c1/messages");
    assert_eq!(out.payload, b"from-http".to_vec());
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_wildcard_subscription_forwards_subtopics() {
    let (handler, pubsub) = bridge(auth());
    let (s, mut rx) = connected(&handler).await;

    handler
        .subscribe(&s, &topics(&["channels/c1/messages/#"]))
        .await
        .unwrap();
    let msg = Message::new("c1", "temp.zone1", "svc", "coap", vec![7]);
    pubsub.publish("channels.c1.temp.zone1", &msg).await.unwrap();

    let out = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out.topic, "channels/c1/messages/temp/zone1");
}

#[tokio::test]
async fn test_unsubscribe() {
    let (handler, pubsub) = bridge(auth());
    let (s, mut rx) = connected(&handler).await;
    let list = topics(&["channels/c1/messages"]);

    handler.subscribe(&s, &list).await.unwrap();
    handler.unsubscribe(&s, &list).await.unwrap();
    assert_eq!(pubsub.inner.subscription_count(), 0);

    let msg = Message::new("c1", "", "svc", "http", vec![1]);
    pubsub.publish("channels.c1", &msg).await.unwrap();
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    let err = handler.unsubscribe(&s, &list).await.unwrap_err();
    assert!(matches!(err, Error::NotSubscribed));
}

#[tokio::test]
async fn test_disconnect_keeps_subscriptions() {
    let (handler, pubsub) = bridge(auth());
    let (s, mut rx) = connected(&handler).await;

    handler
        .subscribe(&s, &topics(&["channels/c1/messages"]))
        .await
        .unwrap();
    handler.disconnect(&s).await;

    // Delivery continues until an explicit unsubscribe.
    assert_eq!(pubsub.inner.subscription_count(), 1);
    let msg = Message::new("c1", "", "svc", "http", vec![1]);
    pubsub.publish("channels.c1", &msg).await.unwrap();
    assert!(
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_broker_failure_is_opaque_to_device() {
    let (handler, pubsub) = bridge(auth());
    let (s, _rx) = connected(&handler).await;
    pubsub.close().await.unwrap();

    let err = handler
        .publish(&s, "channels/c1/messages", vec![1])
        .await
        .unwrap_err();
    match err {
        Error::Backend(reason) => assert!(!reason.contains("closed")),
        other => panic!("unexpected error: {other}"),
    }
}
