//! Relay Core Tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use super::*;
use crate::codec::{Decoder, Encoder};
use crate::config::{BrokerConfig, Config, LocalConfig, LogConfig, RelayConfig, RouteTable};
use crate::error::RelayError;
use crate::mqtt::{BrokerError, BrokerMessage, ConnectionState, InboundHandler};
use crate::osc::{
    decode_packet, encode_packet, ListenerError, LocalMessageHandler, OscMessage, OscPacket,
    OscType,
};
use crate::payload::{PingPayload, PING_PAYLOAD_LEN};
use crate::protocol::{ConnAck, ConnectReturnCode, Packet, Publish, QoS};

// =============================================================================
// Mock transports
// =============================================================================

/// Everything the relay did, in order
#[derive(Debug, Clone, PartialEq)]
enum Event {
    Publish { topic: String, payload: Bytes },
    Send { address: String, args: Vec<OscType> },
}

type EventLog = Arc<Mutex<Vec<Event>>>;

struct MockBroker {
    events: EventLog,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerPublisher for MockBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        _qos: QoS,
        _retain: bool,
    ) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        self.events.lock().push(Event::Publish {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

struct MockLocal {
    events: EventLog,
}

#[async_trait]
impl LocalSender for MockLocal {
    async fn send(&self, address: &str, args: Vec<OscType>) -> Result<(), ListenerError> {
        self.events.lock().push(Event::Send {
            address: address.to_string(),
            args,
        });
        Ok(())
    }
}

const NODE_ID: u64 = 0xC0FFEE;

fn routes(pairs: &[(&str, Option<&str>)]) -> Vec<(String, Option<String>)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
        .collect()
}

struct Fixture {
    dispatcher: Dispatcher,
    broker: Arc<MockBroker>,
    events: EventLog,
}

impl Fixture {
    fn new(forward: &[(&str, Option<&str>)], reverse: &[(&str, Option<&str>)]) -> Self {
        Self::with_handler(forward, reverse, Arc::new(DefaultHandler))
    }

    fn with_handler(
        forward: &[(&str, Option<&str>)],
        reverse: &[(&str, Option<&str>)],
        handler: Arc<dyn RelayHandler>,
    ) -> Self {
        let events = EventLog::default();
        let broker = Arc::new(MockBroker {
            events: events.clone(),
            connected: AtomicBool::new(true),
        });
        let local = Arc::new(MockLocal {
            events: events.clone(),
        });
        let router = Arc::new(TopicRouter::new(routes(forward), routes(reverse)));
        let ctx = RelayContext::new(broker.clone(), local, router, NODE_ID);
        Self {
            dispatcher: Dispatcher::new(ctx, handler),
            broker,
            events,
        }
    }

    async fn broker_message(&self, topic: &str, payload: Bytes) {
        self.dispatcher
            .on_broker_message(BrokerMessage {
                topic: topic.to_string(),
                payload,
                qos: QoS::AtMostOnce,
                retain: false,
            })
            .await;
    }

    async fn local_message(&self, address: &str, args: Vec<OscType>) {
        let from: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        self.dispatcher
            .on_local_message(OscMessage::new(address, args), from)
            .await;
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

fn send(address: &str, value: bool) -> Event {
    Event::Send {
        address: address.to_string(),
        args: vec![OscType::Bool(value)],
    }
}

// =============================================================================
// Broker -> local
// =============================================================================

#[tokio::test]
async fn test_forward_mapped_topic_sends_true_once() {
    let fx = Fixture::new(
        &[
            ("relay/ping", Some("/avatar/ping")),
            ("relay/other", Some("/avatar/other")),
        ],
        &[],
    );
    fx.broker_message("relay/ping", Bytes::from_static(b"hello")).await;
    assert_eq!(fx.events(), vec![send("/avatar/ping", true)]);
}

#[tokio::test]
async fn test_ping_payload_scenario() {
    let fx = Fixture::new(&[("relay/ping", Some("/avatar/ping"))], &[]);
    let payload = PingPayload::new(1_000_000_000, 42, 7).encode();
    fx.broker_message("relay/ping", payload).await;
    assert_eq!(fx.events(), vec![send("/avatar/ping", true)]);
}

#[tokio::test]
async fn test_observe_only_topic_sends_nothing() {
    let fx = Fixture::new(&[("public/example", None)], &[]);
    fx.broker_message("public/example", Bytes::from_static(b"just text"))
        .await;
    assert!(fx.events().is_empty());
}

#[tokio::test]
async fn test_unmapped_topic_sends_nothing() {
    let fx = Fixture::new(&[("relay/ping", Some("/avatar/ping"))], &[]);
    fx.broker_message("relay/pong", Bytes::from_static(b"x")).await;
    fx.broker_message("Relay/Ping", Bytes::from_static(b"x")).await;
    assert!(fx.events().is_empty());
}

#[tokio::test]
async fn test_non_utf8_payload_is_tolerated() {
    let fx = Fixture::new(&[("public/example", None)], &[]);
    fx.broker_message("public/example", Bytes::from_static(&[0xff, 0xfe, 0x00]))
        .await;
    assert!(fx.events().is_empty());
}

// =============================================================================
// Local -> broker
// =============================================================================

#[tokio::test]
async fn test_reverse_true_publishes_then_resets() {
    let fx = Fixture::new(&[], &[("/avatar/alert", Some("relay/alert"))]);
    fx.local_message("/avatar/alert", vec![OscType::Bool(true)])
        .await;

    let events = fx.events();
    assert_eq!(events.len(), 2);
    let Event::Publish { topic, payload } = &events[0] else {
        panic!("expected publish first, got {:?}", events[0]);
    };
    assert_eq!(topic, "relay/alert");
    assert_eq!(payload.len(), PING_PAYLOAD_LEN);
    let ping = PingPayload::decode(payload).unwrap();
    assert_eq!(ping.sender_id, NODE_ID);
    assert_eq!(ping.sequence_id, 0);
    assert!(ping.timestamp_ns > 0);
    assert_eq!(events[1], send("/avatar/alert", false));
}

#[tokio::test]
async fn test_reverse_false_publishes_nothing() {
    let fx = Fixture::new(&[], &[("/avatar/alert", Some("relay/alert"))]);
    fx.local_message("/avatar/alert", vec![OscType::Bool(false)])
        .await;
    fx.local_message("/avatar/alert", vec![OscType::Int(1)]).await;
    fx.local_message("/avatar/alert", vec![]).await;
    assert!(fx.events().is_empty());
}

#[tokio::test]
async fn test_unmapped_address_publishes_nothing() {
    let fx = Fixture::new(&[], &[("/avatar/alert", Some("relay/alert"))]);
    fx.local_message("/avatar/other", vec![OscType::Bool(true)])
        .await;
    assert!(fx.events().is_empty());
}

#[tokio::test]
async fn test_reverse_without_topic_publishes_nothing() {
    let fx = Fixture::new(&[], &[("/avatar/quiet", None)]);
    fx.local_message("/avatar/quiet", vec![OscType::Bool(true)])
        .await;
    assert!(fx.events().is_empty());
}

#[tokio::test]
async fn test_reset_sent_when_publish_fails() {
    let fx = Fixture::new(&[], &[("/avatar/alert", Some("relay/alert"))]);
    fx.broker.connected.store(false, Ordering::SeqCst);

    fx.local_message("/avatar/alert", vec![OscType::Bool(true)])
        .await;
    assert_eq!(fx.events(), vec![send("/avatar/alert", false)]);
}

// =============================================================================
// Custom handlers
// =============================================================================

#[derive(Default)]
struct Recording {
    broker: Mutex<Vec<(String, Option<String>)>>,
    local: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl RelayHandler for Recording {
    async fn on_broker_message(
        &self,
        _ctx: &RelayContext,
        target: Option<&str>,
        message: &BrokerMessage,
    ) -> Result<(), RelayError> {
        self.broker
            .lock()
            .push((message.topic.clone(), target.map(str::to_string)));
        Ok(())
    }

    async fn on_local_message(
        &self,
        ctx: &RelayContext,
        address: &str,
        _args: &[OscType],
        topic: &str,
    ) -> Result<(), RelayError> {
        assert_eq!(ctx.node_id(), NODE_ID);
        assert_eq!(ctx.router().resolve_reverse(address), Some(topic));
        self.local.lock().push((address.to_string(), topic.to_string()));
        Err(RelayError::NotConnected)
    }
}

#[tokio::test]
async fn test_custom_handler_sees_routes() {
    let handler = Arc::new(Recording::default());
    let fx = Fixture::with_handler(
        &[("relay/ping", Some("/avatar/ping")), ("public/example", None)],
        &[("/avatar/alert", Some("relay/alert")), ("/avatar/quiet", None)],
        handler.clone(),
    );

    fx.broker_message("relay/ping", Bytes::new()).await;
    fx.broker_message("public/example", Bytes::new()).await;
    fx.broker_message("unmapped", Bytes::new()).await;
    // Any argument reaches a custom handler; handler errors are isolated
    fx.local_message("/avatar/alert", vec![OscType::Int(3)]).await;
    fx.local_message("/avatar/quiet", vec![OscType::Bool(true)])
        .await;

    assert_eq!(
        *handler.broker.lock(),
        vec![
            ("relay/ping".to_string(), Some("/avatar/ping".to_string())),
            ("public/example".to_string(), None),
        ]
    );
    assert_eq!(
        *handler.local.lock(),
        vec![("/avatar/alert".to_string(), "relay/alert".to_string())]
    );
    assert!(fx.events().is_empty());
}

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_unmapped_topics_never_send(topic in "[a-z/+#]{1,24}") {
            prop_assume!(topic != "relay/ping");
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let fx = Fixture::new(&[("relay/ping", Some("/avatar/ping"))], &[]);
            runtime.block_on(fx.broker_message(&topic, Bytes::from_static(b"x")));
            prop_assert!(fx.events().is_empty());
        }

        #[test]
        fn prop_unmapped_addresses_never_publish(address in "/[a-z/]{0,24}") {
            prop_assume!(address != "/avatar/alert");
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let fx = Fixture::new(&[], &[("/avatar/alert", Some("relay/alert"))]);
            runtime.block_on(fx.local_message(&address, vec![OscType::Bool(true)]));
            prop_assert!(fx.events().is_empty());
        }
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

fn config_for(broker_port: u16) -> Config {
    let mut forward = RouteTable::new();
    forward.insert("relay/ping".to_string(), Some("/avatar/ping".to_string()));
    Config {
        log: LogConfig::default(),
        relay: RelayConfig {
            node_id: Some(NODE_ID),
            ..Default::default()
        },
        broker: BrokerConfig {
            address: "127.0.0.1".to_string(),
            port: broker_port,
            keepalive_seconds: 30,
            tls: false,
            connect_timeout: 1,
            ..Default::default()
        },
        local: LocalConfig {
            listen_port: 0,
            ..Default::default()
        },
        forward_topics: forward,
        reverse_topics: RouteTable::new(),
    }
}

async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_new_bridge_is_idle() {
    let bridge = Bridge::with_default_handler(config_for(1883));
    assert_eq!(bridge.state(), RelayState::Idle);
    assert_eq!(bridge.connection_state(), ConnectionState::Disconnected);
    assert_eq!(bridge.node_id(), NODE_ID);
    assert_eq!(bridge.router().forward_topics(), vec!["relay/ping"]);
    assert_eq!(bridge.local_addr(), None);

    // stop on an idle relay does nothing; join has nothing to wait for
    bridge.stop();
    assert_eq!(bridge.state(), RelayState::Idle);
    assert!(bridge.join(Duration::from_millis(100)).await);
    assert_eq!(bridge.state(), RelayState::Idle);
}

#[tokio::test]
async fn test_start_with_unreachable_broker_stops() {
    let bridge = Bridge::with_default_handler(config_for(closed_port().await));

    let err = bridge.start().await.unwrap_err();
    assert!(matches!(err, RelayError::Network(_)), "{:?}", err);
    assert_eq!(bridge.state(), RelayState::Stopped);
    assert_eq!(bridge.connection_state(), ConnectionState::Failed);
    assert_eq!(bridge.local_addr(), None);

    let err = bridge.start().await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidState(_)));
}

/// Loopback broker session speaking the crate codec
struct BrokerPeer {
    stream: tokio::net::TcpStream,
    buf: bytes::BytesMut,
}

impl BrokerPeer {
    /// Accept the relay, answer CONNECT and read its `subscriptions`
    async fn accept(listener: &tokio::net::TcpListener, subscriptions: usize) -> Self {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut peer = Self {
            stream,
            buf: bytes::BytesMut::new(),
        };
        assert!(matches!(peer.recv().await, Packet::Connect(_)));
        peer.send(Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await;
        for _ in 0..subscriptions {
            assert!(matches!(peer.recv().await, Packet::Subscribe(_)));
        }
        peer
    }

    async fn recv(&mut self) -> Packet {
        use bytes::Buf;
        use tokio::io::AsyncReadExt;

        loop {
            if let Some((packet, n)) = Decoder::new().decode(&self.buf).unwrap() {
                self.buf.advance(n);
                return packet;
            }
            let n = tokio::time::timeout(WAIT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for packet")
                .unwrap();
            assert!(n > 0, "relay closed the connection");
        }
    }

    async fn send(&mut self, packet: Packet) {
        use tokio::io::AsyncWriteExt;

        let mut buf = bytes::BytesMut::new();
        Encoder::new().encode(&packet, &mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }
}

const WAIT: Duration = Duration::from_secs(2);

/// Broker listener plus the OSC application socket the relay sends to
async fn endpoints() -> (tokio::net::TcpListener, UdpSocket, Config) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = config_for(listener.local_addr().unwrap().port());
    config.local.publish_port = app.local_addr().unwrap().port();
    config.relay.tick_interval = Duration::from_millis(20);
    config.reverse_topics.insert(
        "/avatar/alert".to_string(),
        Some("relay/alert".to_string()),
    );
    (listener, app, config)
}

async fn send_osc(app: &UdpSocket, to: SocketAddr, address: &str, value: bool) {
    let mut buf = bytes::BytesMut::new();
    encode_packet(
        &OscPacket::Message(OscMessage::new(address, vec![OscType::Bool(value)])),
        &mut buf,
    )
    .unwrap();
    app.send_to(&buf, to).await.unwrap();
}

async fn recv_osc(app: &UdpSocket) -> OscMessage {
    let mut buf = [0u8; 512];
    let (n, _) = tokio::time::timeout(WAIT, app.recv_from(&mut buf))
        .await
        .expect("timed out waiting for OSC message")
        .unwrap();
    decode_packet(&buf[..n]).unwrap().into_messages().remove(0)
}

#[tokio::test]
async fn test_stop_joins_both_units_and_frees_port() {
    let (listener, _app, config) = endpoints().await;
    let bridge = Bridge::with_default_handler(config);

    let (started, mut peer) = tokio::join!(bridge.start(), BrokerPeer::accept(&listener, 1));
    started.unwrap();
    assert_eq!(bridge.state(), RelayState::Running);
    let local_addr = bridge.local_addr().unwrap();

    bridge.stop();
    assert!(bridge.join(WAIT).await);
    assert_eq!(bridge.state(), RelayState::Stopped);
    assert!(bridge.take_failure().is_none());
    assert_eq!(peer.recv().await, Packet::Disconnect);

    // Listener unit released its socket on shutdown
    UdpSocket::bind(local_addr).await.unwrap();
}

/// Never returns from broker messages; local messages get the ping behaviour
struct StuckBroker {
    entered: Notify,
}

#[async_trait]
impl RelayHandler for StuckBroker {
    async fn on_broker_message(
        &self,
        _ctx: &RelayContext,
        _target: Option<&str>,
        _message: &BrokerMessage,
    ) -> Result<(), RelayError> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn on_local_message(
        &self,
        ctx: &RelayContext,
        address: &str,
        args: &[OscType],
        topic: &str,
    ) -> Result<(), RelayError> {
        DefaultHandler.on_local_message(ctx, address, args, topic).await
    }
}

#[tokio::test]
async fn test_stuck_broker_handler_only_stalls_network_unit() {
    let (listener, app, config) = endpoints().await;
    let handler = Arc::new(StuckBroker {
        entered: Notify::new(),
    });
    let bridge = Bridge::new(config, handler.clone());

    let (started, mut peer) = tokio::join!(bridge.start(), BrokerPeer::accept(&listener, 1));
    started.unwrap();

    peer.send(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "relay/ping".to_string(),
        packet_id: None,
        payload: Bytes::from_static(b"hang"),
    }))
    .await;
    tokio::time::timeout(WAIT, handler.entered.notified())
        .await
        .expect("broker handler never ran");

    // The local side still publishes and resets
    let local_addr = bridge.local_addr().unwrap();
    send_osc(&app, local_addr, "/avatar/alert", true).await;
    match peer.recv().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic, "relay/alert");
            assert_eq!(publish.payload.len(), PING_PAYLOAD_LEN);
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
    let reset = recv_osc(&app).await;
    assert_eq!(reset.address, "/avatar/alert");
    assert_eq!(reset.args, vec![OscType::Bool(false)]);

    // The stuck network unit is reported by join
    bridge.stop();
    assert!(!bridge.join(Duration::from_millis(200)).await);
    assert_eq!(bridge.state(), RelayState::Stopping);

    // while the listener unit has already exited
    UdpSocket::bind(local_addr).await.unwrap();
}
