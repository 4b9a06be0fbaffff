//! Broker session
//!
//! The stream is split once the handshake completes. The read half is owned
//! by whoever calls `tick`, the write half is shared by `tick` (acks,
//! keep-alive) and `publish`. Each half sits behind its own async mutex so a
//! publish never waits on a pending read.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use super::{tls, BrokerError, BrokerMessage, ConnectionState, InboundHandler};
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::config::BrokerConfig;
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, PacketId, Publish, QoS, Subscribe, Subscription,
};

/// Plain TCP or TLS, erased so both share one code path
trait BrokerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BrokerStream for T {}

type Stream = Box<dyn BrokerStream>;

/// Read side state: the half plus bytes not yet decoded
struct Inbound {
    half: ReadHalf<Stream>,
    buf: BytesMut,
}

/// Keep-alive bookkeeping
struct KeepAlive {
    last_outbound: Instant,
    /// Set when a PINGREQ is outstanding
    ping_sent: Option<Instant>,
}

/// MQTT v3.1.1 client session with a single broker
pub struct BrokerConnection {
    config: BrokerConfig,
    /// Topics subscribed after every successful connect
    subscriptions: Vec<String>,
    state: RwLock<ConnectionState>,
    inbound: tokio::sync::Mutex<Option<Inbound>>,
    outbound: tokio::sync::Mutex<Option<WriteHalf<Stream>>>,
    keepalive: Mutex<KeepAlive>,
    encoder: Encoder,
    decoder: Decoder,
    next_packet_id: AtomicU16,
    /// Set by `disconnect` so the close is not reported as unexpected
    closing: AtomicBool,
}

impl BrokerConnection {
    pub fn new(config: BrokerConfig, subscriptions: Vec<String>) -> Self {
        Self {
            config,
            subscriptions,
            state: RwLock::new(ConnectionState::Disconnected),
            inbound: tokio::sync::Mutex::new(None),
            outbound: tokio::sync::Mutex::new(None),
            keepalive: Mutex::new(KeepAlive {
                last_outbound: Instant::now(),
                ping_sent: None,
            }),
            encoder: Encoder::new(),
            decoder: Decoder::new().with_max_packet_size(DEFAULT_MAX_PACKET_SIZE),
            next_packet_id: AtomicU16::new(1),
            closing: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            info!(
                "Broker {}: {} -> {}",
                self.config.socket_address(),
                prev,
                next
            );
        }
    }

    /// Get the next packet ID, skipping 0
    fn next_packet_id(&self) -> u16 {
        let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.next_packet_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    /// Open the session and subscribe every forward topic.
    ///
    /// Refused credentials are [`BrokerError::Auth`], any other handshake
    /// failure is [`BrokerError::Network`]. Both leave the state `Failed`.
    pub async fn connect(&self) -> Result<ConnectionState, BrokerError> {
        self.closing.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.handshake().await {
            error!("Broker {}: {}", self.config.socket_address(), e);
            self.set_state(ConnectionState::Failed);
            return Err(e);
        }
        self.set_state(ConnectionState::Connected);

        for topic in &self.subscriptions {
            let subscribe = Packet::Subscribe(Subscribe {
                packet_id: self.next_packet_id(),
                subscriptions: vec![Subscription {
                    filter: topic.clone(),
                    qos: self.config.subscribe_qos(),
                }],
            });
            if let Err(e) = self.send(&subscribe).await {
                self.drop_session();
                return Err(BrokerError::ConnectionLost(format!(
                    "subscribe to '{}' failed: {}",
                    topic, e
                )));
            }
            debug!("Subscribed to '{}'", topic);
        }

        Ok(ConnectionState::Connected)
    }

    async fn open_stream(&self) -> Result<Stream, BrokerError> {
        let connect_timeout = self.config.connect_timeout_duration();
        let address = self.config.socket_address();

        let tcp = timeout(connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| BrokerError::Network(format!("connect to {} timed out", address)))?
            .map_err(|e| BrokerError::Network(format!("connect to {}: {}", address, e)))?;
        let _ = tcp.set_nodelay(true);

        if !self.config.tls {
            debug!("TCP connected to {}", address);
            return Ok(Box::new(tcp));
        }

        let (connector, server_name) =
            tls::connector(&self.config).map_err(|e| BrokerError::Network(e.to_string()))?;
        let stream = timeout(connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| BrokerError::Network("TLS handshake timed out".to_string()))?
            .map_err(|e| BrokerError::Network(format!("TLS handshake: {}", e)))?;

        debug!("TLS connected to {}", address);
        Ok(Box::new(stream))
    }

    async fn handshake(&self) -> Result<(), BrokerError> {
        let stream = self.open_stream().await?;
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let connect = Packet::Connect(Box::new(Connect {
            client_id: self.config.client_id.clone(),
            clean_session: true,
            keep_alive: self.config.keepalive_seconds,
            username: self.config.username.clone(),
            password: self
                .config
                .password
                .as_ref()
                .map(|p| Bytes::from(p.clone().into_bytes())),
        }));

        let mut buf = BytesMut::new();
        self.encoder.encode(&connect, &mut buf)?;
        write_half
            .write_all(&buf)
            .await
            .map_err(|e| BrokerError::Network(format!("send CONNECT: {}", e)))?;
        write_half
            .flush()
            .await
            .map_err(|e| BrokerError::Network(format!("send CONNECT: {}", e)))?;

        debug!("CONNECT sent as '{}'", self.config.client_id);

        // Wait for CONNACK
        let mut read_buf = BytesMut::with_capacity(4096);
        let deadline = Instant::now() + self.config.connect_timeout_duration();
        let connack = loop {
            if let Some((packet, n)) = self
                .decoder
                .decode(&read_buf)
                .map_err(|e| BrokerError::Network(format!("invalid CONNACK: {}", e)))?
            {
                read_buf.advance(n);
                break packet;
            }

            let n = tokio::time::timeout_at(deadline, read_half.read_buf(&mut read_buf))
                .await
                .map_err(|_| BrokerError::Network("timed out waiting for CONNACK".to_string()))?
                .map_err(|e| BrokerError::Network(format!("read CONNACK: {}", e)))?;
            if n == 0 {
                return Err(BrokerError::Network(
                    "connection closed before CONNACK".to_string(),
                ));
            }
        };

        match connack {
            Packet::ConnAck(connack) => match connack.return_code {
                ConnectReturnCode::Accepted => {
                    debug!("CONNACK accepted (session_present={})", connack.session_present);
                }
                code if code.is_auth_failure() => {
                    return Err(BrokerError::Auth(code.to_string()));
                }
                code => {
                    return Err(BrokerError::Network(code.to_string()));
                }
            },
            other => {
                return Err(BrokerError::Network(format!(
                    "expected CONNACK, got packet type {}",
                    other.packet_type()
                )));
            }
        }

        *self.keepalive.lock() = KeepAlive {
            last_outbound: Instant::now(),
            ping_sent: None,
        };
        *self.inbound.lock().await = Some(Inbound {
            half: read_half,
            buf: read_buf,
        });
        *self.outbound.lock().await = Some(write_half);
        Ok(())
    }

    /// Encode and write one packet on the shared write half
    async fn send(&self, packet: &Packet) -> Result<(), BrokerError> {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf)?;

        let mut outbound = self.outbound.lock().await;
        let half = outbound.as_mut().ok_or(BrokerError::NotConnected)?;
        half.write_all(&buf).await?;
        half.flush().await?;
        drop(outbound);

        self.keepalive.lock().last_outbound = Instant::now();
        Ok(())
    }

    /// Publish a message. Dropped with `NotConnected` unless connected.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        if self.state() != ConnectionState::Connected {
            return Err(BrokerError::NotConnected);
        }

        let packet_id = (qos != QoS::AtMostOnce).then(|| self.next_packet_id());
        let publish = Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload,
        });
        self.send(&publish).await?;
        trace!("Published to '{}'", topic);
        Ok(())
    }

    /// Process inbound traffic for at most `wait`.
    ///
    /// Every PUBLISH decoded is handed to `handler` before this returns.
    /// EOF, socket errors, a malformed stream or a missing PINGRESP count as
    /// an unexpected disconnect: the state becomes `Disconnected` and
    /// [`BrokerError::ConnectionLost`] is returned.
    pub async fn tick(
        &self,
        wait: Duration,
        handler: &dyn InboundHandler,
    ) -> Result<(), BrokerError> {
        if self.state() != ConnectionState::Connected {
            if let Ok(mut inbound) = self.inbound.try_lock() {
                inbound.take();
            }
            return Err(BrokerError::NotConnected);
        }

        match self.pump(wait, handler).await {
            Ok(()) => Ok(()),
            Err(_) if self.closing.load(Ordering::SeqCst) => Ok(()),
            Err(BrokerError::NotConnected) => Err(BrokerError::NotConnected),
            Err(e) => {
                warn!(
                    "Broker {}: unexpected disconnect: {}",
                    self.config.socket_address(),
                    e
                );
                self.drop_session();
                Err(match e {
                    BrokerError::ConnectionLost(msg) => BrokerError::ConnectionLost(msg),
                    other => BrokerError::ConnectionLost(other.to_string()),
                })
            }
        }
    }

    async fn pump(&self, wait: Duration, handler: &dyn InboundHandler) -> Result<(), BrokerError> {
        self.check_keepalive().await?;

        let packets = {
            let mut guard = self.inbound.lock().await;
            let inbound = guard.as_mut().ok_or(BrokerError::NotConnected)?;

            let mut packets = self.drain(&mut inbound.buf)?;
            if packets.is_empty() {
                match timeout(wait, inbound.half.read_buf(&mut inbound.buf)).await {
                    Err(_) => return Ok(()),
                    Ok(Ok(0)) => {
                        return Err(BrokerError::ConnectionLost(
                            "connection closed by broker".to_string(),
                        ))
                    }
                    Ok(Ok(_)) => packets = self.drain(&mut inbound.buf)?,
                    Ok(Err(e)) => return Err(BrokerError::Io(e)),
                }
            }
            packets
        };

        for packet in packets {
            self.handle_packet(packet, handler).await?;
        }
        Ok(())
    }

    /// Decode every complete packet in `buf`
    fn drain(&self, buf: &mut BytesMut) -> Result<Vec<Packet>, BrokerError> {
        let mut packets = Vec::new();
        while let Some((packet, n)) = self.decoder.decode(buf)? {
            buf.advance(n);
            packets.push(packet);
        }
        Ok(packets)
    }

    async fn handle_packet(
        &self,
        packet: Packet,
        handler: &dyn InboundHandler,
    ) -> Result<(), BrokerError> {
        match packet {
            Packet::Publish(publish) => {
                let ack = match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(id)) => Some(Packet::PubAck(PacketId(id))),
                    (QoS::ExactlyOnce, Some(id)) => Some(Packet::PubRec(PacketId(id))),
                    _ => None,
                };

                handler
                    .on_broker_message(BrokerMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                        qos: publish.qos,
                        retain: publish.retain,
                    })
                    .await;

                if let Some(ack) = ack {
                    self.send(&ack).await?;
                }
            }
            Packet::PubRel(id) => self.send(&Packet::PubComp(id)).await?,
            Packet::PubRec(id) => self.send(&Packet::PubRel(id)).await?,
            Packet::PubAck(id) | Packet::PubComp(id) => {
                trace!("Publish {} acknowledged", id.0);
            }
            Packet::PingResp => {
                trace!("PINGRESP received");
                self.keepalive.lock().ping_sent = None;
            }
            Packet::SubAck(suback) => {
                if suback.return_codes.iter().any(Option::is_none) {
                    warn!("Broker refused subscription (packet {})", suback.packet_id);
                } else {
                    debug!("SUBACK received (packet {})", suback.packet_id);
                }
            }
            other => {
                warn!("Ignoring unexpected packet type {}", other.packet_type());
            }
        }
        Ok(())
    }

    /// Send PINGREQ when the link has been idle for a keep-alive interval,
    /// and fail if the previous one went unanswered for as long.
    async fn check_keepalive(&self) -> Result<(), BrokerError> {
        let Some(interval) = self.config.keepalive_duration() else {
            return Ok(());
        };

        let due = {
            let keepalive = self.keepalive.lock();
            if let Some(sent) = keepalive.ping_sent {
                if sent.elapsed() >= interval {
                    return Err(BrokerError::ConnectionLost(
                        "no PINGRESP within keep-alive interval".to_string(),
                    ));
                }
                false
            } else {
                keepalive.last_outbound.elapsed() >= interval
            }
        };

        if due {
            self.send(&Packet::PingReq).await?;
            self.keepalive.lock().ping_sent = Some(Instant::now());
            trace!("PINGREQ sent");
        }
        Ok(())
    }

    /// Forget both halves after an unexpected drop
    fn drop_session(&self) {
        if let Ok(mut inbound) = self.inbound.try_lock() {
            inbound.take();
        }
        if let Ok(mut outbound) = self.outbound.try_lock() {
            outbound.take();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Close the session. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);

        let mut buf = BytesMut::new();
        let writer = self.outbound.lock().await.take();
        if let Some(mut half) = writer {
            if self.encoder.encode(&Packet::Disconnect, &mut buf).is_ok() {
                let _ = half.write_all(&buf).await;
            }
            let _ = half.shutdown().await;
            debug!("DISCONNECT sent");
        }

        // A tick in progress holds the read half; the next tick releases it
        if let Ok(mut inbound) = self.inbound.try_lock() {
            inbound.take();
        }

        if self.state() != ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}
