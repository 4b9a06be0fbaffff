//! Relay handlers
//!
//! A [`RelayHandler`] decides what to do with a routed message. The
//! [`Dispatcher`] sits between the transports and the handler: it resolves
//! routes, logs what is not routed and isolates per-message errors.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::TopicRouter;
use crate::error::RelayError;
use crate::mqtt::{BrokerConnection, BrokerError, BrokerMessage, InboundHandler};
use crate::osc::{ListenerError, LocalListener, LocalMessageHandler, OscMessage, OscType};
use crate::payload::{now_ns, PingPayload, PING_PAYLOAD_LEN};
use crate::protocol::QoS;

/// Outbound side of the broker connection
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError>;
}

#[async_trait]
impl BrokerPublisher for BrokerConnection {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        BrokerConnection::publish(self, topic, payload, qos, retain).await
    }
}

/// Outbound side of the local listener
#[async_trait]
pub trait LocalSender: Send + Sync {
    async fn send(&self, address: &str, args: Vec<OscType>) -> Result<(), ListenerError>;
}

#[async_trait]
impl LocalSender for LocalListener {
    async fn send(&self, address: &str, args: Vec<OscType>) -> Result<(), ListenerError> {
        LocalListener::send(self, address, args).await
    }
}

/// What a handler can reach while processing a message
#[derive(Clone)]
pub struct RelayContext {
    broker: Arc<dyn BrokerPublisher>,
    local: Arc<dyn LocalSender>,
    router: Arc<TopicRouter>,
    node_id: u64,
}

impl RelayContext {
    pub fn new(
        broker: Arc<dyn BrokerPublisher>,
        local: Arc<dyn LocalSender>,
        router: Arc<TopicRouter>,
        node_id: u64,
    ) -> Self {
        Self {
            broker,
            local,
            router,
            node_id,
        }
    }

    /// Publish on the broker. Fails with `NotConnected` when the session is down.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RelayError> {
        self.broker.publish(topic, payload, qos, retain).await?;
        Ok(())
    }

    /// Send an OSC message to the local publish target
    pub async fn send_local(&self, address: &str, args: Vec<OscType>) -> Result<(), RelayError> {
        self.local.send(address, args).await?;
        Ok(())
    }

    pub async fn send_bool(&self, address: &str, value: bool) -> Result<(), RelayError> {
        self.send_local(address, vec![OscType::Bool(value)]).await
    }

    /// Sender id stamped into outgoing pings
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }
}

/// Reacts to routed messages from either transport
#[async_trait]
pub trait RelayHandler: Send + Sync {
    /// A broker message on a forward-mapped topic. `target` is `None` for an
    /// observe-only route.
    async fn on_broker_message(
        &self,
        ctx: &RelayContext,
        target: Option<&str>,
        message: &BrokerMessage,
    ) -> Result<(), RelayError>;

    /// A local message on a reverse-mapped address with a paired topic
    async fn on_local_message(
        &self,
        ctx: &RelayContext,
        address: &str,
        args: &[OscType],
        topic: &str,
    ) -> Result<(), RelayError>;
}

/// Ping relay behaviour.
///
/// Broker side: pulse the paired OSC address with `true` and report the
/// latency of ping payloads. Local side: a `true` on a reverse-mapped
/// address publishes a fresh ping and resets the address to `false`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

#[async_trait]
impl RelayHandler for DefaultHandler {
    async fn on_broker_message(
        &self,
        ctx: &RelayContext,
        target: Option<&str>,
        message: &BrokerMessage,
    ) -> Result<(), RelayError> {
        let Some(target) = target else {
            info!(
                "{}: {}",
                message.topic,
                String::from_utf8_lossy(&message.payload)
            );
            return Ok(());
        };

        let sent = ctx.send_bool(target, true).await;

        if message.payload.len() == PING_PAYLOAD_LEN {
            let ping = PingPayload::decode(&message.payload)?;
            info!(
                "{}: user {} in msg {} delta:{}ms",
                message.topic,
                ping.sender_id,
                ping.sequence_id,
                ping.latency_ms(now_ns())
            );
        }

        sent
    }

    async fn on_local_message(
        &self,
        ctx: &RelayContext,
        address: &str,
        args: &[OscType],
        topic: &str,
    ) -> Result<(), RelayError> {
        if args.first() != Some(&OscType::Bool(true)) {
            return Ok(());
        }

        let ping = PingPayload::now(ctx.node_id(), 0);
        let published = ctx
            .publish(topic, ping.encode(), QoS::AtMostOnce, false)
            .await;
        if published.is_ok() {
            info!("{}: published to {}", address, topic);
        }

        // Reset even when the publish failed so the flag never stays raised
        ctx.send_bool(address, false).await?;
        published
    }
}

/// Routes transport callbacks into a [`RelayHandler`]
pub struct Dispatcher {
    ctx: RelayContext,
    handler: Arc<dyn RelayHandler>,
}

impl Dispatcher {
    pub fn new(ctx: RelayContext, handler: Arc<dyn RelayHandler>) -> Self {
        Self { ctx, handler }
    }
}

#[async_trait]
impl InboundHandler for Dispatcher {
    async fn on_broker_message(&self, message: BrokerMessage) {
        let router = self.ctx.router();
        if !router.is_forward_routed(&message.topic) {
            info!(
                "{} (unmapped): {}",
                message.topic,
                String::from_utf8_lossy(&message.payload)
            );
            return;
        }

        let target = router.resolve_forward(&message.topic);
        if let Err(e) = self
            .handler
            .on_broker_message(&self.ctx, target, &message)
            .await
        {
            warn!("Failed to relay broker message on '{}': {}", message.topic, e);
        }
    }
}

#[async_trait]
impl LocalMessageHandler for Dispatcher {
    async fn on_local_message(&self, message: OscMessage, from: SocketAddr) {
        let router = self.ctx.router();
        if !router.is_reverse_routed(&message.address) {
            debug!("Ignoring unmapped OSC address {} from {}", message.address, from);
            return;
        }

        let Some(topic) = router.resolve_reverse(&message.address) else {
            info!("{}: {:?} (no broker topic)", message.address, message.args);
            return;
        };

        if let Err(e) = self
            .handler
            .on_local_message(&self.ctx, &message.address, &message.args, topic)
            .await
        {
            warn!("Failed to relay OSC message on '{}': {}", message.address, e);
        }
    }
}
