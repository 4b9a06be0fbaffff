//! OSC datagram listener
//!
//! Binds one UDP socket, decodes every datagram into OSC messages and hands
//! each one to a single handler (catch-all route). The same socket is used
//! to send OSC messages to the configured publish target.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::{decode_packet, encode_packet, OscError, OscMessage, OscPacket, OscType};

/// Largest datagram accepted (maximum UDP payload)
const MAX_DATAGRAM: usize = 65_507;

/// Error type for the local listener
#[derive(Debug)]
pub enum ListenerError {
    /// Could not bind the listen address
    Bind(SocketAddr, io::Error),
    /// Socket I/O failed
    Io(io::Error),
    /// Outbound message could not be encoded
    Encode(OscError),
    /// The listener has been shut down
    Closed,
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ListenerError::Io(e) => write!(f, "IO error: {}", e),
            ListenerError::Encode(e) => write!(f, "Encode error: {}", e),
            ListenerError::Closed => write!(f, "Listener is shut down"),
        }
    }
}

impl std::error::Error for ListenerError {}

impl From<OscError> for ListenerError {
    fn from(e: OscError) -> Self {
        ListenerError::Encode(e)
    }
}

/// Receives every OSC message delivered to the listener
#[async_trait]
pub trait LocalMessageHandler: Send + Sync {
    async fn on_local_message(&self, message: OscMessage, from: SocketAddr);
}

/// UDP endpoint for the local control protocol
pub struct LocalListener {
    /// Taken on shutdown so the socket closes once `serve` returns
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    send_target: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl LocalListener {
    /// Bind the listen address. Outbound messages go to `send_target`.
    pub async fn bind(
        bind_addr: SocketAddr,
        send_target: SocketAddr,
    ) -> Result<Self, ListenerError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ListenerError::Bind(bind_addr, e))?;
        let local_addr = socket.local_addr().map_err(ListenerError::Io)?;
        let (shutdown, _) = watch::channel(false);

        info!("OSC listening on {} (sending to {})", local_addr, send_target);

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            local_addr,
            send_target,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send_target(&self) -> SocketAddr {
        self.send_target
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, ListenerError> {
        self.socket.lock().clone().ok_or(ListenerError::Closed)
    }

    /// Receive datagrams until [`shutdown`](Self::shutdown) is called.
    ///
    /// Datagrams that fail to decode are logged and skipped. Bundles are
    /// flattened, so the handler always sees plain messages.
    pub async fn serve(&self, handler: &dyn LocalMessageHandler) -> Result<(), ListenerError> {
        let socket = self.socket()?;
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {}

                result = socket.recv_from(&mut buf) => {
                    let (n, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            // ICMP port unreachable from an earlier send surfaces
                            // here on some platforms; it does not end the loop
                            warn!("OSC receive error: {}", e);
                            continue;
                        }
                    };

                    match decode_packet(&buf[..n]) {
                        Ok(packet) => {
                            for message in packet.into_messages() {
                                trace!("OSC {} {:?} from {}", message.address, message.args, from);
                                handler.on_local_message(message, from).await;
                            }
                        }
                        Err(e) => {
                            debug!("Dropping undecodable datagram from {}: {}", from, e);
                        }
                    }
                }
            }
        }

        debug!("OSC listener on {} stopped", self.local_addr);
        Ok(())
    }

    /// Send a message with the given arguments to the publish target
    pub async fn send(&self, address: &str, args: Vec<OscType>) -> Result<(), ListenerError> {
        let socket = self.socket()?;
        let mut buf = BytesMut::new();
        encode_packet(&OscPacket::Message(OscMessage::new(address, args)), &mut buf)?;
        socket
            .send_to(&buf, self.send_target)
            .await
            .map_err(ListenerError::Io)?;
        Ok(())
    }

    pub async fn send_bool(&self, address: &str, value: bool) -> Result<(), ListenerError> {
        self.send(address, vec![OscType::Bool(value)]).await
    }

    /// Stop `serve` and release the socket. Safe to call from any task,
    /// and more than once.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if self.socket.lock().take().is_some() {
            debug!("OSC listener on {} shutting down", self.local_addr);
        }
    }
}
