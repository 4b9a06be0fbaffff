//! Relay lifecycle
//!
//! Owns the broker connection, the local listener and the two units that
//! drive them:
//! - the network unit ticks the broker connection until shutdown
//! - the listener unit serves OSC datagrams until shutdown
//!
//! Both watch one shutdown channel. A unit that ends on its own (auth
//! failure, lost connection, socket error) flips the channel so the other
//! unwinds too.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{DefaultHandler, Dispatcher, RelayContext, RelayHandler, TopicRouter};
use crate::config::{Config, ReconnectConfig};
use crate::error::RelayError;
use crate::mqtt::{BrokerConnection, BrokerError, ConnectionState};
use crate::osc::{ListenerError, LocalListener};

/// Relay lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayState::Idle => "idle",
            RelayState::Running => "running",
            RelayState::Stopping => "stopping",
            RelayState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// State shared with the spawned units
struct Shared {
    /// Set once; both units exit when it flips
    shutdown: watch::Sender<bool>,
    /// Set when any unit has exited
    exited: watch::Sender<bool>,
    /// First terminal error reported by a unit
    failure: Mutex<Option<RelayError>>,
}

/// Bidirectional MQTT <-> OSC relay
pub struct Bridge {
    config: Config,
    router: Arc<TopicRouter>,
    connection: Arc<BrokerConnection>,
    handler: Arc<dyn RelayHandler>,
    node_id: u64,
    state: RwLock<RelayState>,
    listener: Mutex<Option<Arc<LocalListener>>>,
    units: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl Bridge {
    /// Build a relay with a custom handler. Nothing touches the network
    /// until [`start`](Self::start).
    pub fn new(config: Config, handler: Arc<dyn RelayHandler>) -> Self {
        let router = Arc::new(TopicRouter::from_tables(
            &config.forward_topics,
            &config.reverse_topics,
        ));
        let connection = Arc::new(BrokerConnection::new(
            config.broker.clone(),
            router.forward_topics(),
        ));
        let node_id = config.relay.resolve_node_id();

        let (shutdown, _) = watch::channel(false);
        let (exited, _) = watch::channel(false);

        Self {
            config,
            router,
            connection,
            handler,
            node_id,
            state: RwLock::new(RelayState::Idle),
            listener: Mutex::new(None),
            units: tokio::sync::Mutex::new(Vec::new()),
            shared: Arc::new(Shared {
                shutdown,
                exited,
                failure: Mutex::new(None),
            }),
        }
    }

    /// Build a relay running the ping behaviour of [`DefaultHandler`]
    pub fn with_default_handler(config: Config) -> Self {
        Self::new(config, Arc::new(DefaultHandler))
    }

    pub fn state(&self) -> RelayState {
        *self.state.read()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Address the local listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.local_addr())
    }

    /// Terminal error that ended a unit, if any
    pub fn take_failure(&self) -> Option<RelayError> {
        self.shared.failure.lock().take()
    }

    fn set_state(&self, next: RelayState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            debug!("Relay {} -> {}", prev, next);
        }
    }

    /// Connect the broker, bind the listener and spawn both units.
    ///
    /// Auth and network failures are returned and leave the relay
    /// `Stopped`; nothing is spawned in that case.
    pub async fn start(&self) -> Result<(), RelayError> {
        {
            let mut state = self.state.write();
            if *state != RelayState::Idle {
                return Err(RelayError::InvalidState("start requires an idle relay"));
            }
            *state = RelayState::Running;
        }

        info!(
            "Starting relay (node {}, {} forward, {} reverse routes)",
            self.node_id,
            self.router.forward_len(),
            self.router.reverse_len()
        );

        if let Err(e) = self.connection.connect().await {
            self.set_state(RelayState::Stopped);
            return Err(e.into());
        }
        for (topic, address) in self.router.forward_routes() {
            info!("+ mqtt|{} -> osc|{}", topic, address.unwrap_or("-"));
        }
        for (address, topic) in self.router.reverse_routes() {
            info!("+ osc|{} -> mqtt|{}", address, topic.unwrap_or("-"));
        }

        let listener = match LocalListener::bind(
            self.config.local.listen_addr(),
            self.config.local.publish_addr(),
        )
        .await
        {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                error!("{}", e);
                self.connection.disconnect().await;
                self.set_state(RelayState::Stopped);
                return Err(e.into());
            }
        };

        let ctx = RelayContext::new(
            self.connection.clone(),
            listener.clone(),
            self.router.clone(),
            self.node_id,
        );
        let dispatcher = Arc::new(Dispatcher::new(ctx, self.handler.clone()));

        let network = run_network(
            self.connection.clone(),
            dispatcher.clone(),
            self.config.relay.tick_interval,
            self.config.broker.reconnect.clone(),
            self.shared.shutdown.subscribe(),
        );
        let local = run_listener(
            listener.clone(),
            dispatcher,
            self.shared.shutdown.subscribe(),
        );

        *self.listener.lock() = Some(listener);
        let mut units = self.units.lock().await;
        units.push(spawn_unit("network", network, self.shared.clone()));
        units.push(spawn_unit("listener", local, self.shared.clone()));

        info!("Relay running");
        Ok(())
    }

    /// Signal both units to stop. Only acts on a running relay.
    pub fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state != RelayState::Running {
                return;
            }
            *state = RelayState::Stopping;
        }
        info!("Stopping relay");

        if let Some(listener) = self.listener.lock().as_ref() {
            listener.shutdown();
        }
        self.shared.shutdown.send_replace(true);
    }

    /// Wait up to `timeout` for both units to finish. Returns `true` when
    /// they have, and the relay is then `Stopped`.
    pub async fn join(&self, timeout: Duration) -> bool {
        let mut units = self.units.lock().await;
        units.retain(|unit| !unit.is_finished());

        let joined = tokio::time::timeout(timeout, async {
            for unit in units.iter_mut() {
                let _ = unit.await;
            }
        })
        .await
        .is_ok();

        if !joined {
            warn!("Relay units still running after {:?}", timeout);
            return false;
        }

        units.clear();
        if self.state() != RelayState::Idle {
            self.set_state(RelayState::Stopped);
        }
        true
    }

    /// Resolve once either unit has exited, whether from `stop` or from a
    /// terminal error. Never resolves for a relay that was not started.
    pub async fn wait(&self) {
        let mut exited = self.shared.exited.subscribe();
        let _ = exited.wait_for(|exited| *exited).await;
    }
}

fn spawn_unit<F>(name: &'static str, unit: F, shared: Arc<Shared>) -> JoinHandle<()>
where
    F: Future<Output = Result<(), RelayError>> + Send + 'static,
{
    tokio::spawn(async move {
        match unit.await {
            Ok(()) => debug!("{} unit stopped", name),
            Err(e) => {
                error!("{} unit terminated: {}", name, e);
                shared.failure.lock().get_or_insert(e);
            }
        }
        shared.shutdown.send_replace(true);
        shared.exited.send_replace(true);
    })
}

/// Network unit: tick the broker connection until shutdown
async fn run_network(
    connection: Arc<BrokerConnection>,
    dispatcher: Arc<Dispatcher>,
    tick_interval: Duration,
    reconnect: Option<ReconnectConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let result = loop {
        if *shutdown.borrow_and_update() {
            break Ok(());
        }

        let outcome = connection.tick(tick_interval, dispatcher.as_ref()).await;
        if outcome.is_err() && *shutdown.borrow() {
            break Ok(());
        }

        match outcome {
            Ok(()) => {}
            Err(e @ (BrokerError::ConnectionLost(_) | BrokerError::NotConnected)) => {
                let Some(ref policy) = reconnect else {
                    break Err(e.into());
                };
                match reconnect_with_backoff(&connection, policy, &mut shutdown).await {
                    Ok(true) => info!("Reconnected to broker"),
                    Ok(false) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            Err(e) => break Err(e.into()),
        }
    };

    connection.disconnect().await;
    result
}

/// Retry `connect` with exponential backoff. `Ok(false)` means shutdown
/// was requested first.
async fn reconnect_with_backoff(
    connection: &BrokerConnection,
    policy: &ReconnectConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, RelayError> {
    let mut retry_interval = policy.initial_interval_duration();
    let max_retry = policy.max_interval_duration();

    loop {
        debug!("Reconnecting in {:?}", retry_interval);
        tokio::select! {
            _ = tokio::time::sleep(retry_interval) => {}
            _ = stopped(shutdown) => return Ok(false),
        }

        match connection.connect().await {
            Ok(_) => return Ok(true),
            Err(BrokerError::Auth(msg)) => return Err(RelayError::Auth(msg)),
            Err(e) => {
                warn!("Reconnect failed: {}", e);
                retry_interval = next_backoff(retry_interval, max_retry);
            }
        }
    }
}

/// Double the retry interval, capped at `max`
fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current.saturating_mul(2), max)
}

/// Listener unit: serve datagrams until shutdown, letting the message in
/// flight finish
async fn run_listener(
    listener: Arc<LocalListener>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let serve = listener.serve(dispatcher.as_ref());
    tokio::pin!(serve);

    let finished = tokio::select! {
        result = &mut serve => Some(result),
        _ = stopped(&mut shutdown) => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            listener.shutdown();
            serve.await
        }
    };

    match result {
        // Shut down before serve ever ran
        Err(ListenerError::Closed) => Ok(()),
        other => other.map_err(Into::into),
    }
}

/// Resolve once shutdown is signalled, without holding the watch guard
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let max = Duration::from_secs(60);
        assert_eq!(next_backoff(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(40), max), max);
        assert_eq!(next_backoff(Duration::MAX, Duration::MAX), Duration::MAX);
        assert_eq!(next_backoff(Duration::MAX / 2 + Duration::from_secs(1), max), max);
    }
}
