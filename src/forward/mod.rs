//! Host port forwarding.
//!
//! [`PortForwardService`] owns the live table of host-port → guest-port
//! mappings. Each enabled mapping has one accept loop; each accepted host
//! connection gets its own relay task that dials the guest through a
//! [`GuestDialer`] and copies bytes both ways until either side closes.
//!
//! Removing or disabling a mapping only stops its listener. Relays that are
//! already running drain on their own; [`PortForwardService::shutdown`] is
//! the hard stop used at VM teardown.

pub mod dialer;

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use dialer::{pump_stream, GuestChannel, GuestDialer, GuestSender, TcpDialer};

use crate::{Error, Result};

/// Events buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A rule routing one host TCP port to one guest TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl PortForward {
    pub fn new(host_port: u16, guest_port: u16) -> Self {
        Self {
            host_port,
            guest_port,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_port == 0 {
            return Err(Error::Config("host port must be non-zero".into()));
        }
        if self.guest_port == 0 {
            return Err(Error::Config(format!(
                "guest port for host port {} must be non-zero",
                self.host_port
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for PortForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> guest:{}", self.host_port, self.guest_port)?;
        if !self.enabled {
            write!(f, " (disabled)")?;
        }
        Ok(())
    }
}

/// Changes to the forwarding table, for observers that persist or display it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardEvent {
    Listening { host_port: u16, addr: SocketAddr },
    BindFailed { host_port: u16, error: String },
    Added(PortForward),
    Removed(PortForward),
    /// A mapping was enabled or disabled in place.
    Updated(PortForward),
}

/// A mapping from `start` whose host port could not be bound.
#[derive(Debug)]
pub struct BindFailure {
    pub forward: PortForward,
    pub error: Error,
}

struct Listener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ServiceState {
    forwards: BTreeMap<u16, PortForward>,
    listeners: HashMap<u16, Listener>,
}

/// What every relay needs, cloned into each task.
#[derive(Clone)]
struct RelayContext {
    dialer: Arc<dyn GuestDialer>,
    relays: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

/// Keeps [`PortForwardService::active_relays`] accurate on every exit path.
struct RelayGuard(Arc<AtomicUsize>);

impl RelayGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Live port-forward table with one listener per enabled mapping.
pub struct PortForwardService {
    bind_ip: IpAddr,
    state: Mutex<ServiceState>,
    events: broadcast::Sender<ForwardEvent>,
    shutdown_tx: watch::Sender<bool>,
    relay_ctx: RelayContext,
}

impl PortForwardService {
    pub fn new(dialer: Arc<dyn GuestDialer>, bind_ip: IpAddr) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            bind_ip,
            state: Mutex::new(ServiceState::default()),
            events,
            shutdown_tx,
            relay_ctx: RelayContext {
                dialer,
                relays: Arc::new(AtomicUsize::new(0)),
                shutdown: shutdown_rx,
            },
        }
    }

    /// Listen on loopback only.
    pub fn localhost(dialer: Arc<dyn GuestDialer>) -> Self {
        Self::new(dialer, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Record every mapping and bind each enabled one.
    ///
    /// A mapping that fails to bind is reported and stays in the table as
    /// not-listening; it does not stop the others.
    pub async fn start(&self, forwards: &[PortForward]) -> Vec<BindFailure> {
        let mut failures = Vec::new();
        let mut state = self.state.lock().await;

        for forward in forwards {
            if let Err(error) = forward.validate() {
                failures.push(BindFailure {
                    forward: *forward,
                    error,
                });
                continue;
            }
            if state
                .forwards
                .get(&forward.host_port)
                .is_some_and(|existing| existing.enabled)
            {
                failures.push(BindFailure {
                    forward: *forward,
                    error: Error::PortInUse {
                        port: forward.host_port,
                    },
                });
                continue;
            }

            if forward.enabled {
                match self.bind(*forward).await {
                    Ok(listener) => {
                        state.listeners.insert(forward.host_port, listener);
                    }
                    Err(error) => {
                        warn!("Port forward {} failed to bind: {}", forward, error);
                        self.emit(ForwardEvent::BindFailed {
                            host_port: forward.host_port,
                            error: error.to_string(),
                        });
                        failures.push(BindFailure {
                            forward: *forward,
                            error,
                        });
                    }
                }
            }
            state.forwards.insert(forward.host_port, *forward);
            self.emit(ForwardEvent::Added(*forward));
        }

        info!(
            "Port forwarding started: {} mapping(s), {} listening, {} failed",
            state.forwards.len(),
            state.listeners.len(),
            failures.len()
        );
        failures
    }

    /// Add one mapping at runtime. Rejected without side effects if an
    /// enabled mapping already owns the host port or the bind fails.
    pub async fn add_forward(&self, forward: PortForward) -> Result<()> {
        forward.validate()?;
        let mut state = self.state.lock().await;

        if state
            .forwards
            .get(&forward.host_port)
            .is_some_and(|existing| existing.enabled)
        {
            return Err(Error::PortInUse {
                port: forward.host_port,
            });
        }

        if forward.enabled {
            let listener = self.bind(forward).await?;
            state.listeners.insert(forward.host_port, listener);
        }
        state.forwards.insert(forward.host_port, forward);
        drop(state);

        info!("Added port forward {}", forward);
        self.emit(ForwardEvent::Added(forward));
        Ok(())
    }

    /// Remove a mapping and stop its listener. Open relays keep running.
    pub async fn remove_forward(&self, host_port: u16) -> Result<PortForward> {
        let mut state = self.state.lock().await;
        let forward = state
            .forwards
            .remove(&host_port)
            .ok_or(Error::ForwardNotFound(host_port))?;
        if let Some(listener) = state.listeners.remove(&host_port) {
            stop_listener(listener).await;
        }
        drop(state);

        info!("Removed port forward {}", forward);
        self.emit(ForwardEvent::Removed(forward));
        Ok(forward)
    }

    /// Enable or disable an existing mapping in place.
    pub async fn set_enabled(&self, host_port: u16, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut forward = *state
            .forwards
            .get(&host_port)
            .ok_or(Error::ForwardNotFound(host_port))?;
        if forward.enabled == enabled {
            return Ok(());
        }

        forward.enabled = enabled;
        if enabled {
            let listener = self.bind(forward).await?;
            state.listeners.insert(host_port, listener);
        } else if let Some(listener) = state.listeners.remove(&host_port) {
            stop_listener(listener).await;
        }
        state.forwards.insert(host_port, forward);
        drop(state);

        info!("Port forward {} {}", forward, if enabled { "enabled" } else { "disabled" });
        self.emit(ForwardEvent::Updated(forward));
        Ok(())
    }

    /// Snapshot of every mapping, ordered by host port.
    pub async fn forwards(&self) -> Vec<PortForward> {
        self.state.lock().await.forwards.values().copied().collect()
    }

    /// Host ports with a live listener, ascending.
    pub async fn listening_ports(&self) -> Vec<u16> {
        let state = self.state.lock().await;
        let mut ports: Vec<u16> = state.listeners.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Bound address of the listener for `host_port`, if it is listening.
    pub async fn local_addr(&self, host_port: u16) -> Option<SocketAddr> {
        self.state
            .lock()
            .await
            .listeners
            .get(&host_port)
            .map(|l| l.addr)
    }

    /// Relays currently running across all mappings.
    pub fn active_relays(&self) -> usize {
        self.relay_ctx.relays.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.events.subscribe()
    }

    /// Stop every listener and cancel every relay. The table is kept.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let mut state = self.state.lock().await;
        for (_, listener) in state.listeners.drain() {
            stop_listener(listener).await;
        }
        info!("Port forwarding shut down");
    }

    async fn bind(&self, forward: PortForward) -> Result<Listener> {
        if *self.shutdown_tx.borrow() {
            return Err(Error::Network("port forwarding is shut down".into()));
        }

        let addr = SocketAddr::new(self.bind_ip, forward.host_port);
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            port: forward.host_port,
            source,
        })?;
        let addr = listener.local_addr()?;

        info!(
            "Listening on {} for guest port {}",
            addr,
            self.relay_ctx.dialer.describe(forward.guest_port)
        );
        self.emit(ForwardEvent::Listening {
            host_port: forward.host_port,
            addr,
        });

        let task = tokio::spawn(accept_loop(listener, forward, self.relay_ctx.clone()));
        Ok(Listener { addr, task })
    }

    fn emit(&self, event: ForwardEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for PortForwardService {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            for (_, listener) in state.listeners.drain() {
                listener.task.abort();
            }
        }
    }
}

async fn stop_listener(listener: Listener) {
    listener.task.abort();
    // Wait so the socket is closed before the caller returns.
    let _ = listener.task.await;
    debug!("Listener on {} stopped", listener.addr);
}

async fn accept_loop(listener: TcpListener, forward: PortForward, ctx: RelayContext) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted {} on host port {}", peer, forward.host_port);
                let guard = RelayGuard::new(ctx.relays.clone());
                tokio::spawn(relay_connection(stream, peer, forward, ctx.clone(), guard));
            }
            Err(e) => {
                warn!("Accept failed on host port {}: {}", forward.host_port, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn relay_connection(
    stream: TcpStream,
    peer: SocketAddr,
    forward: PortForward,
    ctx: RelayContext,
    _guard: RelayGuard,
) {
    let _ = stream.set_nodelay(true);
    let guest = ctx.dialer.describe(forward.guest_port);

    let relay = async {
        let channel = match ctx.dialer.dial(forward.guest_port).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(
                    "Relay {} -> {} (host port {}): guest connect failed: {}",
                    peer, guest, forward.host_port, e
                );
                return;
            }
        };
        let (sent, received) = pump_stream(stream, channel).await;
        debug!(
            "Relay {} -> {} closed ({} bytes to guest, {} bytes from guest)",
            peer, guest, sent, received
        );
    };

    tokio::select! {
        _ = relay => {}
        _ = stopped(ctx.shutdown.clone()) => {
            debug!("Relay {} -> {} cancelled by shutdown", peer, guest);
        }
    }
}

/// Resolves once shutdown is signalled; never if the service is dropped.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
