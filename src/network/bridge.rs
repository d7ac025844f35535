//! Net bridge: the host's end of the guest's Ethernet segment.
//!
//! The VM layer hands us raw frames from the guest's NIC and takes back the
//! frames we produce. ARP is answered here; IPv4 addressed to the gateway is
//! fed (without its Ethernet header) into a smoltcp interface that owns the
//! gateway address. Outbound IP packets from that interface are framed with
//! the destination MAC taken from the ARP table.
//!
//! Host-initiated TCP connections to the guest ("flows") are smoltcp sockets
//! bridged onto [`GuestChannel`]s, so the port-forward service can treat the
//! bridge like any other [`GuestDialer`].

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, trace, warn};

use super::arp::{ArpResponder, ArpTable};
use super::packet::{EthernetFrame, Ipv4Header, Packet, ETHERTYPE_IPV4};
use super::NetworkConfig;
use crate::forward::dialer::{GuestChannel, GuestDialer, CHANNEL_CAPACITY, GUEST_CONNECT_TIMEOUT};
use crate::{Error, Result};

/// MTU for the virtual link
const MTU: usize = 1500;

/// Maximum packets buffered in either direction
const MAX_QUEUE_SIZE: usize = 1024;

/// Per-socket buffer size
const SOCKET_BUFFER_SIZE: usize = 64 * 1024;

/// Driver tick when nothing else wakes it
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ephemeral range for gateway-side ports
pub const EPHEMERAL_PORT_MIN: u16 = 49152;
pub const EPHEMERAL_PORT_MAX: u16 = 65535;

/// IP packets between the guest and the stack
#[derive(Default)]
struct PacketQueue {
    /// From the guest, waiting for the stack
    rx_queue: VecDeque<Vec<u8>>,
    /// From the stack, waiting to be framed for the guest
    tx_queue: Vec<Vec<u8>>,
}

/// IP-medium device backed by the shared queue
struct VirtualDevice {
    queue: Arc<Mutex<PacketQueue>>,
}

impl VirtualDevice {
    fn new(queue: Arc<Mutex<PacketQueue>>) -> Self {
        Self { queue }
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtualRxToken;
    type TxToken<'a> = VirtualTxToken;

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = MTU;
        caps.max_burst_size = Some(1);
        caps
    }

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = lock(&self.queue).rx_queue.pop_front()?;
        Some((
            VirtualRxToken { buffer: packet },
            VirtualTxToken {
                queue: self.queue.clone(),
            },
        ))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(VirtualTxToken {
            queue: self.queue.clone(),
        })
    }
}

struct VirtualRxToken {
    buffer: Vec<u8>,
}

impl RxToken for VirtualRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.buffer)
    }
}

struct VirtualTxToken {
    queue: Arc<Mutex<PacketQueue>>,
}

impl TxToken for VirtualTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        let mut queue = lock(&self.queue);
        if queue.tx_queue.len() < MAX_QUEUE_SIZE {
            queue.tx_queue.push(buffer);
        } else {
            trace!("net bridge: tx queue full, dropping packet");
        }
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One host-initiated TCP connection to the guest.
struct GuestFlow {
    guest_port: u16,
    local_port: u16,
    /// Resolved once the handshake completes or fails
    ready: Option<oneshot::Sender<Result<()>>>,
    /// Guest → host chunks
    to_host: mpsc::Sender<Vec<u8>>,
    /// Host → guest chunks
    from_host: mpsc::Receiver<Vec<u8>>,
    /// Chunk the host channel had no room for
    pending_to_host: Option<Vec<u8>>,
    /// Chunk the socket buffer had no room for
    pending_to_guest: Option<Vec<u8>>,
    guest_eof_sent: bool,
    host_eof: bool,
    fin_sent: bool,
}

impl GuestFlow {
    /// Move data between the socket and the channels. Returns `true` once the
    /// flow is finished and its socket can be released.
    fn relay(&mut self, socket: &mut tcp::Socket<'static>) -> bool {
        if let Some(ready) = self.ready.take() {
            match socket.state() {
                tcp::State::SynSent | tcp::State::SynReceived => {
                    if ready.is_closed() {
                        debug!(port = self.guest_port, "dial abandoned before handshake");
                        socket.abort();
                        return true;
                    }
                    self.ready = Some(ready);
                    return false;
                }
                tcp::State::Closed | tcp::State::TimeWait => {
                    let _ = ready.send(Err(Error::GuestConnect(format!(
                        "guest port {} refused or reset the connection",
                        self.guest_port
                    ))));
                    return true;
                }
                _ => {
                    debug!(
                        port = self.guest_port,
                        local_port = self.local_port,
                        "guest connection established"
                    );
                    let _ = ready.send(Ok(()));
                }
            }
        }

        // Guest → host
        if let Some(data) = self.pending_to_host.take() {
            if !self.forward_to_host(data) {
                socket.abort();
                return true;
            }
        }
        while self.pending_to_host.is_none() && socket.can_recv() {
            let data = match socket.recv(|buf| (buf.len(), buf.to_vec())) {
                Ok(data) if !data.is_empty() => data,
                _ => break,
            };
            if !self.forward_to_host(data) {
                socket.abort();
                return true;
            }
        }
        if !self.guest_eof_sent && self.pending_to_host.is_none() && !socket.may_recv() {
            match self.to_host.try_send(Vec::new()) {
                Ok(()) => {
                    trace!(port = self.guest_port, "guest half-closed");
                    self.guest_eof_sent = true;
                }
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => self.guest_eof_sent = true,
            }
        }
        if !self.guest_eof_sent && self.to_host.is_closed() && socket.is_open() {
            debug!(port = self.guest_port, "host side gone, aborting guest connection");
            socket.abort();
            return true;
        }

        // Host → guest
        loop {
            if let Some(data) = self.pending_to_guest.as_mut() {
                if !socket.can_send() {
                    break;
                }
                let n = socket.send_slice(data).unwrap_or(0);
                data.drain(..n);
                if !data.is_empty() {
                    break;
                }
                self.pending_to_guest = None;
            }
            if self.host_eof {
                break;
            }
            match self.from_host.try_recv() {
                Ok(data) if data.is_empty() => self.host_eof = true,
                Ok(data) => self.pending_to_guest = Some(data),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.host_eof = true,
            }
        }
        if self.host_eof && self.pending_to_guest.is_none() && !self.fin_sent {
            trace!(port = self.guest_port, "host half-closed, sending FIN");
            socket.close();
            self.fin_sent = true;
        }

        matches!(socket.state(), tcp::State::Closed | tcp::State::TimeWait)
            && self.pending_to_host.is_none()
            && self.guest_eof_sent
    }

    /// Returns `false` when the host side has hung up.
    fn forward_to_host(&mut self, data: Vec<u8>) -> bool {
        match self.to_host.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(data)) => {
                self.pending_to_host = Some(data);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

struct BridgeState {
    iface: Interface,
    sockets: SocketSet<'static>,
    flows: HashMap<SocketHandle, GuestFlow>,
    next_local_port: u16,
    /// Frames built outside the stack (ARP replies)
    outbound: Vec<Vec<u8>>,
}

impl BridgeState {
    fn allocate_local_port(&mut self) -> Result<u16> {
        let range = usize::from(EPHEMERAL_PORT_MAX - EPHEMERAL_PORT_MIN) + 1;
        for _ in 0..range {
            let port = self.next_local_port;
            self.next_local_port = if port >= EPHEMERAL_PORT_MAX {
                EPHEMERAL_PORT_MIN
            } else {
                port + 1
            };
            if !self.flows.values().any(|flow| flow.local_port == port) {
                return Ok(port);
            }
        }
        Err(Error::Network("no free ephemeral port".into()))
    }

    fn relay(&mut self) {
        let mut finished = Vec::new();
        for (&handle, flow) in self.flows.iter_mut() {
            let socket = self.sockets.get_mut::<tcp::Socket>(handle);
            if flow.relay(socket) {
                finished.push(handle);
            }
        }
        for handle in finished {
            if let Some(flow) = self.flows.remove(&handle) {
                debug!(
                    port = flow.guest_port,
                    local_port = flow.local_port,
                    "guest flow closed"
                );
            }
            self.sockets.remove(handle);
        }
    }

    fn abort_all(&mut self) {
        for (handle, flow) in self.flows.drain() {
            if let Some(ready) = flow.ready {
                let _ = ready.send(Err(Error::GuestConnect("net bridge stopped".into())));
            }
            self.sockets.get_mut::<tcp::Socket>(handle).abort();
            self.sockets.remove(handle);
        }
    }
}

/// The virtual link between the host and one guest NIC.
pub struct NetBridge {
    config: NetworkConfig,
    arp: ArpResponder,
    queue: Arc<Mutex<PacketQueue>>,
    state: Mutex<BridgeState>,
    wake: Arc<Notify>,
    connect_timeout: Duration,
}

impl NetBridge {
    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(Mutex::new(PacketQueue::default()));
        let mut iface = Interface::new(
            Config::new(HardwareAddress::Ip),
            &mut VirtualDevice::new(queue.clone()),
            SmolInstant::now(),
        );

        let cidr = IpCidr::new(
            IpAddress::Ipv4(to_smol(config.gateway_ip)),
            config.prefix_len,
        );
        let mut added = Ok(());
        iface.update_ip_addrs(|addrs| {
            added = addrs.push(cidr);
        });
        added.map_err(|_| Error::Network(format!("cannot assign {} to interface", cidr)))?;

        let arp = ArpResponder::with_table(
            config.gateway_ip,
            config.gateway_mac,
            Arc::new(ArpTable::new()),
        );
        if let Some(mac) = config.guest_mac {
            arp.register(config.guest_ip, mac);
        }

        debug!(
            gateway = %config.gateway_ip,
            gateway_mac = %config.gateway_mac,
            guest = %config.guest_ip,
            "net bridge created"
        );

        Ok(Self {
            config,
            arp,
            queue,
            state: Mutex::new(BridgeState {
                iface,
                sockets: SocketSet::new(vec![]),
                flows: HashMap::new(),
                next_local_port: EPHEMERAL_PORT_MIN,
                outbound: Vec::new(),
            }),
            wake: Arc::new(Notify::new()),
            connect_timeout: GUEST_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn arp_table(&self) -> &Arc<ArpTable> {
        self.arp.table()
    }

    /// Open guest connections, including ones still handshaking.
    pub fn active_flows(&self) -> usize {
        lock(&self.state).flows.len()
    }

    /// Handle one frame from the guest. Malformed or irrelevant frames are
    /// logged and dropped.
    pub fn process_guest_frame(&self, bytes: &[u8]) {
        let packet = match Packet::parse(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("net bridge: dropping frame: {}", e);
                return;
            }
        };

        match packet {
            Packet::Arp { frame, arp } => {
                if let Some(reply) = self.arp.handle_arp(&frame, &arp) {
                    lock(&self.state).outbound.push(reply.to_bytes());
                }
            }
            Packet::Ipv4 { frame, header } => {
                if header.dst != self.config.gateway_ip {
                    trace!(src = %header.src, dst = %header.dst, "net bridge: IPv4 not for gateway");
                    return;
                }
                // Strip Ethernet padding.
                let end = usize::from(header.total_len).min(frame.payload.len());
                let mut queue = lock(&self.queue);
                if queue.rx_queue.len() < MAX_QUEUE_SIZE {
                    queue.rx_queue.push_back(frame.payload[..end].to_vec());
                } else {
                    trace!("net bridge: rx queue full, dropping packet");
                }
            }
            Packet::Unknown(frame) => {
                trace!(
                    ethertype = frame.ethertype,
                    src = %frame.src,
                    "net bridge: unsupported frame"
                );
            }
        }
    }

    /// Advance the stack and relay flow data. Returns frames for the guest.
    pub fn poll(&self) -> Vec<Vec<u8>> {
        let mut frames = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let mut device = VirtualDevice::new(self.queue.clone());

            let _ = state.iface.poll(SmolInstant::now(), &mut device, &mut state.sockets);
            state.relay();
            // Flush whatever the relay queued.
            let _ = state.iface.poll(SmolInstant::now(), &mut device, &mut state.sockets);

            std::mem::take(&mut state.outbound)
        };

        let packets = std::mem::take(&mut lock(&self.queue).tx_queue);
        frames.extend(packets.into_iter().filter_map(|p| self.frame_for_guest(p)));
        frames
    }

    fn frame_for_guest(&self, packet: Vec<u8>) -> Option<Vec<u8>> {
        let header = match Ipv4Header::parse(&packet) {
            Ok(header) => header,
            Err(e) => {
                trace!("net bridge: dropping non-IPv4 egress: {}", e);
                return None;
            }
        };
        match self.arp.lookup(header.dst) {
            Some(mac) => Some(
                EthernetFrame::new(mac, self.config.gateway_mac, ETHERTYPE_IPV4, packet).to_bytes(),
            ),
            None => {
                debug!(dst = %header.dst, "net bridge: no ARP binding, dropping packet");
                None
            }
        }
    }

    /// Drive the bridge from the VM layer's frame channels until either
    /// closes.
    pub async fn run(
        self: Arc<Self>,
        mut from_guest: mpsc::Receiver<Vec<u8>>,
        to_guest: mpsc::Sender<Vec<u8>>,
    ) {
        info!(gateway = %self.config.gateway_ip, "net bridge running");

        'outer: loop {
            tokio::select! {
                frame = from_guest.recv() => match frame {
                    Some(frame) => {
                        self.process_guest_frame(&frame);
                        while let Ok(frame) = from_guest.try_recv() {
                            self.process_guest_frame(&frame);
                        }
                    }
                    None => {
                        info!("guest frame channel closed, stopping net bridge");
                        break;
                    }
                },
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            for frame in self.poll() {
                if to_guest.send(frame).await.is_err() {
                    warn!("guest frame sink closed, stopping net bridge");
                    break 'outer;
                }
            }
        }

        lock(&self.state).abort_all();
    }

    fn open_flow(&self, guest_port: u16, flow: impl FnOnce(u16) -> GuestFlow) -> Result<u16> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let local_port = state.allocate_local_port()?;

        let mut socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; SOCKET_BUFFER_SIZE]),
            tcp::SocketBuffer::new(vec![0; SOCKET_BUFFER_SIZE]),
        );
        let remote = IpEndpoint::new(IpAddress::Ipv4(to_smol(self.config.guest_ip)), guest_port);
        socket
            .connect(state.iface.context(), remote, local_port)
            .map_err(|e| Error::GuestConnect(format!("{}: {:?}", self.describe(guest_port), e)))?;

        let handle = state.sockets.add(socket);
        state.flows.insert(handle, flow(local_port));
        Ok(local_port)
    }
}

#[async_trait::async_trait]
impl GuestDialer for NetBridge {
    async fn dial(&self, guest_port: u16) -> Result<GuestChannel> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (h2g_tx, h2g_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (g2h_tx, g2h_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let local_port = self.open_flow(guest_port, |local_port| GuestFlow {
            guest_port,
            local_port,
            ready: Some(ready_tx),
            to_host: g2h_tx,
            from_host: h2g_rx,
            pending_to_host: None,
            pending_to_guest: None,
            guest_eof_sent: false,
            host_eof: false,
            fin_sent: false,
        })?;
        debug!(port = guest_port, local_port, "dialing guest");
        self.wake.notify_one();

        let channel = GuestChannel::new(h2g_tx, g2h_rx).with_waker(self.wake.clone());
        match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(channel),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::GuestConnect("net bridge stopped".into())),
            Err(_) => Err(Error::Timeout(format!(
                "connecting to {}",
                self.describe(guest_port)
            ))),
        }
    }

    fn describe(&self, guest_port: u16) -> String {
        format!("{}:{}", self.config.guest_ip, guest_port)
    }
}

fn to_smol(ip: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&ip.octets())
}
