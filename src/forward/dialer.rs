//! Paths into the guest network.
//!
//! A [`GuestDialer`] opens one connection to a guest TCP port and hands back
//! a [`GuestChannel`]: a pair of bounded chunk channels. An empty chunk is a
//! half-close (no more data in that direction); dropping the sender is a full
//! close.
//!
//! Two dialers exist:
//! - [`NetBridge`](crate::network::NetBridge): guest reachable only through
//!   raw Ethernet frames, TCP handled by the in-process stack.
//! - [`TcpDialer`]: guest reachable at a host-visible address.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::{Error, Result};

/// Chunks buffered per direction before senders wait.
pub const CHANNEL_CAPACITY: usize = 64;

/// Read buffer size for stream pumps.
const PUMP_BUF_SIZE: usize = 32 * 1024;

/// Default timeout for establishing a guest connection.
pub const GUEST_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens connections to guest TCP ports.
#[async_trait::async_trait]
pub trait GuestDialer: Send + Sync {
    /// Connect to `guest_port` on the guest. Resolves once the connection is
    /// established.
    async fn dial(&self, guest_port: u16) -> Result<GuestChannel>;

    /// Label for the guest endpoint, used in logs and errors.
    fn describe(&self, guest_port: u16) -> String {
        format!("guest:{}", guest_port)
    }
}

/// Sending half of a [`GuestChannel`].
///
/// Every send (and the final drop) pokes the optional waker so a polling
/// consumer notices new data without waiting for its next tick.
pub struct GuestSender {
    tx: mpsc::Sender<Vec<u8>>,
    waker: Option<Arc<Notify>>,
}

impl GuestSender {
    /// Returns `false` once the receiving side is gone.
    pub async fn send(&self, data: Vec<u8>) -> bool {
        let ok = self.tx.send(data).await.is_ok();
        if let Some(waker) = &self.waker {
            waker.notify_one();
        }
        ok
    }
}

impl Drop for GuestSender {
    fn drop(&mut self) {
        if let Some(waker) = &self.waker {
            waker.notify_one();
        }
    }
}

/// One bidirectional byte path to a guest connection.
pub struct GuestChannel {
    tx: GuestSender,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl GuestChannel {
    pub fn new(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            tx: GuestSender { tx, waker: None },
            rx,
        }
    }

    pub fn with_waker(mut self, waker: Arc<Notify>) -> Self {
        self.tx.waker = Some(waker);
        self
    }

    /// Two connected ends: what one sends, the other receives.
    pub fn pair() -> (GuestChannel, GuestChannel) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (GuestChannel::new(a_tx, b_rx), GuestChannel::new(b_tx, a_rx))
    }

    pub async fn send(&self, data: Vec<u8>) -> bool {
        self.tx.send(data).await
    }

    /// `None` once the peer has fully closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn into_split(self) -> (GuestSender, mpsc::Receiver<Vec<u8>>) {
        (self.tx, self.rx)
    }
}

/// Copy bytes between a TCP stream and a channel until both directions end.
///
/// Returns `(bytes read from stream, bytes written to stream)`.
pub async fn pump_stream(stream: TcpStream, channel: GuestChannel) -> (u64, u64) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = channel.into_split();

    let inbound = async {
        let mut buf = vec![0u8; PUMP_BUF_SIZE];
        let mut total = 0u64;
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("pump: EOF from {}", peer);
                    tx.send(Vec::new()).await;
                    break;
                }
                Ok(n) => {
                    total += n as u64;
                    if !tx.send(buf[..n].to_vec()).await {
                        break;
                    }
                }
                Err(e) => {
                    debug!("pump: read error from {}: {}", peer, e);
                    break;
                }
            }
        }
        drop(tx);
        total
    };

    let outbound = async {
        let mut total = 0u64;
        while let Some(data) = rx.recv().await {
            if data.is_empty() {
                break;
            }
            if let Err(e) = writer.write_all(&data).await {
                debug!("pump: write error to {}: {}", peer, e);
                return total;
            }
            total += data.len() as u64;
        }
        let _ = writer.shutdown().await;
        total
    };

    tokio::join!(inbound, outbound)
}

/// Dials guests that are reachable at a host-visible address.
pub struct TcpDialer {
    guest_ip: IpAddr,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(guest_ip: IpAddr) -> Self {
        Self {
            guest_ip,
            connect_timeout: GUEST_CONNECT_TIMEOUT,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl GuestDialer for TcpDialer {
    async fn dial(&self, guest_port: u16) -> Result<GuestChannel> {
        let addr = SocketAddr::new(self.guest_ip, guest_port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to guest {}", addr)))?
            .map_err(|e| Error::GuestConnect(format!("{}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        let (near, far) = GuestChannel::pair();
        tokio::spawn(async move {
            let (sent, received) = pump_stream(stream, far).await;
            debug!(%addr, sent, received, "guest TCP stream closed");
        });
        Ok(near)
    }

    fn describe(&self, guest_port: u16) -> String {
        SocketAddr::new(self.guest_ip, guest_port).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_channel_pair_crosses() {
        let (mut a, mut b) = GuestChannel::pair();
        assert!(a.send(b"ping".to_vec()).await);
        assert_eq!(b.recv().await.unwrap(), b"ping");
        assert!(b.send(b"pong".to_vec()).await);
        assert_eq!(a.recv().await.unwrap(), b"pong");

        drop(b);
        assert!(a.recv().await.is_none());
        assert!(!a.send(b"late".to_vec()).await);
    }

    #[tokio::test]
    async fn test_waker_fires_on_send_and_drop() {
        let waker = Arc::new(Notify::new());
        let (a, _b) = GuestChannel::pair();
        let a = a.with_waker(waker.clone());

        a.send(b"x".to_vec()).await;
        tokio::time::timeout(Duration::from_secs(1), waker.notified())
            .await
            .expect("send should wake");

        drop(a);
        tokio::time::timeout(Duration::from_secs(1), waker.notified())
            .await
            .expect("drop should wake");
    }

    #[tokio::test]
    async fn test_tcp_dialer_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let dialer = TcpDialer::new(IpAddr::from([127, 0, 0, 1]));
        assert_eq!(dialer.describe(port), format!("127.0.0.1:{}", port));

        let mut channel = dialer.dial(port).await.unwrap();
        assert!(channel.send(b"hello".to_vec()).await);
        assert_eq!(channel.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_tcp_dialer_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let dialer = TcpDialer::new(IpAddr::from([127, 0, 0, 1]));
        assert!(matches!(
            dialer.dial(port).await,
            Err(Error::GuestConnect(_))
        ));
    }
}
