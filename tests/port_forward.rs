//! Port-forward service over real loopback sockets with in-process guests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use void_link::forward::{ForwardEvent, GuestChannel, GuestDialer, PortForward, PortForwardService};
use void_link::{Error, Result};

/// Guest that echoes every chunk back and mirrors half-close.
#[derive(Default)]
struct EchoDialer {
    dials: AtomicUsize,
}

#[async_trait::async_trait]
impl GuestDialer for EchoDialer {
    async fn dial(&self, _guest_port: u16) -> Result<GuestChannel> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (near, mut far) = GuestChannel::pair();
        tokio::spawn(async move {
            while let Some(chunk) = far.recv().await {
                let eof = chunk.is_empty();
                if !far.send(chunk).await || eof {
                    break;
                }
            }
        });
        Ok(near)
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn echo(client: &mut TcpStream, data: &[u8]) -> Vec<u8> {
    client.write_all(data).await.unwrap();
    let mut buf = vec![0u8; data.len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

async fn wait_for_relays(service: &PortForwardService, expected: usize) {
    for _ in 0..200 {
        if service.active_relays() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} active relays, found {}",
        expected,
        service.active_relays()
    );
}

#[tokio::test]
async fn test_relay_echoes_through_guest() {
    let dialer = Arc::new(EchoDialer::default());
    let service = PortForwardService::localhost(dialer.clone());
    let port = free_port();
    assert!(service.start(&[PortForward::new(port, 80)]).await.is_empty());

    let addr = service.local_addr(port).await.unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(echo(&mut client, b"hello guest").await, b"hello guest");

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(echo(&mut client, &payload).await, payload);

    // Half-close from the host propagates through the guest and back.
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    wait_for_relays(&service, 0).await;
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_duplicate_enabled_port_is_rejected() {
    let service = PortForwardService::localhost(Arc::new(EchoDialer::default()));
    let port = free_port();
    service.add_forward(PortForward::new(port, 80)).await.unwrap();

    let err = service
        .add_forward(PortForward::new(port, 81))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PortInUse { port: p } if p == port));

    // No partial mutation.
    assert_eq!(service.forwards().await, vec![PortForward::new(port, 80)]);
    assert_eq!(service.listening_ports().await, vec![port]);
}

#[tokio::test]
async fn test_remove_stops_listener_but_relay_drains() {
    let service = PortForwardService::localhost(Arc::new(EchoDialer::default()));
    let port = free_port();
    service.add_forward(PortForward::new(port, 80)).await.unwrap();
    let addr = service.local_addr(port).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(echo(&mut client, b"before").await, b"before");
    wait_for_relays(&service, 1).await;

    let removed = service.remove_forward(port).await.unwrap();
    assert_eq!(removed, PortForward::new(port, 80));
    assert!(service.forwards().await.is_empty());

    // New connections are refused...
    assert!(TcpStream::connect(addr).await.is_err());
    // ...while the open relay keeps working.
    assert_eq!(echo(&mut client, b"after").await, b"after");
    assert_eq!(service.active_relays(), 1);

    drop(client);
    wait_for_relays(&service, 0).await;
}

#[tokio::test]
async fn test_bind_failure_does_not_block_other_mappings() {
    let service = PortForwardService::localhost(Arc::new(EchoDialer::default()));
    let mut events = service.subscribe();

    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let busy_port = occupied.local_addr().unwrap().port();
    let free = free_port();

    let failures = service
        .start(&[PortForward::new(busy_port, 80), PortForward::new(free, 81)])
        .await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].forward.host_port, busy_port);
    assert!(matches!(failures[0].error, Error::Bind { port, .. } if port == busy_port));
    assert!(failures[0].error.to_string().contains(&busy_port.to_string()));

    assert_eq!(service.listening_ports().await, vec![free]);
    assert_eq!(service.forwards().await.len(), 2);

    let mut saw_failure = false;
    let mut saw_listening = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ForwardEvent::BindFailed { host_port, .. } => saw_failure |= host_port == busy_port,
            ForwardEvent::Listening { host_port, .. } => saw_listening |= host_port == free,
            _ => {}
        }
    }
    assert!(saw_failure && saw_listening);

    let addr = service.local_addr(free).await.unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(echo(&mut client, b"ok").await, b"ok");
}

#[tokio::test]
async fn test_shutdown_cancels_relays() {
    let service = PortForwardService::localhost(Arc::new(EchoDialer::default()));
    let port = free_port();
    service.add_forward(PortForward::new(port, 80)).await.unwrap();
    let addr = service.local_addr(port).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(echo(&mut client, b"ping").await, b"ping");
    wait_for_relays(&service, 1).await;

    service.shutdown().await;
    wait_for_relays(&service, 0).await;

    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(TcpStream::connect(addr).await.is_err());
}
