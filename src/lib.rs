//! void-link: host ↔ guest connective tissue for a micro-VM.
//!
//! The guest sees an ordinary Ethernet segment with a gateway; the host sees
//! ordinary TCP listeners and a control socket. In between:
//!
//! - **Virtual link**: Ethernet/ARP/IPv4 codecs, a gateway ARP responder,
//!   and [`NetBridge`], which carries host-initiated TCP to the guest over
//!   raw frames.
//! - **Port forwarding**: [`PortForwardService`] keeps one listener per
//!   enabled host-port mapping and one relay per accepted connection.
//! - **Control channel**: [`TransportClient`] does one HTTP/1.1 exchange per
//!   call over a local socket; [`AgentClient`] adds the guest agent's typed
//!   endpoints.
//!
//! # Example: forward host port 8080 to guest port 80
//!
//! ```no_run
//! use std::sync::Arc;
//! use void_link::{NetBridge, NetworkConfig, PortForward, PortForwardService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = Arc::new(NetBridge::new(NetworkConfig::default())?);
//!
//!     // Frame channels owned by the VM layer.
//!     let (_guest_tx, from_guest) = tokio::sync::mpsc::channel(256);
//!     let (to_guest, _guest_rx) = tokio::sync::mpsc::channel(256);
//!     tokio::spawn(bridge.clone().run(from_guest, to_guest));
//!
//!     let service = PortForwardService::localhost(bridge);
//!     for failure in service.start(&[PortForward::new(8080, 80)]).await {
//!         eprintln!("{}: {}", failure.forward, failure.error);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
#[cfg(unix)]
pub mod control;
pub mod error;
pub mod forward;
pub mod network;

// Re-exports for convenience
pub use config::{load_config, validate_config, BridgeConfig};
#[cfg(unix)]
pub use control::{AgentClient, JsonResponse, TransportClient};
pub use error::{Error, Result};
pub use forward::{
    BindFailure, ForwardEvent, GuestChannel, GuestDialer, PortForward, PortForwardService,
    TcpDialer,
};
pub use network::{MacAddress, NetBridge, NetworkConfig};
pub use void_link_protocol::{HttpRequest, HttpResponse, ProtocolError};
