//! Out-of-band control channel to the guest.
//!
//! HTTP/1.1 framing over a local stream socket: [`TransportClient`] does one
//! raw exchange per call, [`AgentClient`] layers the guest agent's typed
//! endpoints on top.

pub mod agent;
pub mod client;

pub use agent::AgentClient;
pub use client::{BytesResponse, JsonResponse, TransportClient, DEFAULT_TIMEOUT};
