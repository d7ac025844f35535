//! Virtual network between the host and one guest.
//!
//! This module handles:
//! - Ethernet/ARP/IPv4 codecs
//! - The gateway's ARP responder and address-resolution table
//! - The net bridge that carries guest-bound TCP over raw Ethernet frames
//!
//! Network layout (SLIRP standard):
//! - Guest IP: 10.0.2.15/24
//! - Gateway:  10.0.2.2

pub mod addr;
pub mod arp;
pub mod bridge;
pub mod packet;

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

pub use addr::MacAddress;
pub use arp::{ArpResponder, ArpTable};
pub use bridge::NetBridge;
pub use packet::{ArpOperation, ArpPacket, EthernetFrame, Ipv4Header, Packet};

use crate::{Error, Result};

/// Default guest address
pub const SLIRP_GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
/// Default gateway address
pub const SLIRP_GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
pub const SLIRP_PREFIX_LEN: u8 = 24;

/// Guest MAC address (locally administered)
pub const GUEST_MAC: MacAddress = MacAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
/// Gateway MAC address
pub const GATEWAY_MAC: MacAddress = MacAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x01]);

/// Addressing for the virtual segment: the gateway identity this host
/// impersonates and the guest's static identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Gateway IP answered by the ARP responder
    pub gateway_ip: Ipv4Addr,
    /// Gateway MAC used as the source of every frame sent to the guest
    pub gateway_mac: MacAddress,
    /// Guest's static IP
    pub guest_ip: Ipv4Addr,
    /// Guest's MAC, pre-registered in the ARP table when known
    pub guest_mac: Option<MacAddress>,
    /// Prefix length of the guest segment
    pub prefix_len: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            gateway_ip: SLIRP_GATEWAY_IP,
            gateway_mac: GATEWAY_MAC,
            guest_ip: SLIRP_GUEST_IP,
            guest_mac: Some(GUEST_MAC),
            prefix_len: SLIRP_PREFIX_LEN,
        }
    }
}

impl NetworkConfig {
    /// Set the gateway identity
    pub fn gateway(mut self, ip: Ipv4Addr, mac: MacAddress) -> Self {
        self.gateway_ip = ip;
        self.gateway_mac = mac;
        self
    }

    /// Set the guest IP
    pub fn guest_ip(mut self, ip: Ipv4Addr) -> Self {
        self.guest_ip = ip;
        self
    }

    /// Set (or clear) the guest MAC
    pub fn guest_mac(mut self, mac: Option<MacAddress>) -> Self {
        self.guest_mac = mac;
        self
    }

    pub fn prefix_len(mut self, prefix_len: u8) -> Self {
        self.prefix_len = prefix_len;
        self
    }

    /// Whether `ip` is on the gateway's segment.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.prefix_len);
        u32::from(ip) & mask == u32::from(self.gateway_ip) & mask
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=30).contains(&self.prefix_len) {
            return Err(Error::Config(format!(
                "prefix length {} out of range 1..=30",
                self.prefix_len
            )));
        }
        if self.gateway_ip == self.guest_ip {
            return Err(Error::Config(format!(
                "gateway and guest share address {}",
                self.gateway_ip
            )));
        }
        if !self.contains(self.guest_ip) {
            return Err(Error::Config(format!(
                "guest {} is outside gateway segment {}/{}",
                self.guest_ip, self.gateway_ip, self.prefix_len
            )));
        }
        if self.gateway_mac.is_multicast() || self.gateway_mac.is_zero() {
            return Err(Error::Config(format!(
                "gateway MAC {} is not a unicast address",
                self.gateway_mac
            )));
        }
        Ok(())
    }
}

fn prefix_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => u32::MAX << (32 - n),
    }
}

/// Generate a random MAC address with the locally administered bit set
pub fn generate_mac_address() -> Result<MacAddress> {
    let mut bytes = [0u8; 6];
    getrandom::fill(&mut bytes)
        .map_err(|e| Error::Network(format!("failed to generate MAC address: {}", e)))?;

    // Set locally administered bit, clear multicast bit
    bytes[0] = (bytes[0] & 0xFC) | 0x02;
    Ok(MacAddress(bytes))
}
