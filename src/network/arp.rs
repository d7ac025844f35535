//! ARP responder for the virtual gateway.
//!
//! Answers who-has requests for exactly one gateway address and learns the
//! requester's binding on the way through. The learned table is shared with
//! the egress path, which needs the guest's MAC to frame outbound IPv4.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use super::addr::MacAddress;
use super::packet::{ArpOperation, ArpPacket, EthernetFrame, ETHERTYPE_ARP};

/// Learned and statically registered IPv4 → MAC bindings.
///
/// Entries are never evicted; the table lives as long as the VM session.
#[derive(Debug, Default)]
pub struct ArpTable {
    entries: Mutex<HashMap<Ipv4Addr, MacAddress>>,
}

impl ArpTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` means "not resolved yet", not an error.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ip)
            .copied()
    }

    /// Insert or overwrite a binding.
    pub fn register(&self, ip: Ipv4Addr, mac: MacAddress) {
        let previous = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ip, mac);
        if previous != Some(mac) {
            debug!(%ip, %mac, "ARP table: binding updated");
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all bindings, sorted by address.
    pub fn entries(&self) -> Vec<(Ipv4Addr, MacAddress)> {
        let mut entries: Vec<_> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(ip, mac)| (*ip, *mac))
            .collect();
        entries.sort();
        entries
    }
}

/// Gateway-side ARP responder.
pub struct ArpResponder {
    gateway_ip: Ipv4Addr,
    gateway_mac: MacAddress,
    table: Arc<ArpTable>,
}

impl ArpResponder {
    pub fn new(gateway_ip: Ipv4Addr, gateway_mac: MacAddress) -> Self {
        Self::with_table(gateway_ip, gateway_mac, Arc::new(ArpTable::new()))
    }

    pub fn with_table(gateway_ip: Ipv4Addr, gateway_mac: MacAddress, table: Arc<ArpTable>) -> Self {
        Self {
            gateway_ip,
            gateway_mac,
            table,
        }
    }

    pub fn gateway_ip(&self) -> Ipv4Addr {
        self.gateway_ip
    }

    pub fn gateway_mac(&self) -> MacAddress {
        self.gateway_mac
    }

    pub fn table(&self) -> &Arc<ArpTable> {
        &self.table
    }

    /// Handle one ARP message, returning the reply frame if one is due.
    ///
    /// Only Ethernet/IPv4 requests for the gateway address are answered.
    /// The requester's binding is learned before the reply is built.
    pub fn handle_arp(&self, frame: &EthernetFrame, arp: &ArpPacket) -> Option<EthernetFrame> {
        if arp.operation != ArpOperation::Request || !arp.is_ethernet_ipv4() {
            trace!(op = ?arp.operation, src = %frame.src, "ARP: ignoring non-request");
            return None;
        }

        if arp.target_ip != self.gateway_ip {
            trace!(target_ip = %arp.target_ip, "ARP: request is not for the gateway");
            return None;
        }

        // 0.0.0.0 is an address probe, not a binding.
        if !arp.sender_ip.is_unspecified() {
            self.table.register(arp.sender_ip, arp.sender_mac);
        }

        debug!(
            source_ip = %arp.sender_ip,
            source_mac = %arp.sender_mac,
            reply_mac = %self.gateway_mac,
            "ARP: answering request for gateway"
        );

        let reply = ArpPacket::reply(
            self.gateway_mac,
            self.gateway_ip,
            arp.sender_mac,
            arp.sender_ip,
        );
        Some(EthernetFrame::new(
            arp.sender_mac,
            self.gateway_mac,
            ETHERTYPE_ARP,
            reply.to_bytes(),
        ))
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.table.lookup(ip)
    }

    pub fn register(&self, ip: Ipv4Addr, mac: MacAddress) {
        self.table.register(ip, mac);
    }
}
