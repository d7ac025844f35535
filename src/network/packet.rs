//! Ethernet, ARP and IPv4 header codecs.
//!
//! Parsing copies the fields out of the raw buffer into owned value types,
//! so a parsed frame outlives the buffer it came from. [`Packet::parse`]
//! demultiplexes on ether-type; a garbled payload degrades to
//! [`Packet::Unknown`] instead of failing the whole frame.

use std::net::Ipv4Addr;

use byteorder::{ByteOrder, NetworkEndian};

use super::addr::MacAddress;
use crate::{Error, Result};

/// Ethernet header length (no 802.1Q tag).
pub const ETH_HEADER_LEN: usize = 14;
/// Ethernet/IPv4 ARP packet length.
pub const ARP_PACKET_LEN: usize = 28;
/// Minimum IPv4 header length (IHL = 5).
pub const IPV4_MIN_HEADER_LEN: usize = 20;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// ARP hardware type for Ethernet.
pub const ARP_HTYPE_ETHERNET: u16 = 1;
/// ARP protocol type for IPv4.
pub const ARP_PTYPE_IPV4: u16 = 0x0800;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

// ---------------------------------------------------------------------------
// Ethernet
// ---------------------------------------------------------------------------

/// One link-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
    pub payload: Vec<u8>,
    /// Offset of `payload` within the raw frame; always >= [`ETH_HEADER_LEN`].
    pub payload_offset: usize,
}

impl EthernetFrame {
    pub fn new(dst: MacAddress, src: MacAddress, ethertype: u16, payload: Vec<u8>) -> Self {
        Self {
            dst,
            src,
            ethertype,
            payload,
            payload_offset: ETH_HEADER_LEN,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ETH_HEADER_LEN {
            return Err(Error::Malformed(format!(
                "ethernet frame too short: {} bytes",
                bytes.len()
            )));
        }

        Ok(Self {
            dst: MacAddress::from_slice(&bytes[0..6]).unwrap_or_default(),
            src: MacAddress::from_slice(&bytes[6..12]).unwrap_or_default(),
            ethertype: NetworkEndian::read_u16(&bytes[12..14]),
            payload: bytes[ETH_HEADER_LEN..].to_vec(),
            payload_offset: ETH_HEADER_LEN,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ETH_HEADER_LEN + self.payload.len()];
        buf[0..6].copy_from_slice(self.dst.as_bytes());
        buf[6..12].copy_from_slice(self.src.as_bytes());
        NetworkEndian::write_u16(&mut buf[12..14], self.ethertype);
        buf[ETH_HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }
}

// ---------------------------------------------------------------------------
// ARP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
    Other(u16),
}

impl From<u16> for ArpOperation {
    fn from(op: u16) -> Self {
        match op {
            1 => ArpOperation::Request,
            2 => ArpOperation::Reply,
            other => ArpOperation::Other(other),
        }
    }
}

impl From<ArpOperation> for u16 {
    fn from(op: ArpOperation) -> Self {
        match op {
            ArpOperation::Request => 1,
            ArpOperation::Reply => 2,
            ArpOperation::Other(other) => other,
        }
    }
}

/// One ARP message in the fixed Ethernet/IPv4 layout.
///
/// The type and size fields are carried as-is; nothing here assumes they
/// describe Ethernet/IPv4. See [`ArpPacket::is_ethernet_ipv4`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub hardware_type: u16,
    pub protocol_type: u16,
    pub hardware_len: u8,
    pub protocol_len: u8,
    pub operation: ArpOperation,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Who-has request; the target MAC is left zero.
    pub fn request(sender_mac: MacAddress, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self::ethernet_ipv4(
            ArpOperation::Request,
            sender_mac,
            sender_ip,
            MacAddress::ZERO,
            target_ip,
        )
    }

    pub fn reply(
        sender_mac: MacAddress,
        sender_ip: Ipv4Addr,
        target_mac: MacAddress,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self::ethernet_ipv4(
            ArpOperation::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        )
    }

    fn ethernet_ipv4(
        operation: ArpOperation,
        sender_mac: MacAddress,
        sender_ip: Ipv4Addr,
        target_mac: MacAddress,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            hardware_type: ARP_HTYPE_ETHERNET,
            protocol_type: ARP_PTYPE_IPV4,
            hardware_len: 6,
            protocol_len: 4,
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < ARP_PACKET_LEN {
            return Err(Error::Malformed(format!(
                "ARP packet too short: {} bytes",
                payload.len()
            )));
        }

        Ok(Self {
            hardware_type: NetworkEndian::read_u16(&payload[0..2]),
            protocol_type: NetworkEndian::read_u16(&payload[2..4]),
            hardware_len: payload[4],
            protocol_len: payload[5],
            operation: ArpOperation::from(NetworkEndian::read_u16(&payload[6..8])),
            sender_mac: MacAddress::from_slice(&payload[8..14]).unwrap_or_default(),
            sender_ip: read_ipv4(&payload[14..18]),
            target_mac: MacAddress::from_slice(&payload[18..24]).unwrap_or_default(),
            target_ip: read_ipv4(&payload[24..28]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ARP_PACKET_LEN];
        NetworkEndian::write_u16(&mut buf[0..2], self.hardware_type);
        NetworkEndian::write_u16(&mut buf[2..4], self.protocol_type);
        buf[4] = self.hardware_len;
        buf[5] = self.protocol_len;
        NetworkEndian::write_u16(&mut buf[6..8], self.operation.into());
        buf[8..14].copy_from_slice(self.sender_mac.as_bytes());
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(self.target_mac.as_bytes());
        buf[24..28].copy_from_slice(&self.target_ip.octets());
        buf
    }

    /// Hardware type Ethernet and protocol type IPv4.
    pub fn is_ethernet_ipv4(&self) -> bool {
        self.hardware_type == ARP_HTYPE_ETHERNET && self.protocol_type == ARP_PTYPE_IPV4
    }
}

// ---------------------------------------------------------------------------
// IPv4
// ---------------------------------------------------------------------------

/// The fixed part of an IPv4 header. Options are skipped, not decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < IPV4_MIN_HEADER_LEN {
            return Err(Error::Malformed(format!(
                "IPv4 header too short: {} bytes",
                payload.len()
            )));
        }

        let version = payload[0] >> 4;
        if version != 4 {
            return Err(Error::Malformed(format!("IP version {} is not 4", version)));
        }

        let header_len = usize::from(payload[0] & 0x0f) * 4;
        if header_len < IPV4_MIN_HEADER_LEN || header_len > payload.len() {
            return Err(Error::Malformed(format!(
                "invalid IPv4 header length {}",
                header_len
            )));
        }

        let total_len = NetworkEndian::read_u16(&payload[2..4]);
        if usize::from(total_len) < header_len {
            return Err(Error::Malformed(format!(
                "IPv4 total length {} shorter than header",
                total_len
            )));
        }

        Ok(Self {
            header_len,
            total_len,
            ttl: payload[8],
            protocol: payload[9],
            src: read_ipv4(&payload[12..16]),
            dst: read_ipv4(&payload[16..20]),
        })
    }
}

fn read_ipv4(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

// ---------------------------------------------------------------------------
// Demultiplexing
// ---------------------------------------------------------------------------

/// A frame classified by ether-type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Arp { frame: EthernetFrame, arp: ArpPacket },
    Ipv4 { frame: EthernetFrame, header: Ipv4Header },
    /// Unsupported ether-type, or a payload that failed to parse.
    Unknown(EthernetFrame),
}

impl Packet {
    /// Fails only when the Ethernet header itself is truncated.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let frame = EthernetFrame::parse(bytes)?;

        let packet = match frame.ethertype {
            ETHERTYPE_ARP => match ArpPacket::parse(&frame.payload) {
                Ok(arp) => Packet::Arp { frame, arp },
                Err(_) => Packet::Unknown(frame),
            },
            ETHERTYPE_IPV4 => match Ipv4Header::parse(&frame.payload) {
                Ok(header) => Packet::Ipv4 { frame, header },
                Err(_) => Packet::Unknown(frame),
            },
            _ => Packet::Unknown(frame),
        };
        Ok(packet)
    }

    pub fn frame(&self) -> &EthernetFrame {
        match self {
            Packet::Arp { frame, .. } | Packet::Ipv4 { frame, .. } | Packet::Unknown(frame) => {
                frame
            }
        }
    }
}
