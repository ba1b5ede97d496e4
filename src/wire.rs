// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! On-wire header formats.
//!
//! Headers are plain `zerocopy` structs with network-endian multi-byte
//! fields, so parsing a header is taking a typed reference into packet bytes
//! and serializing is writing through one. Multi-byte integers never appear
//! in host order at rest.

use net_types::ethernet::Mac;
use net_types::ip::Ipv4Addr;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// The ethertype of IPv4 payloads.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// The ethertype of ARP payloads.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Length of an Ethernet header.
pub const ETH_HDR_LEN: usize = 14;
/// Length of an IPv4 header without options; the engine never emits options.
pub const IPV4_HDR_LEN: usize = 20;
/// Length of an Ethernet/IPv4 ARP packet.
pub const ARP_PKT_LEN: usize = 28;
/// Length of an ICMP echo header.
pub const ICMP_ECHO_HDR_LEN: usize = 8;

/// The maximum length of an IPv4 datagram, including the header.
pub const IPV4_MAX_PACKET_LEN: usize = 65535;

/// An IPv4 protocol number, as carried in the header's protocol field.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Ipv4Proto {
    /// ICMP.
    Icmp,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// Any other protocol number.
    Other(u8),
}

impl From<u8> for Ipv4Proto {
    fn from(value: u8) -> Ipv4Proto {
        match value {
            1 => Ipv4Proto::Icmp,
            6 => Ipv4Proto::Tcp,
            17 => Ipv4Proto::Udp,
            other => Ipv4Proto::Other(other),
        }
    }
}

impl Ipv4Proto {
    /// The wire value of this protocol number.
    pub const fn value(self) -> u8 {
        match self {
            Ipv4Proto::Icmp => 1,
            Ipv4Proto::Tcp => 6,
            Ipv4Proto::Udp => 17,
            Ipv4Proto::Other(other) => other,
        }
    }
}

const IHL_MASK: u8 = 0x0f;
const VERSION_SHIFT: u8 = 4;

const FLAG_MF: u16 = 0x2000;
const FLAG_DF: u16 = 0x4000;
const FRAG_OFF_MASK: u16 = 0x1fff;

/// An IPv4 header (RFC 791), without options.
///
/// Ingress headers may carry options (`ihl > 5`); accessors expose the real
/// header length. Egress headers are always written with `ihl = 5`.
#[derive(Copy, Clone, Debug, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Ipv4Header {
    version_ihl: u8,
    dscp_ecn: u8,
    total_len: U16,
    id: U16,
    flags_frag_off: U16,
    ttl: u8,
    proto: u8,
    checksum: [u8; 2],
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
}

impl Ipv4Header {
    /// The IP version field.
    pub fn version(&self) -> u8 {
        self.version_ihl >> VERSION_SHIFT
    }

    /// The header length in bytes (`ihl * 4`).
    pub fn header_len(&self) -> usize {
        usize::from(self.version_ihl & IHL_MASK) * 4
    }

    /// The total datagram length (header plus payload) in bytes.
    pub fn total_len(&self) -> usize {
        usize::from(self.total_len.get())
    }

    /// The identification field.
    pub fn id(&self) -> u16 {
        self.id.get()
    }

    /// True if the more-fragments flag is set.
    pub fn mf(&self) -> bool {
        self.flags_frag_off.get() & FLAG_MF != 0
    }

    /// True if the don't-fragment flag is set.
    pub fn df(&self) -> bool {
        self.flags_frag_off.get() & FLAG_DF != 0
    }

    /// The fragment offset in bytes (the wire field is in 8-byte units).
    pub fn frag_offset(&self) -> usize {
        usize::from(self.flags_frag_off.get() & FRAG_OFF_MASK) * 8
    }

    /// True if this datagram is atomic: not a fragment of anything.
    pub fn is_atomic(&self) -> bool {
        !self.mf() && self.frag_offset() == 0
    }

    /// The time-to-live field.
    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// The protocol field's raw value.
    pub fn proto(&self) -> u8 {
        self.proto
    }

    /// The source address.
    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.src_ip)
    }

    /// The destination address.
    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.dst_ip)
    }

    /// The stored checksum bytes.
    pub fn checksum(&self) -> [u8; 2] {
        self.checksum
    }

    /// Fills every field of an egress header except the checksum, which is
    /// zeroed.
    ///
    /// `frag` is `None` for an unfragmented datagram, or
    /// `Some((mf, offset_bytes))`; the offset must be a multiple of 8.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &mut self,
        total_len: usize,
        id: u16,
        frag: Option<(bool, usize)>,
        ttl: u8,
        proto: u8,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) {
        debug_assert!(total_len <= IPV4_MAX_PACKET_LEN);
        self.version_ihl = (4 << VERSION_SHIFT) | (IPV4_HDR_LEN / 4) as u8;
        self.dscp_ecn = 0;
        self.total_len.set(total_len as u16);
        self.id.set(id);
        let frag_field = match frag {
            None => 0,
            Some((mf, offset)) => {
                debug_assert_eq!(offset % 8, 0);
                (if mf { FLAG_MF } else { 0 }) | (offset / 8) as u16
            }
        };
        self.flags_frag_off.set(frag_field);
        self.ttl = ttl;
        self.proto = proto;
        self.checksum = [0; 2];
        self.src_ip = src_ip.ipv4_bytes();
        self.dst_ip = dst_ip.ipv4_bytes();
    }

    /// Overwrites the total length field.
    pub fn set_total_len(&mut self, total_len: usize) {
        debug_assert!(total_len <= IPV4_MAX_PACKET_LEN);
        self.total_len.set(total_len as u16);
    }

    /// Clears the fragmentation field, marking the datagram atomic.
    pub fn clear_frag(&mut self) {
        self.flags_frag_off.set(0);
    }

    /// Stores checksum bytes.
    pub fn set_checksum(&mut self, checksum: [u8; 2]) {
        self.checksum = checksum;
    }
}

/// An Ethernet header.
#[derive(Copy, Clone, Debug, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct EthernetHeader {
    dst: [u8; 6],
    src: [u8; 6],
    ethertype: U16,
}

impl EthernetHeader {
    /// The destination address.
    pub fn dst(&self) -> Mac {
        Mac::new(self.dst)
    }

    /// The source address.
    pub fn src(&self) -> Mac {
        Mac::new(self.src)
    }

    /// The ethertype field.
    pub fn ethertype(&self) -> u16 {
        self.ethertype.get()
    }

    /// Fills every field.
    pub fn init(&mut self, dst: Mac, src: Mac, ethertype: u16) {
        self.dst = dst.bytes();
        self.src = src.bytes();
        self.ethertype.set(ethertype);
    }
}

/// ARP operation: request.
pub const ARP_OP_REQUEST: u16 = 1;
/// ARP operation: reply.
pub const ARP_OP_REPLY: u16 = 2;

/// An ARP packet for IPv4 over Ethernet (RFC 826).
#[derive(Copy, Clone, Debug, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct ArpHeader {
    htype: U16,
    ptype: U16,
    hlen: u8,
    plen: u8,
    op: U16,
    sender_mac: [u8; 6],
    sender_ip: [u8; 4],
    target_mac: [u8; 6],
    target_ip: [u8; 4],
}

impl ArpHeader {
    /// True if the fixed fields identify an IPv4-over-Ethernet ARP packet.
    pub fn is_valid(&self) -> bool {
        self.htype.get() == 1
            && self.ptype.get() == ETHERTYPE_IPV4
            && self.hlen == 6
            && self.plen == 4
    }

    /// The operation field.
    pub fn op(&self) -> u16 {
        self.op.get()
    }

    /// The sender's link address.
    pub fn sender_mac(&self) -> Mac {
        Mac::new(self.sender_mac)
    }

    /// The sender's protocol address.
    pub fn sender_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.sender_ip)
    }

    /// The target's link address.
    pub fn target_mac(&self) -> Mac {
        Mac::new(self.target_mac)
    }

    /// The target's protocol address.
    pub fn target_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.target_ip)
    }

    /// Fills every field.
    pub fn init(
        &mut self,
        op: u16,
        sender_mac: Mac,
        sender_ip: Ipv4Addr,
        target_mac: Mac,
        target_ip: Ipv4Addr,
    ) {
        self.htype.set(1);
        self.ptype.set(ETHERTYPE_IPV4);
        self.hlen = 6;
        self.plen = 4;
        self.op.set(op);
        self.sender_mac = sender_mac.bytes();
        self.sender_ip = sender_ip.ipv4_bytes();
        self.target_mac = target_mac.bytes();
        self.target_ip = target_ip.ipv4_bytes();
    }
}

/// ICMP message type: echo reply.
pub const ICMP_ECHO_REPLY: u8 = 0;
/// ICMP message type: echo request.
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// The header of an ICMP echo request or reply (RFC 792).
#[derive(Copy, Clone, Debug, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct IcmpEchoHeader {
    msg_type: u8,
    code: u8,
    checksum: [u8; 2],
    ident: U16,
    seq: U16,
}

impl IcmpEchoHeader {
    /// The message type field.
    pub fn msg_type(&self) -> u8 {
        self.msg_type
    }

    /// The code field.
    pub fn code(&self) -> u8 {
        self.code
    }

    /// The echo identifier.
    pub fn ident(&self) -> u16 {
        self.ident.get()
    }

    /// The echo sequence number.
    pub fn seq(&self) -> u16 {
        self.seq.get()
    }

    /// Rewrites the message type and zeroes the checksum, leaving the
    /// identifier, sequence number, and code in place.
    pub fn set_type_for_reply(&mut self, msg_type: u8) {
        self.msg_type = msg_type;
        self.checksum = [0; 2];
    }

    /// Stores checksum bytes.
    pub fn set_checksum(&mut self, checksum: [u8; 2]) {
        self.checksum = checksum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use zerocopy::FromBytes as _;

    #[test]
    fn ipv4_header_parse() {
        // 0x45, tos 0, len 0x0054, id 0x9a1a, flags DF, ttl 0x40, proto 1,
        // csum 0x0000, 10.0.0.1 -> 10.0.0.2.
        let bytes = [
            0x45u8, 0x00, 0x00, 0x54, 0x9a, 0x1a, 0x40, 0x00, 0x40, 0x01, 0x00, 0x00, 0x0a,
            0x00, 0x00, 0x01, 0x0a, 0x00, 0x00, 0x02,
        ];
        let h = Ipv4Header::ref_from(&bytes[..]).unwrap();
        assert_eq!(h.version(), 4);
        assert_eq!(h.header_len(), 20);
        assert_eq!(h.total_len(), 0x54);
        assert_eq!(h.id(), 0x9a1a);
        assert!(h.df());
        assert!(!h.mf());
        assert_eq!(h.frag_offset(), 0);
        assert!(h.is_atomic());
        assert_eq!(h.ttl(), 0x40);
        assert_eq!(h.proto(), 1);
        assert_eq!(h.src_ip(), Ipv4Addr::new([10, 0, 0, 1]));
        assert_eq!(h.dst_ip(), Ipv4Addr::new([10, 0, 0, 2]));
    }

    #[test]
    fn ipv4_header_init_round_trips() {
        let mut bytes = [0u8; IPV4_HDR_LEN];
        let h = Ipv4Header::mut_from(&mut bytes[..]).unwrap();
        h.init(
            1500,
            7,
            Some((true, 1480)),
            64,
            17,
            Ipv4Addr::new([192, 168, 1, 1]),
            Ipv4Addr::new([192, 168, 1, 2]),
        );
        assert_eq!(h.version(), 4);
        assert_eq!(h.header_len(), IPV4_HDR_LEN);
        assert_eq!(h.total_len(), 1500);
        assert_eq!(h.id(), 7);
        assert!(h.mf());
        assert_eq!(h.frag_offset(), 1480);
        assert!(!h.is_atomic());
        assert_eq!(h.proto(), 17);
        // The wire offset field holds 8-byte units.
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 0x2000 | (1480 / 8) as u16);
    }

    #[test]
    fn arp_header_round_trips() {
        let mut bytes = [0u8; ARP_PKT_LEN];
        let h = ArpHeader::mut_from(&mut bytes[..]).unwrap();
        let mac = Mac::new([2, 0, 0, 0, 0, 1]);
        h.init(
            ARP_OP_REQUEST,
            mac,
            Ipv4Addr::new([10, 0, 0, 1]),
            Mac::new([0; 6]),
            Ipv4Addr::new([10, 0, 0, 2]),
        );
        assert!(h.is_valid());
        assert_eq!(h.op(), ARP_OP_REQUEST);
        assert_eq!(h.sender_mac(), mac);
        assert_eq!(h.target_ip(), Ipv4Addr::new([10, 0, 0, 2]));
    }
}
