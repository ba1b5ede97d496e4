// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fake bindings for testing: a hand-driven clock, a recording link device,
//! frame builders, and recording protocol handlers.

use std::cell::RefCell;
use std::rc::Rc;

use net_types::ethernet::Mac;
use net_types::ip::Ipv4Addr;

use crate::checksum::checksum;
use crate::device::{HwFeatures, LinkDevice};
use crate::error::LinkError;
use crate::ipv4::IpProtocolHandler;
use crate::packet::Packet;
use crate::steering::{flow_shard, ShardId};
use crate::wire::{IcmpEchoHeader, Ipv4Header, ICMP_ECHO_HDR_LEN, IPV4_HDR_LEN};

pub use crate::time::testutil::{FakeInstant, FakeTimerCtx};

use zerocopy::FromBytes as _;

/// A frame recorded by [`FakeDevice::send`].
pub struct SentFrame {
    /// The destination link address.
    pub dst: Mac,
    /// The frame's ethertype.
    pub ethertype: u16,
    /// The L3 frame.
    pub frame: Packet,
}

/// A fake [`LinkDevice`] recording everything handed to it.
pub struct FakeDevice {
    /// Capabilities reported by [`LinkDevice::hw_features`].
    pub features: HwFeatures,
    /// The local link address.
    pub mac: Mac,
    /// Frames handed to [`LinkDevice::send`], in order.
    pub sent: Vec<SentFrame>,
    /// Frames handed to [`LinkDevice::shard_forward`], in order.
    pub forwarded: Vec<(ShardId, Packet)>,
    /// When set, [`LinkDevice::send`] fails with this error.
    pub send_error: Option<LinkError>,
}

impl Default for FakeDevice {
    fn default() -> FakeDevice {
        FakeDevice {
            features: HwFeatures::default(),
            mac: Mac::new([2, 0, 0, 0, 0, 1]),
            sent: Vec::new(),
            forwarded: Vec::new(),
            send_error: None,
        }
    }
}

impl LinkDevice for FakeDevice {
    fn hw_features(&self) -> HwFeatures {
        self.features
    }

    fn hw_address(&self) -> Mac {
        self.mac
    }

    fn send(&mut self, dst: Mac, ethertype: u16, frame: Packet) -> Result<(), LinkError> {
        if let Some(e) = self.send_error {
            return Err(e);
        }
        self.sent.push(SentFrame { dst, ethertype, frame });
        Ok(())
    }

    fn shard_forward(&mut self, shard: ShardId, frame: Packet) {
        self.forwarded.push((shard, frame));
    }
}

/// Builds an on-wire IPv4 frame (header with valid checksum, then payload).
pub fn ipv4_frame(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    proto: u8,
    ident: u16,
    mf: bool,
    offset: usize,
    payload: &[u8],
) -> Packet {
    let mut bytes = vec![0u8; IPV4_HDR_LEN];
    let h = Ipv4Header::mut_from(&mut bytes[..]).unwrap();
    h.init(
        IPV4_HDR_LEN + payload.len(),
        ident,
        (mf || offset != 0).then_some((mf, offset)),
        64,
        proto,
        src_ip,
        dst_ip,
    );
    let digest = checksum(&bytes);
    bytes[10..12].copy_from_slice(&digest);
    bytes.extend_from_slice(payload);
    Packet::from_vec(bytes)
}

/// Builds the bytes of an ICMP echo request with a valid checksum.
pub fn icmp_echo_request(ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; ICMP_ECHO_HDR_LEN];
    bytes[0] = crate::wire::ICMP_ECHO_REQUEST;
    bytes[4..6].copy_from_slice(&ident.to_be_bytes());
    bytes[6..8].copy_from_slice(&seq.to_be_bytes());
    bytes.extend_from_slice(payload);
    let digest = checksum(&bytes);
    bytes[2..4].copy_from_slice(&digest);
    bytes
}

/// Parses the echo header from ICMP message bytes.
pub fn parse_icmp_echo(bytes: &[u8]) -> IcmpEchoHeader {
    *IcmpEchoHeader::ref_from(&bytes[..ICMP_ECHO_HDR_LEN]).unwrap()
}

/// A shared recording of `received` deliveries: `(payload, src, dst)`.
#[derive(Clone, Default)]
pub struct DeliveryRecord(Rc<RefCell<Vec<(Vec<u8>, Ipv4Addr, Ipv4Addr)>>>);

impl DeliveryRecord {
    /// The deliveries recorded so far.
    pub fn take(&self) -> Vec<(Vec<u8>, Ipv4Addr, Ipv4Addr)> {
        let Self(inner) = self;
        inner.borrow_mut().drain(..).collect()
    }

    /// The number of deliveries recorded so far.
    pub fn len(&self) -> usize {
        let Self(inner) = self;
        inner.borrow().len()
    }

    /// True if nothing was delivered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, payload: Vec<u8>, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) {
        let Self(inner) = self;
        inner.borrow_mut().push((payload, src_ip, dst_ip));
    }
}

/// An upper protocol that records deliveries and steers to a fixed shard.
pub struct RecordingProtocol {
    /// Deliveries observed by this handler.
    pub record: DeliveryRecord,
    /// The shard `forward` reports, or `None` for the current shard.
    pub steer: Option<ShardId>,
}

impl IpProtocolHandler for RecordingProtocol {
    fn received(&mut self, packet: Packet, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) {
        self.record.push(packet.to_vec(), src_ip, dst_ip);
    }

    fn forward(
        &mut self,
        _packet: &Packet,
        _l4_offset: usize,
        _src_ip: Ipv4Addr,
        _dst_ip: Ipv4Addr,
    ) -> Option<ShardId> {
        self.steer
    }
}

/// A TCP-shaped upper protocol steering by the RSS flow hash of the 4-tuple,
/// the way a real transport registers with the engine.
pub struct FlowSteeringProtocol {
    /// Total shard count to hash into.
    pub num_shards: u16,
    /// Deliveries observed by this handler.
    pub record: DeliveryRecord,
}

impl IpProtocolHandler for FlowSteeringProtocol {
    fn received(&mut self, packet: Packet, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) {
        self.record.push(packet.to_vec(), src_ip, dst_ip);
    }

    fn forward(
        &mut self,
        packet: &Packet,
        l4_offset: usize,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Option<ShardId> {
        let bytes = packet.to_vec();
        let ports = bytes.get(l4_offset..l4_offset + 4)?;
        let src_port = u16::from_be_bytes([ports[0], ports[1]]);
        let dst_port = u16::from_be_bytes([ports[2], ports[3]]);
        Some(flow_shard(src_ip, dst_ip, src_port, dst_port, self.num_shards))
    }
}
