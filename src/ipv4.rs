// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-shard IPv4 engine.
//!
//! One [`Ipv4Engine`] runs on each shard and is touched only by that shard's
//! scheduler, so none of its state is locked. Ingress parses and validates
//! headers, reassembles fragments, and dispatches payloads to registered
//! upper protocols; egress prepends headers, fragments when hardware
//! segmentation cannot, and gates transmission on ARP resolution. The link
//! layer asks [`shard_of`] which shard should process each frame before the
//! engine ever sees it.
//!
//! Every ingress failure is a silent drop plus one counter increment.
//! Egress failures surface to the caller.
//!
//! [`shard_of`]: Ipv4Engine::shard_of

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use net_types::ethernet::Mac;
use net_types::ip::Ipv4Addr;
use tracing::{debug, trace};
use zerocopy::AsBytes as _;

use crate::arp::{
    ArpCache, LearnEvent, LinkResolution, QueuedTx, ResolutionFailure, ARP_ENTRY_TTL,
};
use crate::checksum::Checksummer;
use crate::counters::Ipv4Counters;
use crate::device::{HwFeatures, LinkDevice};
use crate::error::{DropReason, SendError};
use crate::packet::{OffloadInfo, Packet};
use crate::reassembly::{
    AddFragmentOutcome, FragmentCache, FragmentId, ReassembledDatagram, FRAG_MEM_HIGH,
    FRAG_MEM_LOW, FRAG_TIMEOUT,
};
use crate::steering::{fragment_shard, ShardId};
use crate::time::{Instant, TimerContext, TimerId};
use crate::wire::{
    EthernetHeader, IcmpEchoHeader, Ipv4Header, Ipv4Proto, ETHERTYPE_IPV4, ETH_HDR_LEN,
    ICMP_ECHO_HDR_LEN, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, IPV4_HDR_LEN, IPV4_MAX_PACKET_LEN,
};

const DEFAULT_TTL: u8 = 64;

/// Configuration of one shard's engine.
#[derive(Copy, Clone, Debug)]
pub struct Ipv4Config {
    /// The host's address; ingress packets for other destinations drop.
    pub host_addr: Ipv4Addr,
    /// The subnet mask deciding directly-connected next hops.
    pub netmask: Ipv4Addr,
    /// The default gateway for destinations outside the subnet.
    pub gateway: Ipv4Addr,
    /// How long an incomplete reassembly may wait for fragments.
    pub frag_timeout: Duration,
    /// Memory-pressure eviction drains reassembly memory to this level.
    pub frag_mem_low: usize,
    /// Reassembly memory above this level triggers eviction.
    pub frag_mem_high: usize,
    /// How long learned ARP entries stay valid.
    pub arp_entry_ttl: Duration,
}

impl Default for Ipv4Config {
    fn default() -> Ipv4Config {
        Ipv4Config {
            host_addr: Ipv4Addr::new([0; 4]),
            netmask: Ipv4Addr::new([0; 4]),
            gateway: Ipv4Addr::new([0; 4]),
            frag_timeout: FRAG_TIMEOUT,
            frag_mem_low: FRAG_MEM_LOW,
            frag_mem_high: FRAG_MEM_HIGH,
            arp_entry_ttl: ARP_ENTRY_TTL,
        }
    }
}

/// An upper protocol registered with the engine.
///
/// Adding a protocol is a registration, not a subclass: the engine keys its
/// dispatch table by protocol number and calls through this trait.
pub trait IpProtocolHandler {
    /// Delivers an IP payload received for this protocol on this shard.
    fn received(&mut self, packet: Packet, src_ip: Ipv4Addr, dst_ip: Ipv4Addr);

    /// Computes the shard owning the packet's flow, typically an RSS hash of
    /// the transport 4-tuple at `l4_offset` (see
    /// [`crate::steering::flow_shard`]). `None` keeps the packet on the
    /// current shard.
    fn forward(
        &mut self,
        packet: &Packet,
        l4_offset: usize,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Option<ShardId> {
        let _ = (packet, l4_offset, src_ip, dst_ip);
        None
    }
}

/// What a packet filter decided about a packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Continue normal processing.
    Pass,
    /// The filter owns the packet's disposition; the engine stops.
    Handled,
}

/// A hook inspecting every validated ingress packet before delivery.
pub trait PacketFilter {
    /// Inspects (and possibly consumes) `packet`.
    fn handle(&mut self, packet: &mut Packet, header: &Ipv4Header, from: Mac) -> FilterVerdict;
}

/// How [`Ipv4Engine::send`] left the datagram.
#[derive(Debug)]
pub enum SendDisposition {
    /// Every frame was handed to the link layer.
    Sent,
    /// Transmission is queued behind next-hop resolution; the observer
    /// completes when the frames go out or resolution fails.
    Pending(PendingSend),
}

/// A future completing when an ARP-gated transmission finishes.
#[derive(Debug)]
pub struct PendingSend(oneshot::Receiver<Result<(), SendError>>);

impl Future for PendingSend {
    type Output = Result<(), SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Self(rx) = &mut *self;
        Pin::new(rx).poll(cx).map(|r| r.unwrap_or(Err(SendError::Unreachable)))
    }
}

enum ProtocolEntry {
    // ICMP echo is answered by the engine itself.
    IcmpEcho,
    Handler(Box<dyn IpProtocolHandler>),
}

/// The per-shard IPv4 engine.
pub struct Ipv4Engine<I: Instant> {
    cfg: Ipv4Config,
    shard: ShardId,
    num_shards: u16,
    l4: HashMap<u8, ProtocolEntry>,
    filter: Option<Box<dyn PacketFilter>>,
    frags: FragmentCache<I>,
    arp: ArpCache<I>,
    counters: Ipv4Counters,
    next_egress_ident: u16,
}

impl<I: Instant> Ipv4Engine<I> {
    /// Creates the engine for `shard` of `num_shards`.
    ///
    /// # Panics
    ///
    /// Panics if `shard` is out of range.
    pub fn new(cfg: Ipv4Config, shard: ShardId, num_shards: u16) -> Ipv4Engine<I> {
        assert!(shard.0 < num_shards);
        let mut arp = ArpCache::new(cfg.arp_entry_ttl);
        arp.set_self_addr(cfg.host_addr);
        let mut l4 = HashMap::new();
        let _: Option<ProtocolEntry> =
            l4.insert(Ipv4Proto::Icmp.value(), ProtocolEntry::IcmpEcho);
        Ipv4Engine {
            frags: FragmentCache::new(cfg.frag_timeout, cfg.frag_mem_low, cfg.frag_mem_high),
            arp,
            cfg,
            shard,
            num_shards,
            l4,
            filter: None,
            counters: Ipv4Counters::default(),
            next_egress_ident: 0,
        }
    }

    /// The shard this engine runs on.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// This shard's counters.
    pub fn counters(&self) -> &Ipv4Counters {
        &self.counters
    }

    /// The host address.
    pub fn host_addr(&self) -> Ipv4Addr {
        self.cfg.host_addr
    }

    /// Registers `handler` for `proto`, replacing any previous registration.
    pub fn register_protocol(&mut self, proto: Ipv4Proto, handler: Box<dyn IpProtocolHandler>) {
        let _: Option<ProtocolEntry> =
            self.l4.insert(proto.value(), ProtocolEntry::Handler(handler));
    }

    /// Installs (or removes) the packet filter.
    pub fn set_packet_filter(&mut self, filter: Option<Box<dyn PacketFilter>>) {
        self.filter = filter;
    }

    fn in_subnet(&self, addr: Ipv4Addr) -> bool {
        let a = addr.ipv4_bytes();
        let h = self.cfg.host_addr.ipv4_bytes();
        let m = self.cfg.netmask.ipv4_bytes();
        (0..4).all(|i| (a[i] ^ h[i]) & m[i] == 0)
    }

    fn alloc_ident(&mut self) -> u16 {
        let ident = self.next_egress_ident;
        self.next_egress_ident = ident.wrapping_add(1);
        ident
    }

    fn drop_rx(&self, reason: DropReason) {
        trace!(?reason, "dropping ingress packet");
        let counter = match reason {
            DropReason::MalformedHeader => &self.counters.rx_malformed,
            DropReason::ChecksumMismatch => &self.counters.rx_bad_csum,
            DropReason::Oversize => &self.counters.rx_oversize,
            DropReason::NotForUs => &self.counters.rx_not_for_us,
            DropReason::UnknownProtocol => &self.counters.rx_unknown_proto,
        };
        counter.increment();
    }

    /// Decides which shard should process the frame whose IP header starts
    /// at byte `off`.
    ///
    /// The link layer registers this as its dispatch function. Atomic
    /// datagrams steer by the upper protocol's flow hash; fragments steer by
    /// their fragment id, so all fragments of a datagram agree.
    pub fn shard_of(&mut self, p: &mut Packet, off: usize) -> ShardId {
        if p.len() < off + IPV4_HDR_LEN {
            return self.shard;
        }
        if p.get_header::<Ipv4Header>(off).is_none() {
            p.linearize(off, IPV4_HDR_LEN);
        }
        let Some(h) = p.get_header::<Ipv4Header>(off).copied() else {
            return self.shard;
        };
        let proto = h.proto();
        if !self.l4.contains_key(&proto) {
            return self.shard;
        }
        if h.is_atomic() {
            let l4_offset = off + h.header_len();
            self.l4_forward(proto, p, l4_offset, h.src_ip(), h.dst_ip()).unwrap_or(self.shard)
        } else {
            let id = FragmentId {
                src_ip: h.src_ip(),
                dst_ip: h.dst_ip(),
                ident: h.id(),
                proto,
            };
            fragment_shard(&id, self.num_shards)
        }
    }

    /// Handles an IPv4 frame delivered by the link layer, already stripped
    /// of its Ethernet header. `from` is the sender's link address.
    pub fn handle_received_packet<BC, D>(
        &mut self,
        ctx: &mut BC,
        device: &mut D,
        mut p: Packet,
        from: Mac,
    ) where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        let Some(h) = parse_ip_header(&mut p) else {
            self.drop_rx(DropReason::MalformedHeader);
            return;
        };
        let hdr_len = h.header_len();

        // Reassembled datagrams were verified fragment by fragment.
        if !device.hw_features().rx_csum_offload && !p.offload_info().reassembled {
            if p.frag(0).len() < hdr_len {
                p.linearize(0, hdr_len);
            }
            let mut csum = Checksummer::new();
            csum.sum(&p.frag(0)[..hdr_len]);
            if csum.get() != [0, 0] {
                self.drop_rx(DropReason::ChecksumMismatch);
                return;
            }
        }

        // Normalize on-wire length to the header's total length.
        let ip_len = h.total_len();
        let pkt_len = p.len();
        if pkt_len > ip_len {
            p.trim_back(pkt_len - ip_len);
        } else if pkt_len < ip_len {
            self.drop_rx(DropReason::MalformedHeader);
            return;
        }
        if h.frag_offset() + p.len() > IPV4_MAX_PACKET_LEN {
            self.drop_rx(DropReason::Oversize);
            return;
        }

        if self.in_subnet(h.src_ip()) && h.src_ip() != self.cfg.host_addr {
            self.neighbor_learn(ctx, device, from, h.src_ip());
        }

        if let Some(filter) = self.filter.as_mut() {
            if filter.handle(&mut p, &h, from) == FilterVerdict::Handled {
                return;
            }
        }

        if h.dst_ip() != self.cfg.host_addr {
            self.drop_rx(DropReason::NotForUs);
            return;
        }

        if !h.is_atomic() {
            self.receive_fragment(ctx, device, h, from, p);
            return;
        }

        p.trim_front(hdr_len);
        self.l4_received(ctx, device, h.proto(), p, h.src_ip(), h.dst_ip());
    }

    fn receive_fragment<BC, D>(
        &mut self,
        ctx: &mut BC,
        device: &mut D,
        h: Ipv4Header,
        from: Mac,
        p: Packet,
    ) where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        let id = FragmentId {
            src_ip: h.src_ip(),
            dst_ip: h.dst_ip(),
            ident: h.id(),
            proto: h.proto(),
        };
        let now = ctx.now();
        let result = self.frags.add_fragment(
            now,
            id,
            p,
            h.header_len(),
            h.frag_offset() as u16,
            !h.mf(),
        );
        self.counters.frag_memory_evictions.add(result.memory_evictions);
        match result.outcome {
            AddFragmentOutcome::Incomplete => {
                if ctx.scheduled_instant(TimerId::ReassemblyExpiry).is_none() {
                    let _: Option<I> = ctx
                        .schedule_timer(now.add(self.cfg.frag_timeout), TimerId::ReassemblyExpiry);
                }
            }
            AddFragmentOutcome::Complete(datagram) => {
                self.deliver_reassembled(ctx, device, h, from, datagram)
            }
        }
    }

    // A completed reassembly is delivered locally when this shard owns the
    // flow; otherwise it is re-framed and re-injected on the owning shard.
    fn deliver_reassembled<BC, D>(
        &mut self,
        ctx: &mut BC,
        device: &mut D,
        h: Ipv4Header,
        from: Mac,
        datagram: ReassembledDatagram,
    ) where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        let ReassembledDatagram { header, data } = datagram;
        let target = self
            .l4_forward(h.proto(), &data, 0, h.src_ip(), h.dst_ip())
            .unwrap_or(self.shard);
        if target == self.shard {
            self.l4_received(ctx, device, h.proto(), data, h.src_ip(), h.dst_ip());
        } else {
            trace!(%target, "forwarding reassembled datagram");
            let frame = assemble_forward_frame(device.hw_address(), from, header, data);
            device.shard_forward(target, frame);
        }
    }

    fn l4_received<BC, D>(
        &mut self,
        ctx: &mut BC,
        device: &mut D,
        proto: u8,
        p: Packet,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        if matches!(self.l4.get(&proto), Some(ProtocolEntry::IcmpEcho)) {
            self.counters.rx_delivered.increment();
            self.icmp_received(ctx, device, p, src_ip, dst_ip);
            return;
        }
        if let Some(ProtocolEntry::Handler(handler)) = self.l4.get_mut(&proto) {
            self.counters.rx_delivered.increment();
            handler.received(p, src_ip, dst_ip);
        } else {
            self.drop_rx(DropReason::UnknownProtocol);
        }
    }

    fn l4_forward(
        &mut self,
        proto: u8,
        p: &Packet,
        l4_offset: usize,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Option<ShardId> {
        match self.l4.get_mut(&proto) {
            Some(ProtocolEntry::Handler(handler)) => {
                handler.forward(p, l4_offset, src_ip, dst_ip)
            }
            Some(ProtocolEntry::IcmpEcho) | None => None,
        }
    }

    // Echo requests are answered in place: flip the type, recompute the
    // checksum over the full message, send back to the requester.
    fn icmp_received<BC, D>(
        &mut self,
        ctx: &mut BC,
        device: &mut D,
        mut p: Packet,
        src_ip: Ipv4Addr,
        _dst_ip: Ipv4Addr,
    ) where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        if p.len() < ICMP_ECHO_HDR_LEN {
            return;
        }
        if p.get_header::<IcmpEchoHeader>(0).is_none() {
            p.linearize(0, ICMP_ECHO_HDR_LEN);
        }
        let Some(h) = p.get_header::<IcmpEchoHeader>(0) else { return };
        if h.msg_type() != ICMP_ECHO_REQUEST || h.code() != 0 {
            trace!(msg_type = h.msg_type(), "ignoring icmp message");
            return;
        }
        if p.get_header_mut::<IcmpEchoHeader>(0).is_none() {
            p.linearize(0, ICMP_ECHO_HDR_LEN);
        }
        p.get_header_mut::<IcmpEchoHeader>(0).unwrap().set_type_for_reply(ICMP_ECHO_REPLY);
        let mut csum = Checksummer::new();
        csum.sum_packet(&p);
        let digest = csum.get();
        p.get_header_mut::<IcmpEchoHeader>(0).unwrap().set_checksum(digest);
        match self.send(ctx, device, src_ip, Ipv4Proto::Icmp, p) {
            Ok(_) => {}
            Err(e) => debug!(error = %e, "failed to send echo reply"),
        }
    }

    /// Sends `p` as the payload of one IPv4 datagram to `to`.
    ///
    /// The next hop is `to` itself when directly connected, the gateway
    /// otherwise. The datagram is fragmented when it exceeds the MTU and the
    /// device cannot segment this protocol in hardware; fragments are
    /// emitted in increasing offset order and the first link error abandons
    /// the remainder, as does a failure to allocate a fragment's header
    /// (`ResourceExhausted`). If the next hop is still resolving, the
    /// prepared frames queue behind the (single) outstanding ARP request and
    /// the returned [`SendDisposition::Pending`] observer reports the final
    /// outcome.
    pub fn send<BC, D>(
        &mut self,
        ctx: &mut BC,
        device: &mut D,
        to: Ipv4Addr,
        proto: Ipv4Proto,
        mut p: Packet,
    ) -> Result<SendDisposition, SendError>
    where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        let hw = device.hw_features();
        let next_hop = if self.in_subnet(to) { to } else { self.cfg.gateway };
        let ident = self.alloc_ident();
        let mut frames = Vec::new();
        if needs_frag(p.len(), proto, &hw) {
            // Fragment payloads are the largest multiple of 8 that fits,
            // except possibly the tail.
            let mtu_payload = (usize::from(hw.mtu) - IPV4_HDR_LEN) & !7;
            let total = p.len();
            let mut offset = 0;
            while offset < total {
                let can_send = mtu_payload.min(total - offset);
                let mf = offset + can_send < total;
                let mut fragment = p.share(offset, can_send);
                self.prepend_ip_header(&mut fragment, to, proto, &hw, ident, Some((mf, offset)))?;
                frames.push(fragment);
                offset += can_send;
            }
        } else {
            self.prepend_ip_header(&mut p, to, proto, &hw, ident, None)?;
            frames.push(p);
        }
        match self.arp.lookup(ctx, device, next_hop) {
            LinkResolution::Resolved(mac) => {
                self.transmit(device, mac, frames)?;
                Ok(SendDisposition::Sent)
            }
            LinkResolution::Pending(_observer) => {
                let (notify, rx) = oneshot::channel();
                self.arp.queue_tx(next_hop, QueuedTx { frames, notify: Some(notify) });
                Ok(SendDisposition::Pending(PendingSend(rx)))
            }
        }
    }

    fn prepend_ip_header(
        &mut self,
        p: &mut Packet,
        dst_ip: Ipv4Addr,
        proto: Ipv4Proto,
        hw: &HwFeatures,
        ident: u16,
        frag: Option<(bool, usize)>,
    ) -> Result<(), SendError> {
        let total_len = p.len() + IPV4_HDR_LEN;
        let src_ip = self.cfg.host_addr;
        {
            let h = p.try_prepend_header::<Ipv4Header>()?;
            h.init(total_len, ident, frag, DEFAULT_TTL, proto.value(), src_ip, dst_ip);
            if !hw.tx_csum_ip_offload {
                let mut csum = Checksummer::new();
                csum.sum(h.as_bytes());
                let digest = csum.get();
                h.set_checksum(digest);
            }
        }
        let offload = p.offload_info_mut();
        offload.needs_ip_csum = hw.tx_csum_ip_offload;
        offload.l4_proto = Some(proto);
        offload.ip_hdr_len = IPV4_HDR_LEN as u8;
        Ok(())
    }

    fn transmit<D: LinkDevice>(
        &mut self,
        device: &mut D,
        mac: Mac,
        frames: Vec<Packet>,
    ) -> Result<(), SendError> {
        for frame in frames {
            if let Err(e) = device.send(mac, ETHERTYPE_IPV4, frame) {
                self.counters.tx_frag_fail.increment();
                return Err(SendError::Link(e));
            }
            self.counters.tx_sent.increment();
        }
        Ok(())
    }

    /// Handles an ingress ARP frame: answers requests for our address and
    /// learns sender mappings, flushing any transmissions queued on them.
    pub fn handle_received_arp<BC, D>(&mut self, ctx: &mut BC, device: &mut D, p: Packet)
    where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        if let Some(LearnEvent { mac, released }) = self.arp.receive_frame(ctx, device, p) {
            self.flush_released(device, mac, released);
        }
    }

    /// Records a neighbor's link address and flushes transmissions queued on
    /// it.
    pub fn neighbor_learn<BC, D>(&mut self, ctx: &mut BC, device: &mut D, mac: Mac, addr: Ipv4Addr)
    where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        let released = self.arp.learn(ctx.now(), mac, addr);
        self.flush_released(device, mac, released);
    }

    /// Resolves a neighbor's link address; see [`ArpCache::lookup`].
    pub fn neighbor_lookup<BC, D>(
        &mut self,
        ctx: &mut BC,
        device: &mut D,
        addr: Ipv4Addr,
    ) -> LinkResolution
    where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        self.arp.lookup(ctx, device, addr)
    }

    fn flush_released<D: LinkDevice>(
        &mut self,
        device: &mut D,
        mac: Mac,
        released: Vec<QueuedTx>,
    ) {
        for QueuedTx { frames, notify } in released {
            let result = self.transmit(device, mac, frames);
            if let Some(notify) = notify {
                let _ = notify.send(result);
            }
        }
    }

    /// Dispatches a fired timer.
    pub fn handle_timer<BC, D>(&mut self, ctx: &mut BC, device: &mut D, id: TimerId)
    where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        match id {
            TimerId::ReassemblyExpiry => {
                let sweep = self.frags.on_timer(ctx.now());
                self.counters.frag_timeouts.add(sweep.expired);
                if let Some(at) = sweep.rearm_at {
                    let _: Option<I> = ctx.schedule_timer(at, TimerId::ReassemblyExpiry);
                }
            }
            TimerId::ArpRetry => {
                for failure in self.arp.on_timer(ctx, device) {
                    let ResolutionFailure { addr, queued } = failure;
                    self.counters.arp_unreachable.increment();
                    debug!(%addr, "dropping transmissions to unreachable next hop");
                    for QueuedTx { frames, notify } in queued {
                        drop(frames);
                        if let Some(notify) = notify {
                            let _ = notify.send(Err(SendError::Unreachable));
                        }
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn fragment_mem(&self) -> usize {
        self.frags.total_mem()
    }
}

fn parse_ip_header(p: &mut Packet) -> Option<Ipv4Header> {
    if p.len() < IPV4_HDR_LEN {
        return None;
    }
    if p.get_header::<Ipv4Header>(0).is_none() {
        p.linearize(0, IPV4_HDR_LEN);
    }
    let h = *p.get_header::<Ipv4Header>(0)?;
    let hdr_len = h.header_len();
    if h.version() != 4
        || hdr_len < IPV4_HDR_LEN
        || p.len() < hdr_len
        || h.total_len() < hdr_len
    {
        return None;
    }
    Some(h)
}

fn needs_frag(payload_len: usize, proto: Ipv4Proto, hw: &HwFeatures) -> bool {
    if payload_len + IPV4_HDR_LEN <= usize::from(hw.mtu) {
        return false;
    }
    match proto {
        Ipv4Proto::Tcp if hw.tx_tso => false,
        Ipv4Proto::Udp if hw.tx_ufo => false,
        _ => true,
    }
}

// Rebuilds a full Ethernet frame around a reassembled datagram so a peer
// shard can re-enter the stack with it. The local MAC is the destination;
// `reassembled` tells the peer's ingress to skip checksum verification, and
// the cleared frag field keeps it from re-entering reassembly.
fn assemble_forward_frame(local: Mac, from: Mac, mut header: Packet, data: Packet) -> Packet {
    header.prepend_header::<EthernetHeader>().init(local, from, ETHERTYPE_IPV4);
    header.append(data);
    let mut frame = header;
    let total_len = frame.len() - ETH_HDR_LEN;
    if frame.get_header_mut::<Ipv4Header>(ETH_HDR_LEN).is_none() {
        frame.linearize(ETH_HDR_LEN, IPV4_HDR_LEN);
    }
    let h = frame.get_header_mut::<Ipv4Header>(ETH_HDR_LEN).unwrap();
    h.set_total_len(total_len);
    h.clear_frag();
    frame.set_offload_info(OffloadInfo { reassembled: true, ..OffloadInfo::default() });
    frame
}
