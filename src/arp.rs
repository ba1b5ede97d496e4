// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The ARP resolver.
//!
//! [`ArpCache`] maps IPv4 neighbors to link addresses. A miss creates a
//! pending entry, transmits one broadcast request, and hands back an
//! observer; concurrent lookups for the same key coalesce onto the single
//! outstanding request. Transmissions gated on resolution queue on the
//! pending entry and are released to the caller when the neighbor is
//! learned, or failed with `Unreachable` when the probe retries run out.
//!
//! Each key moves `Unknown → Pending → Resolved → Expired`; `Pending`
//! falls back to `Unknown` on retry exhaustion. Expired entries are
//! re-resolved on the next lookup.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use net_types::ethernet::Mac;
use net_types::ip::Ipv4Addr;
use tracing::{debug, trace};

use crate::device::LinkDevice;
use crate::error::{AddressResolutionFailed, SendError};
use crate::packet::Packet;
use crate::time::{Instant, TimerContext, TimerId};
use crate::wire::{ArpHeader, ARP_OP_REPLY, ARP_OP_REQUEST, ARP_PKT_LEN, ETHERTYPE_ARP};

/// How long to wait for a reply before reprobing.
pub const ARP_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
/// How many times an unanswered request is retried before waiters fail.
pub const ARP_MAX_RETRIES: u8 = 3;
/// How long a learned entry stays valid.
pub const ARP_ENTRY_TTL: Duration = Duration::from_secs(20 * 60);

const UNSPECIFIED: Ipv4Addr = Ipv4Addr::new([0; 4]);

/// A transmission waiting on (or failed by) neighbor resolution.
pub struct QueuedTx {
    /// L3 frames ready to transmit, in emission order.
    pub frames: Vec<Packet>,
    /// Completion notification for the caller that queued the send.
    pub notify: Option<oneshot::Sender<Result<(), SendError>>>,
}

/// A neighbor whose resolution retries ran out.
pub struct ResolutionFailure {
    /// The unresolvable address.
    pub addr: Ipv4Addr,
    /// Transmissions that were waiting on it.
    pub queued: Vec<QueuedTx>,
}

/// The payload of a learn: queued transmissions released by the new entry.
pub struct LearnEvent {
    /// The learned link address.
    pub mac: Mac,
    /// Transmissions waiting on the learned neighbor, in queue order.
    pub released: Vec<QueuedTx>,
}

/// The result of [`ArpCache::lookup`].
pub enum LinkResolution {
    /// The link address was cached.
    Resolved(Mac),
    /// Resolution is in flight; the observer completes on learn or failure.
    Pending(LinkResolutionObserver),
}

/// A future resolving to the looked-up link address.
pub struct LinkResolutionObserver(oneshot::Receiver<Result<Mac, AddressResolutionFailed>>);

impl Future for LinkResolutionObserver {
    type Output = Result<Mac, AddressResolutionFailed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Self(rx) = &mut *self;
        Pin::new(rx).poll(cx).map(|r| r.unwrap_or(Err(AddressResolutionFailed)))
    }
}

enum NeighborState<I> {
    Resolved { mac: Mac, expires_at: I },
    Pending(PendingNeighbor<I>),
}

struct PendingNeighbor<I> {
    // Probes left after the initial request.
    retries_left: u8,
    next_probe: I,
    waiters: Vec<oneshot::Sender<Result<Mac, AddressResolutionFailed>>>,
    queued: Vec<QueuedTx>,
}

/// The per-shard neighbor table.
pub struct ArpCache<I> {
    self_addr: Ipv4Addr,
    entries: HashMap<Ipv4Addr, NeighborState<I>>,
    ttl: Duration,
}

impl<I: Instant> ArpCache<I> {
    /// Creates a cache whose learned entries live for `ttl`.
    pub fn new(ttl: Duration) -> ArpCache<I> {
        ArpCache { self_addr: UNSPECIFIED, entries: HashMap::new(), ttl }
    }

    /// Sets the address this resolver answers requests for.
    pub fn set_self_addr(&mut self, addr: Ipv4Addr) {
        self.self_addr = addr;
    }

    /// Records `addr → mac`, waking pending lookups and returning any
    /// transmissions that were queued on the key.
    pub fn learn(&mut self, now: I, mac: Mac, addr: Ipv4Addr) -> Vec<QueuedTx> {
        trace!(%addr, ?mac, "arp learn");
        let fresh = NeighborState::Resolved { mac, expires_at: now.add(self.ttl) };
        match self.entries.insert(addr, fresh) {
            Some(NeighborState::Pending(PendingNeighbor {
                retries_left: _,
                next_probe: _,
                waiters,
                queued,
            })) => {
                for w in waiters {
                    // A waiter may have dropped its observer.
                    let _ = w.send(Ok(mac));
                }
                queued
            }
            Some(NeighborState::Resolved { .. }) | None => Vec::new(),
        }
    }

    /// Returns the cached link address for `addr`, or registers a waiter on
    /// the (single) outstanding request for it, probing if none is in
    /// flight.
    pub fn lookup<BC, D>(&mut self, ctx: &mut BC, device: &mut D, addr: Ipv4Addr) -> LinkResolution
    where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        let now = ctx.now();
        if let Some(NeighborState::Resolved { mac, expires_at }) = self.entries.get(&addr) {
            if now < *expires_at {
                return LinkResolution::Resolved(*mac);
            }
            trace!(%addr, "arp entry expired");
            let _: Option<NeighborState<I>> = self.entries.remove(&addr);
        }
        let (tx, rx) = oneshot::channel();
        let mut probe = false;
        match self.entries.entry(addr) {
            Entry::Occupied(mut o) => match o.get_mut() {
                NeighborState::Pending(p) => p.waiters.push(tx),
                // Freshness was checked above; the entry cannot be resolved
                // here within this synchronous call.
                NeighborState::Resolved { .. } => unreachable!(),
            },
            Entry::Vacant(v) => {
                let _: &mut NeighborState<I> = v.insert(NeighborState::Pending(PendingNeighbor {
                    retries_left: ARP_MAX_RETRIES,
                    next_probe: now.add(ARP_REQUEST_TIMEOUT),
                    waiters: vec![tx],
                    queued: Vec::new(),
                }));
                probe = true;
            }
        }
        if probe {
            self.send_request(device, addr);
            arm_retry_timer(ctx, now.add(ARP_REQUEST_TIMEOUT));
        }
        LinkResolution::Pending(LinkResolutionObserver(rx))
    }

    /// Queues `tx` on the pending entry for `addr`.
    ///
    /// If no resolution is pending (the caller did not just get
    /// [`LinkResolution::Pending`] for the key), the transmission fails
    /// immediately with `Unreachable`.
    pub fn queue_tx(&mut self, addr: Ipv4Addr, tx: QueuedTx) {
        match self.entries.get_mut(&addr) {
            Some(NeighborState::Pending(p)) => p.queued.push(tx),
            Some(NeighborState::Resolved { .. }) | None => {
                let QueuedTx { frames: _, notify } = tx;
                if let Some(notify) = notify {
                    let _ = notify.send(Err(SendError::Unreachable));
                }
            }
        }
    }

    /// Handles an ingress ARP packet: learns the sender mapping and answers
    /// requests for our address with a unicast reply.
    pub fn receive_frame<BC, D>(
        &mut self,
        ctx: &mut BC,
        device: &mut D,
        mut p: Packet,
    ) -> Option<LearnEvent>
    where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        if p.len() < ARP_PKT_LEN {
            return None;
        }
        if p.get_header::<ArpHeader>(0).is_none() {
            p.linearize(0, ARP_PKT_LEN);
        }
        let h = *p.get_header::<ArpHeader>(0)?;
        if !h.is_valid() {
            return None;
        }
        if h.op() == ARP_OP_REQUEST && self.self_addr != UNSPECIFIED && h.target_ip() == self.self_addr
        {
            let mut reply = Packet::from_vec(vec![0; ARP_PKT_LEN]);
            reply.get_header_mut::<ArpHeader>(0).unwrap().init(
                ARP_OP_REPLY,
                device.hw_address(),
                self.self_addr,
                h.sender_mac(),
                h.sender_ip(),
            );
            if let Err(e) = device.send(h.sender_mac(), ETHERTYPE_ARP, reply) {
                debug!(error = %e, "failed to transmit arp reply");
            }
        }
        // Address probes carry an unspecified sender; there is nothing to
        // learn from them.
        if h.sender_ip() == UNSPECIFIED {
            return None;
        }
        let released = self.learn(ctx.now(), h.sender_mac(), h.sender_ip());
        Some(LearnEvent { mac: h.sender_mac(), released })
    }

    /// Drives probe retransmission and entry expiry.
    ///
    /// Returns the neighbors whose retries ran out; their queued
    /// transmissions must be failed by the caller.
    pub fn on_timer<BC, D>(&mut self, ctx: &mut BC, device: &mut D) -> Vec<ResolutionFailure>
    where
        BC: TimerContext<Instant = I>,
        D: LinkDevice,
    {
        let now = ctx.now();
        let mut failures = Vec::new();
        let mut probes = Vec::new();
        self.entries.retain(|addr, state| match state {
            NeighborState::Resolved { mac: _, expires_at } => *expires_at > now,
            NeighborState::Pending(p) => {
                if p.next_probe > now {
                    return true;
                }
                if p.retries_left > 0 {
                    p.retries_left -= 1;
                    p.next_probe = now.add(ARP_REQUEST_TIMEOUT);
                    probes.push(*addr);
                    true
                } else {
                    debug!(%addr, "arp resolution failed after retries");
                    for w in p.waiters.drain(..) {
                        let _ = w.send(Err(AddressResolutionFailed));
                    }
                    failures.push(ResolutionFailure {
                        addr: *addr,
                        queued: std::mem::take(&mut p.queued),
                    });
                    false
                }
            }
        });
        for addr in probes {
            self.send_request(device, addr);
        }
        let next_probe = self
            .entries
            .values()
            .filter_map(|state| match state {
                NeighborState::Pending(p) => Some(p.next_probe),
                NeighborState::Resolved { .. } => None,
            })
            .min();
        if let Some(at) = next_probe {
            arm_retry_timer(ctx, at);
        }
        failures
    }

    fn send_request<D: LinkDevice>(&self, device: &mut D, target: Ipv4Addr) {
        trace!(%target, "arp probe");
        let mut p = Packet::from_vec(vec![0; ARP_PKT_LEN]);
        p.get_header_mut::<ArpHeader>(0).unwrap().init(
            ARP_OP_REQUEST,
            device.hw_address(),
            self.self_addr,
            Mac::new([0; 6]),
            target,
        );
        if let Err(e) = device.send(Mac::BROADCAST, ETHERTYPE_ARP, p) {
            // The pending entry's next probe will try again.
            debug!(error = %e, "failed to transmit arp request");
        }
    }
}

// Arms the shared retry timer, keeping the earliest requested deadline.
fn arm_retry_timer<BC: TimerContext>(ctx: &mut BC, at: BC::Instant) {
    match ctx.scheduled_instant(TimerId::ArpRetry) {
        Some(scheduled) if scheduled <= at => {}
        Some(_) | None => {
            let _: Option<BC::Instant> = ctx.schedule_timer(at, TimerId::ArpRetry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use futures::FutureExt as _;

    use crate::testutil::{FakeDevice, FakeTimerCtx};

    const NEIGHBOR: Ipv4Addr = Ipv4Addr::new([10, 0, 0, 2]);
    const NEIGHBOR_MAC: Mac = Mac::new([2, 0, 0, 0, 0, 2]);
    const SELF_ADDR: Ipv4Addr = Ipv4Addr::new([10, 0, 0, 1]);

    fn new_cache() -> ArpCache<crate::time::testutil::FakeInstant> {
        let mut cache = ArpCache::new(ARP_ENTRY_TTL);
        cache.set_self_addr(SELF_ADDR);
        cache
    }

    fn fire_retry(
        cache: &mut ArpCache<crate::time::testutil::FakeInstant>,
        ctx: &mut FakeTimerCtx,
        device: &mut FakeDevice,
    ) -> Vec<ResolutionFailure> {
        assert_eq!(ctx.pop_due_timer(), Some(TimerId::ArpRetry));
        cache.on_timer(ctx, device)
    }

    #[test]
    fn lookup_miss_probes_once_and_coalesces() {
        let mut cache = new_cache();
        let mut ctx = FakeTimerCtx::default();
        let mut device = FakeDevice::default();

        let first = cache.lookup(&mut ctx, &mut device, NEIGHBOR);
        let second = cache.lookup(&mut ctx, &mut device, NEIGHBOR);
        assert_matches!(first, LinkResolution::Pending(_));
        let mut second = assert_matches!(second, LinkResolution::Pending(o) => o);

        // One broadcast request despite two lookups.
        assert_eq!(device.sent.len(), 1);
        let frame = &device.sent[0];
        assert_eq!(frame.dst, Mac::BROADCAST);
        assert_eq!(frame.ethertype, ETHERTYPE_ARP);
        let h = frame.frame.get_header::<ArpHeader>(0).unwrap();
        assert_eq!(h.op(), ARP_OP_REQUEST);
        assert_eq!(h.sender_ip(), SELF_ADDR);
        assert_eq!(h.target_ip(), NEIGHBOR);

        let released = cache.learn(ctx.now(), NEIGHBOR_MAC, NEIGHBOR);
        assert!(released.is_empty());
        assert_eq!((&mut second).now_or_never(), Some(Ok(NEIGHBOR_MAC)));

        // Subsequent lookups hit the cache.
        assert_matches!(
            cache.lookup(&mut ctx, &mut device, NEIGHBOR),
            LinkResolution::Resolved(mac) if mac == NEIGHBOR_MAC
        );
    }

    #[test]
    fn retries_then_fails_waiters_and_queued() {
        let mut cache = new_cache();
        let mut ctx = FakeTimerCtx::default();
        let mut device = FakeDevice::default();

        let observer = cache.lookup(&mut ctx, &mut device, NEIGHBOR);
        let mut observer = assert_matches!(observer, LinkResolution::Pending(o) => o);
        let (notify, mut queued_rx) = oneshot::channel();
        cache.queue_tx(
            NEIGHBOR,
            QueuedTx { frames: vec![Packet::from_vec(vec![0; 20])], notify: Some(notify) },
        );

        // Initial probe plus ARP_MAX_RETRIES retransmits.
        for probe in 0..ARP_MAX_RETRIES {
            assert_eq!(device.sent.len(), 1 + usize::from(probe));
            ctx.sleep(ARP_REQUEST_TIMEOUT);
            assert_eq!(fire_retry(&mut cache, &mut ctx, &mut device).len(), 0);
        }
        assert_eq!(device.sent.len(), 1 + usize::from(ARP_MAX_RETRIES));
        assert_eq!((&mut observer).now_or_never(), None);

        ctx.sleep(ARP_REQUEST_TIMEOUT);
        let failures = fire_retry(&mut cache, &mut ctx, &mut device);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].addr, NEIGHBOR);
        assert_eq!(failures[0].queued.len(), 1);
        assert_eq!((&mut observer).now_or_never(), Some(Err(AddressResolutionFailed)));
        // The engine, not the cache, fails queued notifications; drop them
        // here and observe the canceled channel.
        drop(failures);
        assert_matches!(queued_rx.try_recv(), Err(oneshot::Canceled));
    }

    #[test]
    fn learn_releases_queued_transmissions() {
        let mut cache = new_cache();
        let mut ctx = FakeTimerCtx::default();
        let mut device = FakeDevice::default();

        assert_matches!(
            cache.lookup(&mut ctx, &mut device, NEIGHBOR),
            LinkResolution::Pending(_)
        );
        cache.queue_tx(NEIGHBOR, QueuedTx { frames: vec![Packet::from_vec(vec![1, 2, 3])], notify: None });
        let released = cache.learn(ctx.now(), NEIGHBOR_MAC, NEIGHBOR);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].frames.len(), 1);
        assert_eq!(released[0].frames[0].to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn queue_tx_without_pending_fails_immediately() {
        let mut cache = new_cache();
        let (notify, mut rx) = oneshot::channel();
        cache.queue_tx(NEIGHBOR, QueuedTx { frames: Vec::new(), notify: Some(notify) });
        assert_eq!(rx.try_recv(), Ok(Some(Err(SendError::Unreachable))));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache: ArpCache<_> = ArpCache::new(Duration::from_secs(60));
        cache.set_self_addr(SELF_ADDR);
        let mut ctx = FakeTimerCtx::default();
        let mut device = FakeDevice::default();

        let _ = cache.learn(ctx.now(), NEIGHBOR_MAC, NEIGHBOR);
        assert_matches!(
            cache.lookup(&mut ctx, &mut device, NEIGHBOR),
            LinkResolution::Resolved(_)
        );
        ctx.sleep(Duration::from_secs(61));
        // The expired entry falls back to a probe.
        assert_matches!(
            cache.lookup(&mut ctx, &mut device, NEIGHBOR),
            LinkResolution::Pending(_)
        );
        assert_eq!(device.sent.len(), 1);
    }

    #[test]
    fn request_for_our_address_gets_unicast_reply() {
        let mut cache = new_cache();
        let mut ctx = FakeTimerCtx::default();
        let mut device = FakeDevice::default();

        let mut request = Packet::from_vec(vec![0; ARP_PKT_LEN]);
        request.get_header_mut::<ArpHeader>(0).unwrap().init(
            ARP_OP_REQUEST,
            NEIGHBOR_MAC,
            NEIGHBOR,
            Mac::new([0; 6]),
            SELF_ADDR,
        );
        let event = cache.receive_frame(&mut ctx, &mut device, request);
        let event = event.unwrap();
        assert_eq!(event.mac, NEIGHBOR_MAC);
        assert!(event.released.is_empty());

        assert_eq!(device.sent.len(), 1);
        let frame = &device.sent[0];
        assert_eq!(frame.dst, NEIGHBOR_MAC);
        let h = frame.frame.get_header::<ArpHeader>(0).unwrap();
        assert_eq!(h.op(), ARP_OP_REPLY);
        assert_eq!(h.sender_ip(), SELF_ADDR);
        assert_eq!(h.target_ip(), NEIGHBOR);

        // The request also taught us the sender's mapping.
        assert_matches!(
            cache.lookup(&mut ctx, &mut device, NEIGHBOR),
            LinkResolution::Resolved(mac) if mac == NEIGHBOR_MAC
        );
        // No probe went out for the cached neighbor.
        assert_eq!(device.sent.len(), 1);
    }
}
