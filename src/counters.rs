// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-shard packet counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// An atomic counter for packet statistics, e.g. IPv4 packets received.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increments the counter value by 1.
    pub fn increment(&self) {
        // Use relaxed ordering since we do not use packet counter values to
        // synchronize other accesses.
        let Self(v) = self;
        let _: u64 = v.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter value by `n`.
    pub fn add(&self, n: u64) {
        let Self(v) = self;
        let _: u64 = v.fetch_add(n, Ordering::Relaxed);
    }

    /// Atomically retrieves the counter value as a `u64`.
    pub fn get(&self) -> u64 {
        let Self(v) = self;
        v.load(Ordering::Relaxed)
    }
}

/// Counters kept by each shard's IPv4 engine.
///
/// Every ingress drop and silent eviction increments exactly one of these;
/// nothing about a dropped packet propagates as an error.
#[derive(Debug, Default)]
pub struct Ipv4Counters {
    /// Count of incoming packets dropped for a header checksum mismatch.
    pub rx_bad_csum: Counter,
    /// Count of incoming packets dropped because the IPv4 header was absent,
    /// truncated, or internally inconsistent.
    pub rx_malformed: Counter,
    /// Count of incoming fragments dropped because the reassembled datagram
    /// would exceed the maximum IP packet length.
    pub rx_oversize: Counter,
    /// Count of incoming packets addressed to another host.
    pub rx_not_for_us: Counter,
    /// Count of incoming packets dropped because no upper protocol is
    /// registered for their protocol number.
    pub rx_unknown_proto: Counter,
    /// Count of packets delivered to an upper protocol on this shard.
    pub rx_delivered: Counter,
    /// Count of reassembly entries evicted because they did not complete
    /// within the fragment timeout.
    pub frag_timeouts: Counter,
    /// Count of reassembly entries evicted to get under the memory high
    /// watermark.
    pub frag_memory_evictions: Counter,
    /// Count of egress datagrams handed to the link layer (fragmented
    /// datagrams count once per fragment).
    pub tx_sent: Counter,
    /// Count of egress fragment emissions abandoned after a link-layer error.
    pub tx_frag_fail: Counter,
    /// Count of next-hop resolutions that exhausted their retries and failed
    /// queued transmissions with `Unreachable`.
    pub arp_unreachable: Counter,
}
