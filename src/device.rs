// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The link-layer interface consumed by the engine.

use net_types::ethernet::Mac;

use crate::error::LinkError;
use crate::packet::Packet;
use crate::steering::ShardId;

/// Hardware capabilities of a link device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HwFeatures {
    /// The device MTU, in bytes, excluding the Ethernet header.
    pub mtu: u16,
    /// The device verifies IP header checksums on receive.
    pub rx_csum_offload: bool,
    /// The device fills zeroed IP header checksums on transmit.
    pub tx_csum_ip_offload: bool,
    /// The device fills L4 checksums on transmit.
    pub tx_csum_l4_offload: bool,
    /// TCP segmentation offload: oversized TCP datagrams may be handed down
    /// unfragmented.
    pub tx_tso: bool,
    /// UDP fragmentation offload: oversized UDP datagrams may be handed down
    /// unfragmented.
    pub tx_ufo: bool,
}

impl Default for HwFeatures {
    fn default() -> HwFeatures {
        HwFeatures {
            mtu: 1500,
            rx_csum_offload: false,
            tx_csum_ip_offload: false,
            tx_csum_l4_offload: false,
            tx_tso: false,
            tx_ufo: false,
        }
    }
}

/// A shard's handle to its link device.
///
/// Implementations front a per-shard transmit queue; `send` is a synchronous
/// hand-off into that queue and only fails when the device cannot accept the
/// frame.
pub trait LinkDevice {
    /// The device's capability set.
    fn hw_features(&self) -> HwFeatures;

    /// The local link address.
    fn hw_address(&self) -> Mac;

    /// Queues `frame` (an L3 packet; the device prepends the Ethernet
    /// header) for transmission to `dst` with the given ethertype.
    fn send(&mut self, dst: Mac, ethertype: u16, frame: Packet) -> Result<(), LinkError>;

    /// Hands a fully formed L2 frame to `shard` for re-ingress there.
    ///
    /// The frame's deleter chain travels with it; implementations arrange
    /// for the free to run on the originating shard (see
    /// [`Packet::free_on_shard`]).
    fn shard_forward(&mut self, shard: ShardId, frame: Packet);
}
