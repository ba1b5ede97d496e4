// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The IPv4 datagram processing core of a shared-nothing userspace network
//! stack.
//!
//! One [`Ipv4Engine`] instance runs per CPU shard, touched only by that
//! shard's cooperative scheduler; nothing here is locked. The engine sits
//! between a link-layer demultiplexer (modeled by [`device::LinkDevice`])
//! and registered upper protocols ([`ipv4::IpProtocolHandler`]), and owns
//! the four concerns that make the layer hard:
//!
//! * a zero-copy scatter-gather [`Packet`] with shared storage and a
//!   deleter chain ([`packet`]);
//! * fragment reassembly under timeout and memory watermarks
//!   ([`reassembly`]);
//! * deterministic shard steering, so every packet of a flow — fragments
//!   included — lands on one shard ([`steering`]);
//! * ARP next-hop resolution with request coalescing and bounded retry
//!   ([`arp`]).
//!
//! Time and timers reach the core through the bindings traits in [`time`];
//! everything is drivable from tests with a fake clock.

#![deny(missing_docs, unreachable_patterns)]

pub mod arp;
pub mod checksum;
pub mod counters;
pub mod device;
pub mod error;
pub mod ipv4;
pub mod packet;
pub mod reassembly;
pub mod steering;
pub mod time;
pub mod wire;

#[cfg(any(test, feature = "testutils"))]
pub mod testutil;


pub use counters::{Counter, Ipv4Counters};
pub use device::{HwFeatures, LinkDevice};
pub use error::{AddressResolutionFailed, AllocationError, LinkError, SendError};
pub use ipv4::{Ipv4Config, Ipv4Engine, SendDisposition};
pub use packet::{Deleter, OffloadInfo, Packet};
pub use steering::ShardId;
pub use time::{Instant, InstantContext, TimerContext, TimerId};
