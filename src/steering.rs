// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deterministic shard selection.
//!
//! Every packet is steered to exactly one shard before protocol processing,
//! so per-flow state never needs a lock. Atomic datagrams hash the transport
//! 4-tuple with the RSS Toeplitz function; fragments hash their
//! [`FragmentId`], which is derived purely from IP header fields, so all
//! fragments of a datagram agree on a shard no matter the arrival order.

use core::fmt::{self, Display, Formatter};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use net_types::ip::Ipv4Addr;

use crate::reassembly::FragmentId;

/// Identifies one CPU-bound cooperative scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ShardId(
    /// The shard's index, in `0..num_shards`.
    pub u16,
);

impl Display for ShardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Self(id) = self;
        write!(f, "shard {}", id)
    }
}

/// The RSS Toeplitz key size.
pub const RSS_KEY_SIZE: usize = 40;

/// The fixed RSS key (the Mellanox Linux driver key, network byte order).
///
/// Symmetric enough in practice for flow steering; sharing one well-known
/// key keeps software steering consistent with NIC RSS indirection.
pub const RSS_KEY: [u8; RSS_KEY_SIZE] = [
    0xd1, 0x81, 0xc6, 0x2c, 0xf7, 0xf4, 0xdb, 0x5b, 0x19, 0x83, 0xa2, 0xfc, 0x94, 0x3e, 0x1a,
    0xdb, 0xd9, 0x38, 0x9e, 0x6b, 0xd1, 0x03, 0x9c, 0x2c, 0xa7, 0x44, 0x99, 0xad, 0x59, 0x3d,
    0x56, 0xd9, 0xf3, 0x25, 0x3c, 0x06, 0x2a, 0xdc, 0x1f, 0xfc,
];

/// The Toeplitz hash of `data` under `key`.
pub fn toeplitz_hash(key: &[u8; RSS_KEY_SIZE], data: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    let mut v: u32 = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
    for (i, byte) in data.iter().enumerate() {
        for b in 0..8 {
            if byte & (1 << (7 - b)) != 0 {
                hash ^= v;
            }
            v <<= 1;
            if i + 4 < key.len() && key[i + 4] & (1 << (7 - b)) != 0 {
                v |= 1;
            }
        }
    }
    hash
}

/// The RSS flow hash over an IPv4 transport 4-tuple.
pub fn flow_hash(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16) -> u32 {
    let mut data = [0u8; 12];
    data[0..4].copy_from_slice(&src_ip.ipv4_bytes());
    data[4..8].copy_from_slice(&dst_ip.ipv4_bytes());
    data[8..10].copy_from_slice(&src_port.to_be_bytes());
    data[10..12].copy_from_slice(&dst_port.to_be_bytes());
    toeplitz_hash(&RSS_KEY, &data)
}

/// The shard owning the flow identified by the transport 4-tuple.
pub fn flow_shard(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    num_shards: u16,
) -> ShardId {
    ShardId((flow_hash(src_ip, dst_ip, src_port, dst_port) % u32::from(num_shards)) as u16)
}

/// The shard owning all fragments of the datagram identified by `id`.
///
/// `DefaultHasher::new()` starts from fixed keys, so the mapping is stable
/// for the lifetime of the process, which is all fragment steering needs.
pub fn fragment_shard(id: &FragmentId, num_shards: u16) -> ShardId {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    ShardId((hasher.finish() % u64::from(num_shards)) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_case::test_case;

    #[test]
    fn toeplitz_known_input() {
        // Hashing 12 zero bytes mixes nothing in.
        assert_eq!(toeplitz_hash(&RSS_KEY, &[0u8; 12]), 0);
        // A nonzero tuple hashes identically on every call.
        let a = flow_hash(
            Ipv4Addr::new([1, 2, 3, 4]),
            Ipv4Addr::new([5, 6, 7, 8]),
            1000,
            80,
        );
        let b = flow_hash(
            Ipv4Addr::new([1, 2, 3, 4]),
            Ipv4Addr::new([5, 6, 7, 8]),
            1000,
            80,
        );
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn flow_shard_in_range() {
        for port in 0..64u16 {
            let ShardId(shard) = flow_shard(
                Ipv4Addr::new([10, 0, 0, 1]),
                Ipv4Addr::new([10, 0, 0, 2]),
                port,
                443,
                3,
            );
            assert!(shard < 3);
        }
    }

    #[test_case(2; "two shards")]
    #[test_case(7; "seven shards")]
    fn fragments_of_a_datagram_share_a_shard(num_shards: u16) {
        let id = FragmentId {
            src_ip: Ipv4Addr::new([192, 0, 2, 1]),
            dst_ip: Ipv4Addr::new([192, 0, 2, 2]),
            ident: 0x1234,
            proto: 17,
        };
        let first = fragment_shard(&id, num_shards);
        for _ in 0..16 {
            assert_eq!(fragment_shard(&id, num_shards), first);
        }
        assert!(first.0 < num_shards);
    }

    #[test]
    fn distinct_datagrams_can_differ() {
        // Not a correctness requirement, but the hash would be useless if
        // every ident mapped to shard 0.
        let base = FragmentId {
            src_ip: Ipv4Addr::new([192, 0, 2, 1]),
            dst_ip: Ipv4Addr::new([192, 0, 2, 2]),
            ident: 0,
            proto: 17,
        };
        let hit_nonzero = (0..64u16).any(|ident| {
            fragment_shard(&FragmentId { ident, ..base }, 4) != ShardId(0)
        });
        assert!(hit_nonzero);
    }
}
