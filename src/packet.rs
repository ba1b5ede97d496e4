// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The scatter-gather packet buffer.
//!
//! A [`Packet`] is an ordered list of fragments, each a view into a byte
//! region. Storage starts out uniquely owned and is frozen into an atomic
//! refcount on first [`share`]; sharing, trimming, prepending, and appending
//! never copy payload bytes. Only [`linearize`] allocates and copies, and
//! only over the span it is asked to make contiguous.
//!
//! A packet additionally carries a [`Deleter`] chain — an opaque cleanup
//! action that runs exactly once when the last packet referencing it drops —
//! and an [`OffloadInfo`] descriptor of checksum/segmentation work already
//! done or delegated to hardware.
//!
//! [`share`]: Packet::share
//! [`linearize`]: Packet::linearize

use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use derivative::Derivative;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::error::AllocationError;
use crate::steering::ShardId;
use crate::wire::Ipv4Proto;

/// An on-drop action attached to a packet.
///
/// Deleters form a chain: [`Deleter::chain`] merges two chains into one, and
/// cloning shares the chain. Each action in a chain runs exactly once, when
/// the last clone referencing it drops.
#[derive(Clone, Default)]
pub struct Deleter(Option<Arc<DeleterNode>>);

struct DeleterNode {
    // Locked only by the final drop; the mutex exists to keep the node
    // shareable across shards.
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    held: Vec<Deleter>,
}

impl Drop for DeleterNode {
    fn drop(&mut self) {
        let Self { action, held: _ } = self;
        let action = action.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(f) = action {
            f();
        }
    }
}

impl Deleter {
    /// A deleter that does nothing.
    pub fn empty() -> Deleter {
        Deleter(None)
    }

    /// A deleter running `f` when its last clone drops.
    pub fn from_fn<F: FnOnce() + Send + 'static>(f: F) -> Deleter {
        Deleter(Some(Arc::new(DeleterNode {
            action: Mutex::new(Some(Box::new(f))),
            held: Vec::new(),
        })))
    }

    /// Merges two chains; the result keeps both alive.
    pub fn chain(self, other: Deleter) -> Deleter {
        match (self, other) {
            (Deleter(None), other) => other,
            (this, Deleter(None)) => this,
            (this, other) => Deleter(Some(Arc::new(DeleterNode {
                action: Mutex::new(None),
                held: vec![this, other],
            }))),
        }
    }
}

impl Debug for Deleter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Self(node) = self;
        f.debug_tuple("Deleter").field(&node.is_some()).finish()
    }
}

/// Per-packet offload descriptor.
///
/// Describes work the producer has delegated to hardware or already
/// performed, so downstream stages neither redo nor miss it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OffloadInfo {
    /// The IP header checksum field is zero and must be filled by hardware.
    pub needs_ip_csum: bool,
    /// The packet was assembled from verified fragments; receivers skip both
    /// the header checksum and reassembly.
    pub reassembled: bool,
    /// The L4 protocol, when known, for protocol-specific offloads.
    pub l4_proto: Option<Ipv4Proto>,
    /// The IP header length, when known.
    pub ip_hdr_len: u8,
    /// An 802.1Q tag to insert on transmit.
    pub vlan_tci: Option<u16>,
}

enum Storage {
    Unique(Vec<u8>),
    Shared(Arc<Vec<u8>>),
}

struct Frag {
    storage: Storage,
    off: usize,
    len: usize,
}

impl Frag {
    fn unique(data: Vec<u8>) -> Frag {
        let len = data.len();
        Frag { storage: Storage::Unique(data), off: 0, len }
    }

    fn bytes(&self) -> &[u8] {
        let Frag { storage, off, len } = self;
        let buf = match storage {
            Storage::Unique(v) => v.as_slice(),
            Storage::Shared(a) => a.as_slice(),
        };
        &buf[*off..*off + *len]
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        let Frag { storage, off, len } = self;
        match storage {
            Storage::Unique(v) => Some(&mut v[*off..*off + *len]),
            Storage::Shared(_) => None,
        }
    }

    fn freeze(&mut self) -> Arc<Vec<u8>> {
        let arc = match &mut self.storage {
            Storage::Shared(a) => return a.clone(),
            Storage::Unique(v) => Arc::new(mem::take(v)),
        };
        self.storage = Storage::Shared(arc.clone());
        arc
    }
}

impl Debug for Frag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Self { storage, off: _, len } = self;
        let shared = matches!(storage, Storage::Shared(_));
        f.debug_struct("Frag").field("len", len).field("shared", &shared).finish()
    }
}

/// A scatter-gather packet.
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct Packet {
    frags: Vec<Frag>,
    #[derivative(Debug = "ignore")]
    deleter: Deleter,
    offload: OffloadInfo,
}

impl Packet {
    /// Creates an empty packet.
    pub fn new() -> Packet {
        Packet::default()
    }

    /// Creates a packet owning `data` as its single fragment.
    pub fn from_vec(data: Vec<u8>) -> Packet {
        Packet { frags: vec![Frag::unique(data)], deleter: Deleter::empty(), offload: OffloadInfo::default() }
    }

    /// The packet length: the sum of its fragment lengths.
    pub fn len(&self) -> usize {
        self.frags.iter().map(|f| f.len).sum()
    }

    /// True if the packet holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of fragments.
    pub fn nr_frags(&self) -> usize {
        self.frags.len()
    }

    /// The bytes of fragment `i`.
    pub fn frag(&self, i: usize) -> &[u8] {
        self.frags[i].bytes()
    }

    /// Bytes accounted against memory watermarks for holding this packet:
    /// the payload plus a fixed per-packet overhead.
    pub fn memory(&self) -> usize {
        mem::size_of::<Packet>() + self.len()
    }

    /// The offload descriptor.
    pub fn offload_info(&self) -> OffloadInfo {
        self.offload
    }

    /// A mutable reference to the offload descriptor.
    pub fn offload_info_mut(&mut self) -> &mut OffloadInfo {
        &mut self.offload
    }

    /// Replaces the offload descriptor.
    pub fn set_offload_info(&mut self, offload: OffloadInfo) {
        self.offload = offload;
    }

    /// Attaches `deleter` to this packet's chain.
    pub fn add_deleter(&mut self, deleter: Deleter) {
        self.deleter = mem::take(&mut self.deleter).chain(deleter);
    }

    /// Rewraps the deleter chain so that, when this packet finally drops, the
    /// inner chain is handed to `submit` for execution on `shard`.
    ///
    /// Used when transferring a packet across shards: the backing storage
    /// must be freed on the shard that allocated it.
    pub fn free_on_shard<F>(&mut self, shard: ShardId, submit: F)
    where
        F: FnOnce(ShardId, Deleter) + Send + 'static,
    {
        let inner = mem::take(&mut self.deleter);
        self.deleter = Deleter::from_fn(move || submit(shard, inner));
    }

    fn locate(&self, offset: usize, size: usize) -> Option<(usize, usize)> {
        let mut start = 0;
        for (i, f) in self.frags.iter().enumerate() {
            if offset < start + f.len {
                return (offset + size <= start + f.len).then_some((i, offset - start));
            }
            start += f.len;
        }
        None
    }

    /// A typed view of the `size_of::<T>()` bytes at `offset`.
    ///
    /// Returns `None` when the bytes are out of range or straddle a fragment
    /// boundary; callers may [`linearize`](Packet::linearize) first.
    pub fn get_header<T: FromBytes + Unaligned>(&self, offset: usize) -> Option<&T> {
        let (i, within) = self.locate(offset, mem::size_of::<T>())?;
        T::ref_from(&self.frags[i].bytes()[within..within + mem::size_of::<T>()])
    }

    /// A mutable typed view of the `size_of::<T>()` bytes at `offset`.
    ///
    /// Additionally returns `None` when the covering fragment's storage is
    /// shared; [`linearize`](Packet::linearize) re-owns the span.
    pub fn get_header_mut<T: FromBytes + AsBytes + Unaligned>(
        &mut self,
        offset: usize,
    ) -> Option<&mut T> {
        let (i, within) = self.locate(offset, mem::size_of::<T>())?;
        let bytes = self.frags[i].bytes_mut()?;
        T::mut_from(&mut bytes[within..within + mem::size_of::<T>()])
    }

    /// Replaces the run of fragments covering `[at, at + size)` with a single
    /// freshly allocated fragment holding their concatenation.
    ///
    /// The replaced fragments' storage is released with the packet. After
    /// this call the span is contiguous and uniquely owned, so
    /// [`get_header`](Packet::get_header) and
    /// [`get_header_mut`](Packet::get_header_mut) over it succeed.
    ///
    /// # Panics
    ///
    /// Panics if `at + size > len()`.
    pub fn linearize(&mut self, at: usize, size: usize) {
        assert!(at + size <= self.len());
        if size == 0 {
            return;
        }
        let mut first = 0;
        let mut start = 0;
        while start + self.frags[first].len <= at {
            start += self.frags[first].len;
            first += 1;
        }
        let needed = at + size - start;
        let mut accum = 0;
        let mut last = first;
        while accum < needed {
            accum += self.frags[last].len;
            last += 1;
        }
        let mut buf = Vec::with_capacity(accum);
        for f in &self.frags[first..last] {
            buf.extend_from_slice(f.bytes());
        }
        let _: Vec<Frag> = self.frags.splice(first..last, [Frag::unique(buf)]).collect();
    }

    /// Prepends a zeroed header of type `T` as a new fragment at position 0
    /// and returns a mutable view of it.
    pub fn prepend_header<T: FromZeroes + FromBytes + AsBytes + Unaligned>(&mut self) -> &mut T {
        self.frags.insert(0, Frag::unique(vec![0; mem::size_of::<T>()]));
        let bytes = self.frags[0].bytes_mut().unwrap();
        T::mut_from(bytes).unwrap()
    }

    /// Like [`prepend_header`](Packet::prepend_header), but reports failure
    /// to allocate the header's storage instead of aborting.
    ///
    /// The egress fragmentation path goes through this so allocation
    /// pressure surfaces as an error on the datagram being sent.
    pub fn try_prepend_header<T: FromZeroes + FromBytes + AsBytes + Unaligned>(
        &mut self,
    ) -> Result<&mut T, AllocationError> {
        let size = mem::size_of::<T>();
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| AllocationError)?;
        buf.resize(size, 0);
        self.frags.insert(0, Frag::unique(buf));
        let bytes = self.frags[0].bytes_mut().unwrap();
        Ok(T::mut_from(bytes).unwrap())
    }

    /// Drops the first `n` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n > len()`.
    pub fn trim_front(&mut self, mut n: usize) {
        assert!(n <= self.len());
        while n > 0 {
            let f = &mut self.frags[0];
            if n < f.len {
                f.off += n;
                f.len -= n;
                break;
            }
            n -= f.len;
            let _: Frag = self.frags.remove(0);
        }
    }

    /// Drops the last `n` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n > len()`.
    pub fn trim_back(&mut self, mut n: usize) {
        assert!(n <= self.len());
        while n > 0 {
            let f = self.frags.last_mut().unwrap();
            if n < f.len {
                f.len -= n;
                break;
            }
            n -= f.len;
            let _: Option<Frag> = self.frags.pop();
        }
    }

    /// Returns a new packet aliasing `len` bytes of this packet's storage
    /// starting at `offset`, without copying payload.
    ///
    /// Storage touched by the window is frozen into shared ownership; the
    /// new packet also shares this packet's deleter chain, so the backing
    /// bytes outlive whichever packet drops first.
    ///
    /// # Panics
    ///
    /// Panics if `offset + len > len()`.
    pub fn share(&mut self, offset: usize, len: usize) -> Packet {
        assert!(offset + len <= self.len());
        let mut frags = Vec::new();
        let mut skip = offset;
        let mut want = len;
        for frag in &mut self.frags {
            if want == 0 {
                break;
            }
            if skip >= frag.len {
                skip -= frag.len;
                continue;
            }
            let arc = frag.freeze();
            let take = (frag.len - skip).min(want);
            frags.push(Frag { storage: Storage::Shared(arc), off: frag.off + skip, len: take });
            skip = 0;
            want -= take;
        }
        Packet { frags, deleter: self.deleter.clone(), offload: OffloadInfo::default() }
    }

    /// Appends `other`'s fragments, merging the deleter chains. `other`'s
    /// offload descriptor is discarded.
    pub fn append(&mut self, other: Packet) {
        let Packet { frags, deleter, offload: _ } = other;
        self.frags.extend(frags);
        self.deleter = mem::take(&mut self.deleter).chain(deleter);
    }

    /// Copies the packet out into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for f in &self.frags {
            out.extend_from_slice(f.bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::wire::{EthernetHeader, Ipv4Header, ETH_HDR_LEN, IPV4_HDR_LEN};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 251) as u8).collect()
    }

    #[test]
    fn share_aliases_window() {
        let data = pattern(100);
        let mut p = Packet::from_vec(data.clone());
        let whole = p.share(0, 100);
        assert_eq!(whole.to_vec(), data);
        let window = p.share(17, 41);
        assert_eq!(window.len(), 41);
        assert_eq!(window.to_vec(), data[17..58]);
        // The original still reads the same bytes through shared storage.
        assert_eq!(p.to_vec(), data);
    }

    #[test]
    fn share_spans_fragments() {
        let mut p = Packet::from_vec(pattern(10));
        p.append(Packet::from_vec(pattern(10)));
        let all = p.to_vec();
        let w = p.share(5, 10);
        assert_eq!(w.nr_frags(), 2);
        assert_eq!(w.to_vec(), all[5..15]);
    }

    #[test]
    fn prepend_header_grows_front() {
        let mut p = Packet::from_vec(pattern(30));
        let old_len = p.len();
        {
            let eth = p.prepend_header::<EthernetHeader>();
            eth.init(
                net_types::ethernet::Mac::new([1; 6]),
                net_types::ethernet::Mac::new([2; 6]),
                crate::wire::ETHERTYPE_IPV4,
            );
        }
        assert_eq!(p.len(), old_len + ETH_HDR_LEN);
        assert_eq!(p.frag(0).len(), ETH_HDR_LEN);
        assert_eq!(&p.to_vec()[ETH_HDR_LEN..], &pattern(30)[..]);
    }

    #[test]
    fn try_prepend_header_grows_front() {
        let mut p = Packet::from_vec(pattern(30));
        let old_len = p.len();
        assert!(p.try_prepend_header::<Ipv4Header>().is_ok());
        assert_eq!(p.len(), old_len + IPV4_HDR_LEN);
        assert_eq!(p.frag(0).len(), IPV4_HDR_LEN);
        assert!(p.frag(0).iter().all(|&b| b == 0));
    }

    #[test]
    fn trim_front_and_back() {
        let mut p = Packet::from_vec(pattern(8));
        p.append(Packet::from_vec(pattern(8)));
        p.trim_front(10);
        assert_eq!(p.len(), 6);
        assert_eq!(p.nr_frags(), 1);
        p.trim_back(3);
        assert_eq!(p.to_vec(), pattern(8)[2..5]);
    }

    #[test]
    fn get_header_straddle_then_linearize() {
        let mut p = Packet::from_vec(pattern(10));
        p.append(Packet::from_vec(pattern(30)));
        // 20 bytes at offset 4 straddle the fragment boundary.
        assert!(p.get_header::<Ipv4Header>(4).is_none());
        let before = p.to_vec();
        p.linearize(4, IPV4_HDR_LEN);
        assert!(p.get_header::<Ipv4Header>(4).is_some());
        assert_eq!(p.to_vec(), before);
    }

    #[test]
    fn get_header_mut_requires_unique() {
        let mut p = Packet::from_vec(pattern(40));
        assert!(p.get_header_mut::<Ipv4Header>(0).is_some());
        let _shared = p.share(0, 40);
        assert!(p.get_header_mut::<Ipv4Header>(0).is_none());
        p.linearize(0, IPV4_HDR_LEN);
        assert!(p.get_header_mut::<Ipv4Header>(0).is_some());
    }

    #[test]
    fn append_concatenates() {
        let mut p = Packet::from_vec(pattern(5));
        let q = Packet::from_vec(pattern(7));
        let mut expected = pattern(5);
        expected.extend_from_slice(&pattern(7));
        p.append(q);
        assert_eq!(p.nr_frags(), 2);
        assert_eq!(p.to_vec(), expected);
    }

    #[test]
    fn deleter_runs_once_after_last_reference() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut p = Packet::from_vec(pattern(16));
        let counted = runs.clone();
        p.add_deleter(Deleter::from_fn(move || {
            let _: usize = counted.fetch_add(1, Ordering::SeqCst);
        }));
        let shared = p.share(0, 16);
        drop(p);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        drop(shared);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn chained_deleters_each_run_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut p = Packet::from_vec(pattern(4));
        for _ in 0..3 {
            let counted = runs.clone();
            p.add_deleter(Deleter::from_fn(move || {
                let _: usize = counted.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let mut q = Packet::from_vec(pattern(4));
        q.append(p);
        drop(q);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn free_on_shard_reroutes_deleter() {
        let freed_on = Arc::new(AtomicUsize::new(usize::MAX));
        let runs = Arc::new(AtomicUsize::new(0));
        let mut p = Packet::from_vec(pattern(16));
        let counted = runs.clone();
        p.add_deleter(Deleter::from_fn(move || {
            let _: usize = counted.fetch_add(1, Ordering::SeqCst);
        }));
        let recorded = freed_on.clone();
        p.free_on_shard(ShardId(2), move |shard, inner| {
            recorded.store(usize::from(shard.0), Ordering::SeqCst);
            // The submitting shard runs the inner chain.
            drop(inner);
        });
        drop(p);
        assert_eq!(freed_on.load(Ordering::SeqCst), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn memory_tracks_length() {
        let p = Packet::from_vec(pattern(600));
        assert_eq!(p.memory(), mem::size_of::<Packet>() + 600);
    }
}
