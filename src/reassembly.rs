// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fragment reassembly under bounded memory.
//!
//! Each in-progress datagram is a [`ReassemblyEntry`]: the IP header taken
//! from the offset-0 fragment plus a gap map — an ordered mapping from byte
//! offset to a payload run. Inserting a fragment coalesces it with adjacent
//! runs; a datagram is complete when the last fragment has been seen and the
//! map holds a single run starting at offset 0.
//!
//! The cache evicts along two axes: entries older than the fragment timeout
//! (swept from the front of an age-ordered list, which is monotonic in
//! arrival time), and oldest-first when accounted memory crosses the high
//! watermark. Both evictions are silent; the owning engine counts them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use net_types::ip::Ipv4Addr;
use tracing::trace;

use crate::packet::Packet;
use crate::time::Instant;

/// Identifies all fragments of a single datagram.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FragmentId {
    /// The source address.
    pub src_ip: Ipv4Addr,
    /// The destination address.
    pub dst_ip: Ipv4Addr,
    /// The identification field.
    pub ident: u16,
    /// The protocol number.
    pub proto: u8,
}

/// How long an incomplete entry may wait for its missing fragments.
pub const FRAG_TIMEOUT: Duration = Duration::from_secs(30);
/// Memory-pressure eviction stops once accounted memory is back under this.
pub const FRAG_MEM_LOW: usize = 3 << 20;
/// Memory-pressure eviction starts when accounted memory exceeds this.
pub const FRAG_MEM_HIGH: usize = 4 << 20;

/// One in-progress datagram.
#[derive(Debug, Default)]
pub struct ReassemblyEntry {
    header: Packet,
    gaps: BTreeMap<u16, Packet>,
    last_frag_received: bool,
    mem_size: usize,
}

impl ReassemblyEntry {
    /// Merges one fragment into the entry.
    ///
    /// The offset-0 fragment donates the stored header view. The payload
    /// (the packet minus its `ip_hdr_len`-byte header) is inserted into the
    /// gap map at `offset`, coalescing with adjacent runs; where the new
    /// bytes overlap existing ones, the existing bytes win.
    ///
    /// Returns the change in accounted memory.
    pub fn merge(&mut self, ip_hdr_len: usize, offset: u16, mut p: Packet) -> isize {
        let old = self.mem_size as isize;
        if offset == 0 {
            self.header = p.share(0, ip_hdr_len);
        }
        p.trim_front(ip_hdr_len);
        gap_insert(&mut self.gaps, offset, p);
        self.mem_size =
            self.header.memory() + self.gaps.values().map(Packet::memory).sum::<usize>();
        self.mem_size as isize - old
    }

    /// True when every byte of the datagram has arrived: the last fragment
    /// was seen and the gap map coalesced to one run at offset 0.
    pub fn is_complete(&self) -> bool {
        let Self { header: _, gaps, last_frag_received, mem_size: _ } = self;
        *last_frag_received
            && gaps.len() == 1
            && gaps.keys().next().copied() == Some(0)
    }

    /// Bytes this entry holds against the memory watermarks.
    pub fn mem_size(&self) -> usize {
        self.mem_size
    }

    fn into_datagram(mut self) -> ReassembledDatagram {
        let data = self.gaps.remove(&0).unwrap();
        ReassembledDatagram { header: self.header, data }
    }
}

/// A completed reassembly: the stored IP header and the contiguous payload.
#[derive(Debug)]
pub struct ReassembledDatagram {
    /// The IP header from the offset-0 fragment (still `header_len` bytes of
    /// shared storage).
    pub header: Packet,
    /// The reassembled IP payload.
    pub data: Packet,
}

// Inserts `p` covering `[offset, offset + p.len())` into the gap map.
//
// Existing bytes win every overlap: the new packet is trimmed against the
// run preceding it, then contributes only the uncovered slices between and
// beyond existing runs. A final pass fuses adjacent runs, so any complete
// cover collapses to a single entry regardless of arrival order.
fn gap_insert(map: &mut BTreeMap<u16, Packet>, offset: u16, p: Packet) {
    let mut off = u32::from(offset);
    let mut p = p;
    if p.is_empty() {
        return;
    }
    if let Some((&prev_start, prev)) = map.range(..=offset).next_back() {
        let prev_end = u32::from(prev_start) + prev.len() as u32;
        if prev_end >= off + p.len() as u32 {
            return;
        }
        if prev_end > off {
            p.trim_front((prev_end - off) as usize);
            off = prev_end;
        }
    }
    loop {
        let next = map.range(off as u16..).next().map(|(&k, v)| (u32::from(k), v.len() as u32));
        let end = off + p.len() as u32;
        match next {
            Some((next_start, next_len)) if end > next_start => {
                let head_len = (next_start - off) as usize;
                if head_len > 0 {
                    let head = p.share(0, head_len);
                    let _: Option<Packet> = map.insert(off as u16, head);
                }
                let next_end = next_start + next_len;
                if end <= next_end {
                    break;
                }
                p.trim_front((next_end - off) as usize);
                off = next_end;
            }
            _ => {
                let _: Option<Packet> = map.insert(off as u16, p);
                break;
            }
        }
    }
    coalesce(map);
}

// Fuses adjacent runs. After `gap_insert`'s slicing there are no overlaps
// left, only gaps and exact adjacency.
fn coalesce(map: &mut BTreeMap<u16, Packet>) {
    let mut merged = BTreeMap::new();
    let mut cur: Option<(u16, Packet)> = None;
    for (start, run) in std::mem::take(map) {
        cur = Some(match cur {
            None => (start, run),
            Some((cur_start, mut cur_run)) => {
                if u32::from(cur_start) + cur_run.len() as u32 == u32::from(start) {
                    cur_run.append(run);
                    (cur_start, cur_run)
                } else {
                    let _: Option<Packet> = merged.insert(cur_start, cur_run);
                    (start, run)
                }
            }
        });
    }
    if let Some((start, run)) = cur {
        let _: Option<Packet> = merged.insert(start, run);
    }
    *map = merged;
}

struct CacheSlot<I> {
    entry: ReassemblyEntry,
    rx_time: I,
}

/// The outcome of [`FragmentCache::add_fragment`].
#[derive(Debug)]
pub enum AddFragmentOutcome {
    /// The datagram is complete; the entry has been removed.
    Complete(ReassembledDatagram),
    /// More fragments are needed; the caller should ensure the expiry timer
    /// is armed.
    Incomplete,
}

/// The result of [`FragmentCache::add_fragment`].
#[derive(Debug)]
pub struct AddFragmentResult {
    /// Completion state of the fragment's datagram.
    pub outcome: AddFragmentOutcome,
    /// Entries evicted by memory pressure while absorbing this fragment.
    pub memory_evictions: u64,
}

/// The result of a [`FragmentCache::on_timer`] sweep.
#[derive(Debug, PartialEq, Eq)]
pub struct TimerSweep<I> {
    /// Entries evicted because they outlived the fragment timeout.
    pub expired: u64,
    /// When to fire the next sweep, if entries remain.
    pub rearm_at: Option<I>,
}

/// The per-shard fragment store.
pub struct FragmentCache<I> {
    entries: HashMap<FragmentId, CacheSlot<I>>,
    // Ids in first-fragment arrival order; monotonic in `rx_time`.
    age: VecDeque<FragmentId>,
    total_mem: usize,
    timeout: Duration,
    mem_low: usize,
    mem_high: usize,
}

impl<I: Instant> FragmentCache<I> {
    /// Creates a cache with the given timeout and watermarks.
    pub fn new(timeout: Duration, mem_low: usize, mem_high: usize) -> FragmentCache<I> {
        FragmentCache {
            entries: HashMap::new(),
            age: VecDeque::new(),
            total_mem: 0,
            timeout,
            mem_low,
            mem_high,
        }
    }

    /// True if no reassembly is in progress.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently accounted against the watermarks.
    pub fn total_mem(&self) -> usize {
        self.total_mem
    }

    /// Absorbs one fragment of datagram `id`.
    ///
    /// `p` is the full IP packet (header included, already length-normalized
    /// by the engine); `ip_hdr_len` its header length, `offset` its fragment
    /// offset in bytes, and `last` whether its more-fragments flag was
    /// clear.
    pub fn add_fragment(
        &mut self,
        now: I,
        id: FragmentId,
        p: Packet,
        ip_hdr_len: usize,
        offset: u16,
        last: bool,
    ) -> AddFragmentResult {
        let slot = self.entries.entry(id).or_insert_with(|| {
            self.age.push_back(id);
            CacheSlot { entry: ReassemblyEntry::default(), rx_time: now }
        });
        let delta = slot.entry.merge(ip_hdr_len, offset, p);
        if last {
            slot.entry.last_frag_received = true;
        }
        self.total_mem = add_signed(self.total_mem, delta);

        let outcome = if slot.entry.is_complete() {
            let CacheSlot { entry, rx_time: _ } = self.entries.remove(&id).unwrap();
            self.age.retain(|other| *other != id);
            self.total_mem -= entry.mem_size;
            AddFragmentOutcome::Complete(entry.into_datagram())
        } else {
            AddFragmentOutcome::Incomplete
        };
        let memory_evictions = self.enforce_memory_pressure();
        AddFragmentResult { outcome, memory_evictions }
    }

    /// Evicts oldest-first until accounted memory is back under the low
    /// watermark, if it crossed the high one. Returns the eviction count.
    pub fn enforce_memory_pressure(&mut self) -> u64 {
        if self.total_mem <= self.mem_high {
            return 0;
        }
        let mut evicted = 0;
        while self.total_mem > self.mem_low {
            let Some(id) = self.age.pop_front() else { break };
            self.drop_entry(id);
            evicted += 1;
        }
        evicted
    }

    /// Sweeps expired entries from the front of the age list.
    pub fn on_timer(&mut self, now: I) -> TimerSweep<I> {
        let mut expired = 0;
        while let Some(id) = self.age.front().copied() {
            let slot = self.entries.get(&id).unwrap();
            if now.saturating_duration_since(slot.rx_time) > self.timeout {
                let _: Option<FragmentId> = self.age.pop_front();
                self.drop_entry(id);
                expired += 1;
            } else {
                // Entries further back can only be younger.
                break;
            }
        }
        let rearm_at = (!self.entries.is_empty()).then(|| now.add(self.timeout));
        TimerSweep { expired, rearm_at }
    }

    fn drop_entry(&mut self, id: FragmentId) {
        if let Some(CacheSlot { entry, rx_time: _ }) = self.entries.remove(&id) {
            trace!(?id, mem = entry.mem_size, "evicting reassembly entry");
            self.total_mem -= entry.mem_size;
        }
    }
}

fn add_signed(value: usize, delta: isize) -> usize {
    if delta >= 0 {
        value + delta as usize
    } else {
        value - delta.unsigned_abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use test_case::test_case;

    use crate::time::testutil::FakeInstant;
    use crate::wire::IPV4_HDR_LEN;

    const HDR: usize = IPV4_HDR_LEN;

    fn id() -> FragmentId {
        FragmentId {
            src_ip: Ipv4Addr::new([10, 0, 0, 1]),
            dst_ip: Ipv4Addr::new([10, 0, 0, 2]),
            ident: 42,
            proto: 17,
        }
    }

    // A fake IP fragment: HDR bytes of header then payload[offset..offset+len].
    fn frag(payload: &[u8], offset: usize, len: usize) -> Packet {
        let mut bytes = vec![0xEE; HDR];
        bytes.extend_from_slice(&payload[offset..offset + len]);
        Packet::from_vec(bytes)
    }

    fn payload(total: usize) -> Vec<u8> {
        (0..total).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn cache() -> FragmentCache<FakeInstant> {
        FragmentCache::new(FRAG_TIMEOUT, FRAG_MEM_LOW, FRAG_MEM_HIGH)
    }

    #[test_case(&[(0, 500, false), (500, 500, true)]; "in order")]
    #[test_case(&[(500, 500, true), (0, 500, false)]; "reversed")]
    #[test_case(&[(1000, 200, true), (0, 500, false), (500, 500, false)]; "three reversed first")]
    #[test_case(&[(500, 500, false), (1000, 200, true), (0, 500, false)]; "last in middle")]
    fn completes_in_any_order(order: &[(usize, usize, bool)]) {
        let total = order.iter().map(|(off, len, _)| off + len).max().unwrap();
        let data = payload(total);
        let mut entry = ReassemblyEntry::default();
        for (i, &(off, len, last)) in order.iter().enumerate() {
            let _: isize = entry.merge(HDR, off as u16, frag(&data, off, len));
            if last {
                entry.last_frag_received = true;
            }
            if i + 1 < order.len() {
                assert!(!entry.is_complete());
            }
        }
        assert!(entry.is_complete());
        let datagram = entry.into_datagram();
        assert_eq!(datagram.data.to_vec(), data);
        assert_eq!(datagram.header.len(), HDR);
    }

    #[test]
    fn completes_under_shuffled_arrival() {
        use rand::rngs::StdRng;
        use rand::seq::SliceRandom as _;
        use rand::SeedableRng as _;

        let mut rng = StdRng::seed_from_u64(0x8ba5);
        let total = 4000;
        let data = payload(total);
        // 8-byte-aligned pieces covering [0, total), shuffled each round.
        let mut pieces: Vec<(usize, usize)> =
            (0..total).step_by(496).map(|off| (off, 496.min(total - off))).collect();
        for _ in 0..16 {
            pieces.shuffle(&mut rng);
            let mut entry = ReassemblyEntry::default();
            for &(off, len) in &pieces {
                let _: isize = entry.merge(HDR, off as u16, frag(&data, off, len));
            }
            entry.last_frag_received = true;
            assert!(entry.is_complete());
            assert_eq!(entry.into_datagram().data.to_vec(), data);
        }
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let data = payload(1000);
        let mut entry = ReassemblyEntry::default();
        let _: isize = entry.merge(HDR, 0, frag(&data, 0, 500));
        let before = entry.mem_size();
        let _: isize = entry.merge(HDR, 0, frag(&data, 0, 500));
        assert_eq!(entry.mem_size(), before);
        let _: isize = entry.merge(HDR, 500, frag(&data, 500, 500));
        entry.last_frag_received = true;
        assert!(entry.is_complete());
        assert_eq!(entry.into_datagram().data.to_vec(), data);
    }

    #[test]
    fn overlap_first_writer_wins() {
        let total = 120;
        let first = vec![0xAA; total];
        let second = vec![0xBB; total];
        let mut entry = ReassemblyEntry::default();
        // [40, 80) arrives first with AA, then [0, 120) with BB: the AA run
        // must survive inside the overlap.
        let _: isize = entry.merge(HDR, 40, frag(&first, 40, 40));
        let _: isize = entry.merge(HDR, 0, frag(&second, 0, 120));
        entry.last_frag_received = true;
        assert!(entry.is_complete());
        let got = entry.into_datagram().data.to_vec();
        assert_eq!(&got[..40], &second[..40]);
        assert_eq!(&got[40..80], &first[40..80]);
        assert_eq!(&got[80..], &second[80..]);
    }

    #[test]
    fn overlap_spanning_multiple_runs() {
        let data = payload(300);
        let mut entry = ReassemblyEntry::default();
        let _: isize = entry.merge(HDR, 50, frag(&data, 50, 50));
        let _: isize = entry.merge(HDR, 150, frag(&data, 150, 50));
        // One insert covering everything, overlapping both existing runs.
        let _: isize = entry.merge(HDR, 0, frag(&data, 0, 300));
        entry.last_frag_received = true;
        assert!(entry.is_complete());
        assert_eq!(entry.into_datagram().data.to_vec(), data);
    }

    #[test]
    fn mem_size_matches_held_packets() {
        let data = payload(1500);
        let mut entry = ReassemblyEntry::default();
        let _: isize = entry.merge(HDR, 0, frag(&data, 0, 500));
        let _: isize = entry.merge(HDR, 1000, frag(&data, 1000, 500));
        let expected = entry.header.memory()
            + entry.gaps.values().map(Packet::memory).sum::<usize>();
        assert_eq!(entry.mem_size(), expected);
    }

    #[test]
    fn cache_completes_and_clears_accounting() {
        let mut c = cache();
        let data = payload(1000);
        let now = FakeInstant::default();
        let r = c.add_fragment(now, id(), frag(&data, 500, 500), HDR, 500, true);
        assert_matches!(r.outcome, AddFragmentOutcome::Incomplete);
        assert!(c.total_mem() > 0);
        let r = c.add_fragment(now, id(), frag(&data, 0, 500), HDR, 0, false);
        let datagram = assert_matches!(r.outcome, AddFragmentOutcome::Complete(d) => d);
        assert_eq!(datagram.data.to_vec(), data);
        assert!(c.is_empty());
        assert_eq!(c.total_mem(), 0);
    }

    #[test]
    fn timeout_evicts_stale_entries_only() {
        let mut c = cache();
        let data = payload(1000);
        let t0 = FakeInstant::default();
        let _ = c.add_fragment(t0, id(), frag(&data, 0, 500), HDR, 0, false);
        let late = FragmentId { ident: 43, ..id() };
        let t1 = t0.add(Duration::from_secs(20));
        let _ = c.add_fragment(t1, late, frag(&data, 0, 500), HDR, 0, false);

        // 31s after t0: the first entry expires, the second does not.
        let sweep = c.on_timer(t0.add(Duration::from_secs(31)));
        assert_eq!(sweep.expired, 1);
        assert!(sweep.rearm_at.is_some());
        assert!(!c.is_empty());

        let sweep = c.on_timer(t1.add(Duration::from_secs(31)));
        assert_eq!(sweep.expired, 1);
        assert_eq!(sweep.rearm_at, None);
        assert_eq!(c.total_mem(), 0);
    }

    #[test]
    fn memory_pressure_evicts_oldest_first() {
        // Small watermarks: three 600-byte first fragments overflow after
        // the second insert and again after the third.
        let mut c: FragmentCache<FakeInstant> = FragmentCache::new(FRAG_TIMEOUT, 512, 1024);
        let data = payload(4096);
        let now = FakeInstant::default();
        let ids: Vec<FragmentId> =
            (0..3).map(|i| FragmentId { ident: i, ..id() }).collect();

        let r = c.add_fragment(now, ids[0], frag(&data, 0, 600), HDR, 0, false);
        assert_eq!(r.memory_evictions, 0);
        let r = c.add_fragment(now, ids[1], frag(&data, 0, 600), HDR, 0, false);
        // A and B together exceed 1024; eviction drains from the front
        // until under 512, which removes both.
        assert_eq!(r.memory_evictions, 2);
        assert_eq!(c.total_mem(), 0);
        let r = c.add_fragment(now, ids[2], frag(&data, 0, 600), HDR, 0, false);
        assert_eq!(r.memory_evictions, 0);
        assert!(!c.is_empty());
        // Only C remains.
        assert!(c.entries.contains_key(&ids[2]));
        assert_eq!(c.entries.len(), 1);
    }
}
