//! MTU-adaptive fragmentation and in-flight reassembly.
//!
//! Fragments carry a five byte header: magic, 16-bit packet id, sequence
//! number and flag bits marking the first fragment and whether more
//! follow. Reassembly state is dropped after a timeout or when the
//! pending table overflows, oldest first.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const FRAG_MAGIC: u8 = 0xF3;
pub const FRAG_HEADER_SIZE: usize = 5;
pub const FLAG_MORE_FRAGMENTS: u8 = 0x01;
pub const FLAG_FIRST_FRAGMENT: u8 = 0x02;
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_PENDING_PACKETS: usize = 64;
const MAX_FRAGMENTS: usize = 255;

/// Splits oversized payloads; the packet id counter is shared by every
/// transmit path of the session and wraps modulo 2^16.
#[derive(Default)]
pub struct Fragmenter {
    next_packet_id: AtomicU16,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn needs_fragmentation(&self, data_size: usize, max_payload: usize) -> bool {
        max_payload > FRAG_HEADER_SIZE && data_size > max_payload - FRAG_HEADER_SIZE
    }

    /// Split `data` into fragments of at most `max_payload` bytes each.
    /// Data beyond 255 fragments is dropped.
    pub fn fragment(&self, data: &[u8], max_payload: usize) -> Vec<Vec<u8>> {
        if max_payload <= FRAG_HEADER_SIZE {
            return Vec::new();
        }
        let per_fragment = max_payload - FRAG_HEADER_SIZE;
        let count = data.len().div_ceil(per_fragment).min(MAX_FRAGMENTS);
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);

        let mut fragments = Vec::with_capacity(count);
        for seq in 0..count {
            let start = seq * per_fragment;
            let end = (start + per_fragment).min(data.len());
            let mut flags = 0u8;
            if seq == 0 {
                flags |= FLAG_FIRST_FRAGMENT;
            }
            if seq < count - 1 {
                flags |= FLAG_MORE_FRAGMENTS;
            }
            let mut frag = Vec::with_capacity(FRAG_HEADER_SIZE + end - start);
            frag.push(FRAG_MAGIC);
            frag.push((packet_id >> 8) as u8);
            frag.push(packet_id as u8);
            frag.push(seq as u8);
            frag.push(flags);
            frag.extend_from_slice(&data[start..end]);
            fragments.push(frag);
        }
        fragments
    }
}

struct PendingPacket {
    fragments: BTreeMap<u8, Vec<u8>>,
    first_seen: Instant,
    last_seq: u8,
    has_first: bool,
    has_last: bool,
}

impl PendingPacket {
    fn new(now: Instant) -> Self {
        Self {
            fragments: BTreeMap::new(),
            first_seen: now,
            last_seq: 0,
            has_first: false,
            has_last: false,
        }
    }

    fn complete(&self) -> bool {
        self.has_first
            && self.has_last
            && (0..=self.last_seq).all(|s| self.fragments.contains_key(&s))
    }
}

/// Reassembles fragments keyed by packet id. Stale and overflowing
/// entries are evicted lazily on every call.
#[derive(Default)]
pub struct Reassembler {
    pending: Mutex<HashMap<u16, PendingPacket>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fragment(&self, data: &[u8]) -> bool {
        data.len() >= FRAG_HEADER_SIZE && data[0] == FRAG_MAGIC
    }

    /// Feed one received fragment; returns the reassembled payload once
    /// every piece has arrived.
    pub fn process(&self, fragment: &[u8]) -> Option<Vec<u8>> {
        self.process_at(fragment, Instant::now())
    }

    fn process_at(&self, fragment: &[u8], now: Instant) -> Option<Vec<u8>> {
        if fragment.len() < FRAG_HEADER_SIZE || fragment[0] != FRAG_MAGIC {
            return None;
        }
        let packet_id = ((fragment[1] as u16) << 8) | fragment[2] as u16;
        let seq = fragment[3];
        let flags = fragment[4];
        let payload = fragment[FRAG_HEADER_SIZE..].to_vec();

        let mut pending = self.pending.lock().expect("reassembly table poisoned");
        Self::cleanup(&mut pending, now);

        let packet = pending
            .entry(packet_id)
            .or_insert_with(|| PendingPacket::new(now));
        packet.fragments.insert(seq, payload);
        if flags & FLAG_FIRST_FRAGMENT != 0 {
            packet.has_first = true;
        }
        if flags & FLAG_MORE_FRAGMENTS == 0 {
            packet.last_seq = seq;
            packet.has_last = true;
        }

        if packet.complete() {
            let packet = pending.remove(&packet_id).expect("entry vanished");
            let mut reassembled = Vec::new();
            for (_, part) in packet.fragments {
                reassembled.extend_from_slice(&part);
            }
            log::debug!(
                "reassembled packet {:#06x}, {} bytes",
                packet_id,
                reassembled.len()
            );
            return Some(reassembled);
        }
        None
    }

    pub fn reset(&self) {
        self.pending
            .lock()
            .expect("reassembly table poisoned")
            .clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("reassembly table poisoned").len()
    }

    fn cleanup(pending: &mut HashMap<u16, PendingPacket>, now: Instant) {
        pending.retain(|_, p| now.duration_since(p.first_seen) <= REASSEMBLY_TIMEOUT);
        while pending.len() > MAX_PENDING_PACKETS {
            let oldest = pending
                .iter()
                .min_by_key(|(_, p)| p.first_seen)
                .map(|(&id, _)| id);
            match oldest {
                Some(id) => {
                    pending.remove(&id);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_a_single_fragment_candidate() {
        let fragmenter = Fragmenter::new();
        assert!(!fragmenter.needs_fragmentation(100, 256));
        assert!(fragmenter.needs_fragmentation(300, 256));
    }

    #[test]
    fn nine_fragment_transfer() {
        // 2048 bytes at 256 byte payload: nine fragments, flags on the
        // first and last.
        let fragmenter = Fragmenter::new();
        let data = vec![0x55u8; 2048];
        let fragments = fragmenter.fragment(&data, 256);
        assert_eq!(fragments.len(), 9);
        assert_eq!(fragments[0][4] & FLAG_FIRST_FRAGMENT, FLAG_FIRST_FRAGMENT);
        assert_eq!(fragments[0][4] & FLAG_MORE_FRAGMENTS, FLAG_MORE_FRAGMENTS);
        assert_eq!(fragments[8][4] & FLAG_MORE_FRAGMENTS, 0);
        for (i, frag) in fragments.iter().enumerate() {
            assert_eq!(frag[0], FRAG_MAGIC);
            assert_eq!(frag[3], i as u8);
        }
    }

    #[test]
    fn reverse_order_reassembly() {
        let fragmenter = Fragmenter::new();
        let data: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        let mut fragments = fragmenter.fragment(&data, 256);
        fragments.reverse();

        let reassembler = Reassembler::new();
        let mut result = None;
        for frag in &fragments {
            if let Some(out) = reassembler.process(frag) {
                result = Some(out);
            }
        }
        assert_eq!(result.expect("no reassembly"), data);
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn packet_ids_increment_and_wrap() {
        let fragmenter = Fragmenter::new();
        fragmenter.next_packet_id.store(0xFFFF, Ordering::Relaxed);
        let a = fragmenter.fragment(&[0u8; 600], 256);
        let b = fragmenter.fragment(&[0u8; 600], 256);
        let id_a = ((a[0][1] as u16) << 8) | a[0][2] as u16;
        let id_b = ((b[0][1] as u16) << 8) | b[0][2] as u16;
        assert_eq!(id_a, 0xFFFF);
        assert_eq!(id_b, 0);
    }

    #[test]
    fn stale_entries_expire() {
        let reassembler = Reassembler::new();
        let frag = [FRAG_MAGIC, 0, 1, 0, FLAG_FIRST_FRAGMENT | FLAG_MORE_FRAGMENTS, 1, 2];
        let start = Instant::now();
        assert!(reassembler.process_at(&frag, start).is_none());
        assert_eq!(reassembler.pending_count(), 1);

        // A fragment of another packet arriving after the timeout sweeps
        // the stale entry.
        let other = [FRAG_MAGIC, 0, 2, 0, FLAG_FIRST_FRAGMENT | FLAG_MORE_FRAGMENTS, 3];
        let later = start + REASSEMBLY_TIMEOUT + Duration::from_secs(1);
        assert!(reassembler.process_at(&other, later).is_none());
        assert_eq!(reassembler.pending_count(), 1);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let reassembler = Reassembler::new();
        let start = Instant::now();
        for id in 0..=MAX_PENDING_PACKETS as u16 {
            let frag = [
                FRAG_MAGIC,
                (id >> 8) as u8,
                id as u8,
                0,
                FLAG_FIRST_FRAGMENT | FLAG_MORE_FRAGMENTS,
                9,
            ];
            let now = start + Duration::from_millis(id as u64);
            assert!(reassembler.process_at(&frag, now).is_none());
        }
        // Eviction is lazy: the next call sweeps the table back to the cap.
        assert_eq!(reassembler.pending_count(), MAX_PENDING_PACKETS + 1);
        // Packet 0 was the oldest; by the time its tail arrives the head
        // has been evicted, so the packet never completes.
        let tail = [FRAG_MAGIC, 0, 0, 1, 0, 10];
        let now = start + Duration::from_secs(1);
        assert!(reassembler.process_at(&tail, now).is_none());
    }

    #[test]
    fn non_fragment_is_not_consumed() {
        let reassembler = Reassembler::new();
        assert!(!reassembler.is_fragment(b"plain payload"));
        assert!(reassembler.process(b"plain payload").is_none());
        assert_eq!(reassembler.pending_count(), 0);
    }
}
