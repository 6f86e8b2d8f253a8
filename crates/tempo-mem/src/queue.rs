use tracing::debug;

use crate::packet::Packet;
use crate::Enqueue;

/// Bookkeeping counters kept by the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Total submissions (merged or enqueued).
    pub access: u64,
    /// Submissions coalesced into an existing entry.
    pub merged: u64,
    /// Submissions enqueued as fresh entries.
    pub to_cache: u64,
    /// Submissions rejected because the queue was full.
    pub full: u64,
}

/// Bounded FIFO of pending translation requests with duplicate coalescing.
///
/// A submission whose (virtual page, ASID) key matches an entry already in
/// the queue is merged into it instead of occupying a second slot: origin
/// flags are OR-ed, the ROB dependency sets are unioned, and the entry keeps
/// the `instr_id` of its first arrival.
#[derive(Debug)]
pub struct TranslationQueue {
    entries: Vec<Option<Packet>>,
    head: usize,
    tail: usize,
    occupancy: usize,
    stats: QueueStats,
}

impl TranslationQueue {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "queue size must be nonzero");
        Self {
            entries: vec![None; size],
            head: 0,
            tail: 0,
            occupancy: 0,
            stats: QueueStats::default(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.occupancy == 0
    }

    #[inline]
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Index of the live entry matching the packet's (vpn, asid) key.
    fn position_of(&self, packet: &Packet) -> Option<usize> {
        self.entries.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|e| e.address == packet.address && e.asid == packet.asid)
        })
    }

    /// Submit a request: coalesce into a matching in-flight entry, report
    /// [`Enqueue::Full`], or append at the tail.
    pub fn add(&mut self, packet: Packet) -> Enqueue {
        assert!(packet.address != 0, "packet carries a null address");

        if let Some(index) = self.position_of(&packet) {
            let entry = self.entries[index].as_mut().expect("matched a live slot");
            entry.is_instruction |= packet.is_instruction;
            entry.is_data |= packet.is_data;
            if packet.is_instruction {
                entry.instr_merged = true;
            }
            if packet.is_data {
                entry.load_merged = true;
            }
            entry.rob_depends.insert(packet.rob_index);
            entry.rob_depends.extend(packet.rob_depends.iter().copied());

            self.stats.merged += 1;
            self.stats.access += 1;
            debug!(
                vpn = entry.address,
                instr_id = entry.instr_id,
                merged_instr_id = packet.instr_id,
                merged_rob_index = packet.rob_index,
                "translation request merged"
            );
            return Enqueue::Merged(index);
        }

        if self.occupancy == self.size() {
            self.stats.full += 1;
            return Enqueue::Full;
        }

        debug_assert!(self.entries[self.tail].is_none(), "tail slot occupied");
        debug!(
            vpn = packet.address,
            instr_id = packet.instr_id,
            head = self.head,
            tail = self.tail,
            occupancy = self.occupancy + 1,
            "translation request enqueued"
        );
        self.entries[self.tail] = Some(packet);
        self.tail = (self.tail + 1) % self.size();
        self.occupancy += 1;

        self.stats.to_cache += 1;
        self.stats.access += 1;
        Enqueue::Accepted
    }

    /// The oldest pending entry, if any.
    pub fn head(&self) -> Option<&Packet> {
        if self.occupancy == 0 {
            return None;
        }
        self.entries[self.head].as_ref()
    }

    /// Remove and return the oldest pending entry.
    ///
    /// Panics on an empty queue.
    pub fn pop_head(&mut self) -> Packet {
        assert!(self.occupancy > 0, "pop from an empty queue");
        let packet = self.entries[self.head].take().expect("head slot empty");
        self.head = (self.head + 1) % self.size();
        self.occupancy -= 1;
        packet
    }

    /// Live entries in arbitrary slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.entries.iter().flatten()
    }
}
