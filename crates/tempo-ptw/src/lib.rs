//! Hardware page-table walker.
//!
//! Resolves translation requests from the TLB hierarchy by issuing one
//! dependent PTE load per tree level through the lower-level cache, in
//! lockstep with the virtual-memory manager. Requests queue in a bounded
//! [`TranslationQueue`] (duplicates coalesce there), walk in one of a few
//! [`ActiveWalkTable`] slots, and return to the originating TLB(s) through
//! the upper-level ports when the leaf PTE arrives.
//!
//! The walker is an operable: the scheduler calls [`PageTableWalker::operate`]
//! once per simulated cycle. Within a cycle the phases run strictly in order
//! retire → advance → issue, so a slot freed by a retirement is available to
//! the same cycle's admissions.

#![forbid(unsafe_code)]

mod awt;

use thiserror::Error;
use tracing::debug;

use tempo_mem::consts::LOG2_BLOCK_SIZE;
use tempo_mem::{
    Enqueue, FillLevel, MemoryRequestConsumer, MemoryRequestProducer, Packet, QueueKind,
    RequestKind, SimCtx, TranslationQueue,
};
use tempo_vmem::{EvictionSink, VirtualMemory};

pub use awt::{ActiveWalkTable, WalkSlot};

/// Configuration for [`PageTableWalker`].
#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Walker register file capacity (concurrent walks).
    pub walk_slots: usize,
    /// Admissions from the request queue per cycle.
    pub issue_width: usize,
    /// Request queue capacity.
    pub rq_size: usize,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            walk_slots: 4,
            issue_width: 4,
            rq_size: 32,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalkerConfigError {
    #[error("walker needs at least one walk slot")]
    NoWalkSlots,

    #[error("issue width must be nonzero")]
    ZeroIssueWidth,

    #[error("request queue size must be nonzero")]
    ZeroQueueSize,
}

impl WalkerConfig {
    pub fn validate(&self) -> Result<(), WalkerConfigError> {
        if self.walk_slots == 0 {
            return Err(WalkerConfigError::NoWalkSlots);
        }
        if self.issue_width == 0 {
            return Err(WalkerConfigError::ZeroIssueWidth);
        }
        if self.rq_size == 0 {
            return Err(WalkerConfigError::ZeroQueueSize);
        }
        Ok(())
    }
}

/// Walker activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkerStats {
    pub walks_admitted: u64,
    pub walks_completed: u64,
    pub probes_issued: u64,
    /// Probes deferred because the lower-level read queue was full.
    pub probes_retried: u64,
    /// Queue heads dropped because their walk was already active.
    pub duplicates_dropped: u64,
}

/// Completion ports back into the per-core TLB hierarchy.
///
/// Adapts the upper-level instruction/data return paths: a finished
/// translation goes to the instruction port, the data port, or both,
/// according to the request's (possibly merged) origin flags.
pub trait TranslationSink {
    fn return_instruction(&mut self, cpu: u32, packet: &Packet);
    fn return_data(&mut self, cpu: u32, packet: &Packet);
}

/// Everything outside the walker that one cycle of operation touches.
pub struct WalkerPorts<'a> {
    pub ctx: &'a mut SimCtx,
    pub vmem: &'a mut VirtualMemory,
    pub evict: &'a mut dyn EvictionSink,
    pub lower: &'a mut dyn MemoryRequestConsumer,
    pub upper: &'a mut dyn TranslationSink,
}

/// The per-cycle walk engine.
#[derive(Debug)]
pub struct PageTableWalker {
    cfg: WalkerConfig,
    rq: TranslationQueue,
    awt: ActiveWalkTable,
    stats: WalkerStats,
}

impl PageTableWalker {
    pub fn new(cfg: WalkerConfig) -> Result<Self, WalkerConfigError> {
        cfg.validate()?;
        Ok(Self {
            rq: TranslationQueue::new(cfg.rq_size),
            awt: ActiveWalkTable::new(cfg.walk_slots),
            stats: WalkerStats::default(),
            cfg,
        })
    }

    #[inline]
    pub fn config(&self) -> &WalkerConfig {
        &self.cfg
    }

    #[inline]
    pub fn stats(&self) -> &WalkerStats {
        &self.stats
    }

    #[inline]
    pub fn rq(&self) -> &TranslationQueue {
        &self.rq
    }

    #[inline]
    pub fn awt(&self) -> &ActiveWalkTable {
        &self.awt
    }

    /// Advance the walker by one cycle: retire finished walks, issue the next
    /// PTE load for each ready walk, then admit queued requests into free
    /// slots.
    pub fn operate(&mut self, ports: &mut WalkerPorts) {
        let level_count = ports.vmem.level_count();
        let retired = self.retire_finished(ports, level_count);
        self.advance_ready(ports, level_count);
        self.admit_from_queue(&retired);
    }

    /// Phase A: deliver completed walks upstream and free their slots.
    /// Returns the (vpn, asid) keys retired this cycle so Phase C can still
    /// recognize their duplicates.
    fn retire_finished(
        &mut self,
        ports: &mut WalkerPorts,
        level_count: u32,
    ) -> Vec<(u64, [u8; 2])> {
        let mut retired = Vec::new();
        for index in 0..self.awt.capacity() {
            let slot = &self.awt.slots()[index];
            if !slot.valid || slot.inflight || slot.level_to_issue != level_count {
                continue;
            }

            let mut packet = slot.packet.clone();
            let pa = ports
                .vmem
                .va_to_pa(ports.ctx, ports.evict, packet.cpu, packet.full_v_addr);
            packet.data = pa;
            packet.event_cycle = ports.ctx.core(packet.cpu).cycle;

            debug!(
                cpu = packet.cpu,
                vpn = packet.address,
                pa,
                instr_id = packet.instr_id,
                "walk complete"
            );
            if packet.is_instruction {
                ports.upper.return_instruction(packet.cpu, &packet);
            }
            if packet.is_data {
                ports.upper.return_data(packet.cpu, &packet);
            }

            retired.push((packet.address, packet.asid));
            *self.awt.slot_mut(index) = WalkSlot::default();
            self.stats.walks_completed += 1;
        }
        retired
    }

    /// Phase B: issue one PTE load for each ready, unfinished walk.
    fn advance_ready(&mut self, ports: &mut WalkerPorts, level_count: u32) {
        for index in 0..self.awt.capacity() {
            let slot = &self.awt.slots()[index];
            if !slot.valid || slot.inflight || slot.level_to_issue >= level_count {
                continue;
            }

            let cpu = slot.packet.cpu;
            let level = slot.level_to_issue;
            let pte_pa = ports.vmem.get_pte_pa(cpu, slot.packet.full_v_addr, level);

            let mut probe = slot.packet.clone();
            probe.kind = RequestKind::Load;
            probe.fill_level = FillLevel::L1;
            probe.fill_l1d = true;
            probe.full_addr = pte_pa;
            probe.address = pte_pa >> LOG2_BLOCK_SIZE;
            probe.data = 0;
            probe.event_cycle = ports.ctx.core(cpu).cycle;

            if ports.lower.add_rq(&probe).is_full() {
                // Lower-level backpressure: the slot stays ready and the same
                // level is retried next cycle.
                self.stats.probes_retried += 1;
                continue;
            }

            debug!(
                cpu,
                vpn = slot.packet.address,
                level,
                pte_pa,
                "pte load issued"
            );
            let slot = self.awt.slot_mut(index);
            slot.probe = probe;
            slot.inflight = true;
            slot.level_to_issue += 1;
            self.stats.probes_issued += 1;
        }
    }

    /// Phase C: admit queued requests into free slots, up to the issue width.
    fn admit_from_queue(&mut self, retired: &[(u64, [u8; 2])]) {
        let mut admitted = 0;
        while self.rq.occupancy() > 0 && admitted < self.cfg.issue_width {
            let head = self.rq.head().expect("nonzero occupancy");

            // A duplicate of an already-active walk can reach the head when
            // the first arrival was popped before the duplicate enqueued.
            // A walk retired in this cycle's Phase A covers its duplicates
            // the same way: the completion already went upstream.
            if self
                .awt
                .find_in_flight_matching(head.address, head.asid)
                .is_some()
                || retired.contains(&(head.address, head.asid))
            {
                let dropped = self.rq.pop_head();
                debug!(vpn = dropped.address, "duplicate of an active walk dropped");
                self.stats.duplicates_dropped += 1;
                continue;
            }

            let Some(free) = self.awt.find_free_slot() else {
                // All slots busy: leave the head queued.
                break;
            };
            let packet = self.rq.pop_head();
            debug!(
                cpu = packet.cpu,
                vpn = packet.address,
                slot = free,
                "walk admitted"
            );
            *self.awt.slot_mut(free) = WalkSlot {
                valid: true,
                inflight: false,
                level_to_issue: 0,
                packet,
                probe: Packet::default(),
            };
            admitted += 1;
            self.stats.walks_admitted += 1;
        }
    }
}

impl MemoryRequestConsumer for PageTableWalker {
    fn add_rq(&mut self, packet: &Packet) -> Enqueue {
        assert!(packet.address != 0, "translation request for the null page");
        self.rq.add(packet.clone())
    }

    // Write and prefetch traffic is not modeled by the walker.
    fn add_wq(&mut self, _packet: &Packet) -> Enqueue {
        Enqueue::Accepted
    }

    fn add_pq(&mut self, _packet: &Packet) -> Enqueue {
        Enqueue::Accepted
    }

    fn occupancy(&self, queue: QueueKind, _address: u64) -> usize {
        match queue {
            QueueKind::Read => self.rq.occupancy(),
            QueueKind::Write | QueueKind::Prefetch => 0,
        }
    }

    fn size(&self, queue: QueueKind, _address: u64) -> usize {
        match queue {
            QueueKind::Read => self.rq.size(),
            QueueKind::Write | QueueKind::Prefetch => 0,
        }
    }
}

impl MemoryRequestProducer for PageTableWalker {
    /// Completion of a PTE load issued in an earlier cycle. The walk resumes
    /// (advances or retires) on its next `operate`.
    fn return_data(&mut self, packet: &Packet) {
        let index = self
            .awt
            .find_by_probe_addr(packet.address)
            .unwrap_or_else(|| {
                panic!(
                    "pte load return for unknown probe address {:#x}",
                    packet.address
                )
            });
        self.awt.slot_mut(index).inflight = false;
    }
}
