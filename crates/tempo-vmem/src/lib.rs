//! Lazily-populated virtual-memory manager.
//!
//! Owns the virtual-to-physical mapping for every simulated core. Physical
//! frames are allocated on first touch (minor fault); under frame pressure a
//! victim is evicted NRU-style and the faulting core pays a swap stall (major
//! fault). The manager also hands out the physical addresses of page-table
//! entries for the hardware walker, materializing directory frames out of a
//! reserved region of DRAM on first use.
//!
//! Virtual pages are namespaced per core: the page-table key is the virtual
//! page number XOR-ed with a per-core constant, so identical virtual
//! addresses on different cores map independently.

#![forbid(unsafe_code)]

mod config;
mod rng;

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use tempo_mem::consts::{BLOCK_SIZE, LOG2_BLOCK_SIZE};
use tempo_mem::SimCtx;

pub use config::{VmemConfig, VmemConfigError};

use rng::XorShift64Star;

/// Invalidation fan-out used while evicting a victim page.
///
/// Implemented by the (external) core/uncore model. `invalidate_page` covers
/// the core's TLB hierarchy (ITLB, DTLB, STLB); `invalidate_block` is called
/// once per cache line of the victim frame and covers L1I, L1D, L2C, and the
/// LLC.
pub trait EvictionSink {
    fn invalidate_page(&mut self, cpu: u32, vaddr: u64);
    fn invalidate_block(&mut self, cpu: u32, block_addr: u64);
}

/// The virtual-to-physical mapping plus the page-table geometry.
#[derive(Debug)]
pub struct VirtualMemory {
    cfg: VmemConfig,
    dram_pages: u64,
    level_count: u32,
    cpu_rot: u32,

    /// canonical vpn -> physical frame. BTreeMap keeps iteration (and thus
    /// fallback victim selection) deterministic.
    page_table: BTreeMap<u64, u64>,
    frame_to_vpn: BTreeMap<u64, u64>,
    frame_allocated: Vec<bool>,
    frame_nru: Vec<bool>,
    free_user_frames: u64,

    /// Materialized directory frames: (level, index-path prefix) -> frame.
    table_frames: HashMap<(u32, u64), u64>,
    root_frame: u64,
    next_table_frame: u64,

    previous_frame: u64,
    num_adjacent_remaining: u64,
    rng: XorShift64Star,
}

impl VirtualMemory {
    /// Build the manager. `root_frame_addr` is the physical address of the
    /// fixed root page-table frame; it must lie in the reserved region.
    pub fn new(cfg: VmemConfig, root_frame_addr: u64) -> Result<Self, VmemConfigError> {
        cfg.validate()?;
        let root_frame = root_frame_addr >> cfg.log2_page();
        if root_frame >= cfg.reserved_table_frames {
            return Err(VmemConfigError::RootOutsideReserved(root_frame));
        }
        let dram_pages = cfg.dram_pages();
        let rng = XorShift64Star::new(cfg.rng_seed);
        Ok(Self {
            dram_pages,
            level_count: cfg.level_count(),
            cpu_rot: (cfg.num_cpus as u64).next_power_of_two().trailing_zeros(),
            page_table: BTreeMap::new(),
            frame_to_vpn: BTreeMap::new(),
            frame_allocated: vec![false; dram_pages as usize],
            frame_nru: vec![false; dram_pages as usize],
            free_user_frames: dram_pages - cfg.reserved_table_frames,
            table_frames: HashMap::new(),
            root_frame,
            next_table_frame: 0,
            previous_frame: 0,
            num_adjacent_remaining: 0,
            rng,
            cfg,
        })
    }

    #[inline]
    pub fn config(&self) -> &VmemConfig {
        &self.cfg
    }

    /// Depth of the page-table tree (number of PTE loads per walk).
    #[inline]
    pub fn level_count(&self) -> u32 {
        self.level_count
    }

    /// Per-core page-table key for a virtual page number.
    #[inline]
    pub fn canonical_vpn(&self, cpu: u32, vpn: u64) -> u64 {
        vpn ^ (cpu as u64).rotate_right(self.cpu_rot)
    }

    /// Resolve `va` for `cpu`, allocating or evicting a frame on a miss.
    ///
    /// A hit has no side effects. A miss with free frames available charges a
    /// minor fault; a miss under pressure evicts a victim, charges a major
    /// fault, and stalls the core for the swap latency.
    pub fn va_to_pa(
        &mut self,
        ctx: &mut SimCtx,
        evict: &mut dyn EvictionSink,
        cpu: u32,
        va: u64,
    ) -> u64 {
        assert!(va != 0, "translation of the null page");

        let offset = va & (self.cfg.page_size - 1);
        let key = self.canonical_vpn(cpu, va >> self.cfg.log2_page());

        let frame = match self.page_table.get(&key) {
            Some(&frame) => frame,
            None if self.free_user_frames == 0 => self.evict_and_claim(ctx, evict, cpu, key),
            None => self.claim_free_frame(ctx, cpu, key),
        };
        (frame << self.cfg.log2_page()) | offset
    }

    /// Evict the NRU victim and hand its frame to `key`.
    fn evict_and_claim(
        &mut self,
        ctx: &mut SimCtx,
        evict: &mut dyn EvictionSink,
        cpu: u32,
        key: u64,
    ) -> u64 {
        let victim = self.choose_victim();
        let victim_vpn = self.frame_to_vpn[&victim];
        debug!(
            cpu,
            victim_vpn,
            new_vpn = key,
            frame = victim,
            "swap: reassigning frame under memory pressure"
        );
        self.dealloc_page(evict, cpu, victim_vpn, victim);
        self.install(key, victim);

        let core = ctx.core_mut(cpu);
        core.major_faults += 1;
        core.stall_until = core.cycle + self.cfg.swap_latency;
        victim
    }

    /// Lowest-indexed allocated frame with its NRU bit set; when none
    /// qualifies, refresh every NRU bit (second chance) and take the
    /// lowest-indexed allocated frame.
    fn choose_victim(&mut self) -> u64 {
        let lo = self.cfg.reserved_table_frames;
        let marked = (lo..self.dram_pages)
            .find(|&f| self.frame_nru[f as usize] && self.frame_allocated[f as usize]);
        match marked {
            Some(frame) => frame,
            None => {
                self.frame_nru.fill(true);
                (lo..self.dram_pages)
                    .find(|&f| self.frame_allocated[f as usize])
                    .expect("memory pressure implies an allocated user frame")
            }
        }
    }

    /// Allocate a free frame for `key`, preferring the frame after the
    /// previous allocation while the contiguity run lasts.
    fn claim_free_frame(&mut self, ctx: &mut SimCtx, cpu: u32, key: u64) -> u64 {
        let lo = self.cfg.reserved_table_frames;
        let mut fragmented = false;

        let mut frame = if self.num_adjacent_remaining > 0 {
            self.previous_frame + 1
        } else {
            fragmented = true;
            self.rng.gen_range(lo, self.dram_pages)
        };
        while frame >= self.dram_pages || self.frame_allocated[frame as usize] {
            fragmented = true;
            frame = self.rng.gen_range(lo, self.dram_pages);
        }

        self.install(key, frame);
        self.previous_frame = frame;
        if fragmented {
            self.num_adjacent_remaining = self.rng.gen_range(0, (1 << 10) + 1);
        } else {
            self.num_adjacent_remaining -= 1;
        }

        ctx.core_mut(cpu).minor_faults += 1;
        debug!(cpu, vpn = key, frame, "frame allocated");
        frame
    }

    fn install(&mut self, key: u64, frame: u64) {
        let prev = self.page_table.insert(key, frame);
        debug_assert!(prev.is_none(), "double-mapping a virtual page");
        self.frame_to_vpn.insert(frame, key);
        self.frame_allocated[frame as usize] = true;
        self.frame_nru[frame as usize] = false;
        self.free_user_frames -= 1;
    }

    /// Drop the `vpn_key -> frame` mapping, invalidating the victim page in
    /// the TLB hierarchy and each of its lines in the cache hierarchy.
    pub fn dealloc_page(
        &mut self,
        evict: &mut dyn EvictionSink,
        cpu: u32,
        vpn_key: u64,
        frame: u64,
    ) {
        evict.invalidate_page(cpu, vpn_key << self.cfg.log2_page());
        let lines_per_page = self.cfg.page_size / BLOCK_SIZE;
        for line in 0..lines_per_page {
            let block_addr = (frame << (self.cfg.log2_page() - LOG2_BLOCK_SIZE)) | line;
            evict.invalidate_block(cpu, block_addr);
        }

        let removed = self.page_table.remove(&vpn_key);
        debug_assert_eq!(removed, Some(frame), "page table out of sync");
        self.frame_to_vpn.remove(&frame);
        self.frame_allocated[frame as usize] = false;
        self.free_user_frames += 1;
    }

    /// Physical address of the PTE to load at walk `level` for `va`.
    ///
    /// Level 0 is the root of the walk, `level_count() - 1` the leaf.
    /// Directory frames below the root are materialized on first access out
    /// of the reserved region. Directory indexing uses the raw virtual-page
    /// bits, so cores walking the same address share directory frames; only
    /// the mapping installed by [`VirtualMemory::va_to_pa`] is namespaced
    /// per core.
    pub fn get_pte_pa(&mut self, _cpu: u32, va: u64, level: u32) -> u64 {
        assert!(
            level < self.level_count,
            "walk level {level} out of range (tree depth {})",
            self.level_count
        );
        let vpn = va >> self.cfg.log2_page();
        let log2_fanout = self.cfg.log2_fanout();

        let shift = (self.level_count - 1 - level) * log2_fanout;
        let index = if level == 0 {
            // The top level takes the leftover high-order bits.
            vpn >> shift
        } else {
            (vpn >> shift) & (self.cfg.table_fanout() - 1)
        };

        let frame = if level == 0 {
            self.root_frame
        } else {
            let prefix = vpn >> ((self.level_count - level) * log2_fanout);
            self.table_frame(level, prefix)
        };
        (frame << self.cfg.log2_page()) + index * self.cfg.pte_size
    }

    /// Directory frame holding the PTEs of `level` for the given index-path
    /// prefix, materializing it on first access.
    fn table_frame(&mut self, level: u32, prefix: u64) -> u64 {
        if let Some(&frame) = self.table_frames.get(&(level, prefix)) {
            return frame;
        }
        if self.next_table_frame == self.root_frame {
            self.next_table_frame += 1;
        }
        let frame = self.next_table_frame;
        assert!(
            frame < self.cfg.reserved_table_frames,
            "reserved page-table frame region exhausted"
        );
        self.next_table_frame += 1;
        self.table_frames.insert((level, prefix), frame);
        debug!(level, prefix, frame, "page-table directory frame materialized");
        frame
    }

    // --- views for the DRAM controller (NRU co-owner), stats, and tests ---

    #[inline]
    pub fn frame_nru(&self, frame: u64) -> bool {
        self.frame_nru[frame as usize]
    }

    #[inline]
    pub fn set_frame_nru(&mut self, frame: u64, not_recently_used: bool) {
        self.frame_nru[frame as usize] = not_recently_used;
    }

    #[inline]
    pub fn frame_allocated(&self, frame: u64) -> bool {
        self.frame_allocated[frame as usize]
    }

    /// Frame currently backing `(cpu, vpn)`, if mapped.
    pub fn frame_of(&self, cpu: u32, vpn: u64) -> Option<u64> {
        self.page_table.get(&self.canonical_vpn(cpu, vpn)).copied()
    }

    /// Canonical vpn currently mapped to `frame`, if any.
    pub fn frame_owner(&self, frame: u64) -> Option<u64> {
        self.frame_to_vpn.get(&frame).copied()
    }

    /// All live `(canonical vpn, frame)` mappings in key order.
    pub fn mappings(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.page_table.iter().map(|(&vpn, &frame)| (vpn, frame))
    }

    #[inline]
    pub fn mapped_page_count(&self) -> usize {
        self.page_table.len()
    }

    #[inline]
    pub fn free_user_frames(&self) -> u64 {
        self.free_user_frames
    }

    /// Directory frames materialized so far, the fixed root excluded.
    #[inline]
    pub fn table_frame_count(&self) -> usize {
        self.table_frames.len()
    }

    #[inline]
    pub fn previous_frame(&self) -> u64 {
        self.previous_frame
    }

    /// Frames left in the current contiguous-allocation run.
    #[inline]
    pub fn adjacent_run_remaining(&self) -> u64 {
        self.num_adjacent_remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl EvictionSink for NullSink {
        fn invalidate_page(&mut self, _cpu: u32, _vaddr: u64) {}
        fn invalidate_block(&mut self, _cpu: u32, _block_addr: u64) {}
    }

    #[derive(Default)]
    struct RecordingSink {
        pages: Vec<(u32, u64)>,
        blocks: Vec<(u32, u64)>,
    }
    impl EvictionSink for RecordingSink {
        fn invalidate_page(&mut self, cpu: u32, vaddr: u64) {
            self.pages.push((cpu, vaddr));
        }
        fn invalidate_block(&mut self, cpu: u32, block_addr: u64) {
            self.blocks.push((cpu, block_addr));
        }
    }

    fn tiny_config(user_frames: u64) -> VmemConfig {
        VmemConfig {
            dram_size: (1 + user_frames) * 4096,
            reserved_table_frames: 1,
            ..VmemConfig::default()
        }
    }

    #[test]
    fn repeated_translation_is_stable_and_side_effect_free() {
        let mut vmem = VirtualMemory::new(VmemConfig::default(), 0).unwrap();
        let mut ctx = SimCtx::new(1);
        let mut sink = NullSink;

        let pa1 = vmem.va_to_pa(&mut ctx, &mut sink, 0, 0xabc_d123);
        let pa2 = vmem.va_to_pa(&mut ctx, &mut sink, 0, 0xabc_d123);
        assert_eq!(pa1, pa2);
        assert_eq!(pa1 & 0xfff, 0x123);
        assert_eq!(ctx.core(0).minor_faults, 1);
        assert_eq!(ctx.core(0).major_faults, 0);
        assert_eq!(vmem.mapped_page_count(), 1);
    }

    #[test]
    fn cores_translate_the_same_va_independently() {
        let cfg = VmemConfig {
            num_cpus: 2,
            ..VmemConfig::default()
        };
        let mut vmem = VirtualMemory::new(cfg, 0).unwrap();
        let mut ctx = SimCtx::new(2);
        let mut sink = NullSink;

        let pa0 = vmem.va_to_pa(&mut ctx, &mut sink, 0, 0x4_2000);
        let pa1 = vmem.va_to_pa(&mut ctx, &mut sink, 1, 0x4_2000);
        assert_ne!(pa0 >> 12, pa1 >> 12);
        assert_eq!(vmem.mapped_page_count(), 2);
    }

    #[test]
    fn pressure_evicts_refreshes_nru_and_stalls_the_core() {
        let mut vmem = VirtualMemory::new(tiny_config(2), 0).unwrap();
        let mut ctx = SimCtx::new(1);
        let mut sink = RecordingSink::default();
        ctx.core_mut(0).cycle = 500;

        vmem.va_to_pa(&mut ctx, &mut sink, 0, 0x1_0000);
        vmem.va_to_pa(&mut ctx, &mut sink, 0, 0x2_0000);
        assert_eq!(vmem.free_user_frames(), 0);
        // With one cpu the canonical key is the vpn itself.
        let evicted_vpn = vmem.frame_owner(1).unwrap();
        let surviving_vpn = vmem.frame_owner(2).unwrap();

        let pa = vmem.va_to_pa(&mut ctx, &mut sink, 0, 0x3_0000);
        // No NRU bit was set, so every bit is refreshed and the lowest
        // allocated frame is reassigned.
        let victim = pa >> 12;
        assert_eq!(victim, 1);
        assert_eq!(vmem.frame_of(0, 0x30), Some(victim));
        assert_eq!(vmem.frame_of(0, evicted_vpn), None);
        assert_eq!(vmem.frame_of(0, surviving_vpn), Some(2));
        assert_eq!(ctx.core(0).major_faults, 1);
        assert_eq!(ctx.core(0).minor_faults, 2);
        assert_eq!(ctx.core(0).stall_until, 500 + 10_000);
        assert_eq!(sink.pages.len(), 1);
        assert_eq!(sink.blocks.len(), 64);
        // Surviving frame 2 had its NRU bit refreshed.
        assert!(vmem.frame_nru(2));
        assert!(!vmem.frame_nru(victim));
    }

    #[test]
    fn marked_nru_frame_is_evicted_first() {
        let mut vmem = VirtualMemory::new(tiny_config(2), 0).unwrap();
        let mut ctx = SimCtx::new(1);
        let mut sink = NullSink;

        vmem.va_to_pa(&mut ctx, &mut sink, 0, 0x1_0000);
        vmem.va_to_pa(&mut ctx, &mut sink, 0, 0x2_0000);
        vmem.set_frame_nru(2, true);
        let evicted_vpn = vmem.frame_owner(2).unwrap();
        let surviving_vpn = vmem.frame_owner(1).unwrap();

        let pa = vmem.va_to_pa(&mut ctx, &mut sink, 0, 0x3_0000);
        assert_eq!(pa >> 12, 2);
        assert_eq!(vmem.frame_of(0, evicted_vpn), None);
        assert_eq!(vmem.frame_of(0, surviving_vpn), Some(1));
    }

    #[test]
    fn contiguity_run_allocates_the_next_frame() {
        let cfg = VmemConfig {
            dram_size: 16 << 20,
            reserved_table_frames: 16,
            ..VmemConfig::default()
        };
        let mut vmem = VirtualMemory::new(cfg, 0).unwrap();
        let mut ctx = SimCtx::new(1);
        let mut sink = NullSink;

        let mut vpn = 0x100u64;
        let mut checked = false;
        for _ in 0..50 {
            let prev = vmem.previous_frame();
            let run = vmem.adjacent_run_remaining();
            let next_free = run > 0
                && prev + 1 < vmem.config().dram_pages()
                && !vmem.frame_allocated(prev + 1);
            let pa = vmem.va_to_pa(&mut ctx, &mut sink, 0, vpn << 12);
            if next_free {
                assert_eq!(pa >> 12, prev + 1);
                checked = true;
                break;
            }
            vpn += 1;
        }
        assert!(checked, "no allocation ever continued a contiguity run");
    }

    #[test]
    fn pte_addresses_are_deterministic_and_stay_reserved() {
        let mut vmem = VirtualMemory::new(VmemConfig::default(), 0).unwrap();
        let va = 0x7fff_1234_5000u64;

        for level in 0..vmem.level_count() {
            let pa = vmem.get_pte_pa(0, va, level);
            assert_eq!(pa, vmem.get_pte_pa(0, va, level));
            let frame = pa >> 12;
            assert!(frame < 1024, "PTE frame {frame} outside the reserved region");
            assert_eq!((pa & 0xfff) % 8, 0);
        }
        // Root is the fixed construction-time frame.
        assert_eq!(vmem.get_pte_pa(0, va, 0) >> 12, 0);
        // Three directories materialized below the root for one address.
        assert_eq!(vmem.table_frame_count(), 3);
    }

    #[test]
    fn directory_addressing_is_shared_across_cores() {
        let cfg = VmemConfig {
            num_cpus: 4,
            ..VmemConfig::default()
        };
        let mut vmem = VirtualMemory::new(cfg, 0).unwrap();
        let va = 0x7fff_1234_5000u64;

        for level in 0..vmem.level_count() {
            let pa = vmem.get_pte_pa(0, va, level);
            for cpu in 1..4 {
                assert_eq!(vmem.get_pte_pa(cpu, va, level), pa);
            }
            assert!(pa >> 12 < 1024, "PTE frame left the reserved region");
        }
    }

    #[test]
    fn sibling_walks_share_directories_by_prefix() {
        let mut vmem = VirtualMemory::new(VmemConfig::default(), 0).unwrap();
        let a = 0x0000_4000_0000u64;
        let b = a + 4096;
        let c = 0x7f00_0000_0000u64;

        for level in 0..vmem.level_count() {
            // Adjacent pages differ only in the leaf index.
            let pa_a = vmem.get_pte_pa(0, a, level);
            let pa_b = vmem.get_pte_pa(0, b, level);
            assert_eq!(pa_a >> 12, pa_b >> 12);
            if level < vmem.level_count() - 1 {
                assert_eq!(pa_a, pa_b);
            } else {
                assert_ne!(pa_a, pa_b);
            }
        }
        // A distant address shares only the root.
        assert_eq!(vmem.get_pte_pa(0, c, 0) >> 12, vmem.get_pte_pa(0, a, 0) >> 12);
        for level in 1..vmem.level_count() {
            assert_ne!(vmem.get_pte_pa(0, c, level) >> 12, vmem.get_pte_pa(0, a, level) >> 12);
        }
    }

    #[test]
    #[should_panic(expected = "null page")]
    fn translating_the_null_page_is_a_bug() {
        let mut vmem = VirtualMemory::new(VmemConfig::default(), 0).unwrap();
        let mut ctx = SimCtx::new(1);
        vmem.va_to_pa(&mut ctx, &mut NullSink, 0, 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn walking_past_the_leaf_is_a_bug() {
        let mut vmem = VirtualMemory::new(VmemConfig::default(), 0).unwrap();
        let levels = vmem.level_count();
        vmem.get_pte_pa(0, 0x1000, levels);
    }
}
