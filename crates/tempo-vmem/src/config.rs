use thiserror::Error;

use tempo_mem::consts::{PAGE_SIZE, PTE_SIZE, VIRTUAL_ADDR_BITS};

/// Configuration for [`VirtualMemory`](crate::VirtualMemory).
#[derive(Debug, Clone)]
pub struct VmemConfig {
    /// Simulated DRAM capacity in bytes.
    pub dram_size: u64,
    /// Number of simulated cores sharing physical memory.
    pub num_cpus: u32,
    /// Page size in bytes. Must be a power of two.
    pub page_size: u64,
    /// Page-table entry size in bytes. Must be a power of two dividing the
    /// page size.
    pub pte_size: u64,
    /// Frames at the bottom of DRAM reserved for page-table pages.
    pub reserved_table_frames: u64,
    /// Core stall applied on a major fault, in cycles.
    pub swap_latency: u64,
    /// Seed for the frame-scatter PRNG.
    pub rng_seed: u64,
}

impl Default for VmemConfig {
    fn default() -> Self {
        Self {
            dram_size: 1 << 30,
            num_cpus: 1,
            page_size: PAGE_SIZE,
            pte_size: PTE_SIZE,
            reserved_table_frames: 1024,
            swap_latency: 10_000,
            rng_seed: 0x7E3A_11D5_C0DE_5EED,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmemConfigError {
    #[error("page size {0} is not a power of two")]
    PageSizeNotPow2(u64),

    #[error("pte size {0} is not a power of two dividing the page size")]
    BadPteSize(u64),

    #[error("reserved table frames ({reserved}) must leave user frames in DRAM ({dram_pages} pages)")]
    ReservedExceedsDram { reserved: u64, dram_pages: u64 },

    #[error("simulation needs at least one core")]
    NoCpus,

    #[error("root table frame {0} lies outside the reserved region")]
    RootOutsideReserved(u64),
}

impl VmemConfig {
    pub fn validate(&self) -> Result<(), VmemConfigError> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(VmemConfigError::PageSizeNotPow2(self.page_size));
        }
        if self.pte_size == 0
            || !self.pte_size.is_power_of_two()
            || self.pte_size >= self.page_size
        {
            return Err(VmemConfigError::BadPteSize(self.pte_size));
        }
        if self.reserved_table_frames >= self.dram_pages() {
            return Err(VmemConfigError::ReservedExceedsDram {
                reserved: self.reserved_table_frames,
                dram_pages: self.dram_pages(),
            });
        }
        if self.num_cpus == 0 {
            return Err(VmemConfigError::NoCpus);
        }
        Ok(())
    }

    #[inline]
    pub fn dram_pages(&self) -> u64 {
        self.dram_size / self.page_size
    }

    /// PTEs per page-table page.
    #[inline]
    pub fn table_fanout(&self) -> u64 {
        self.page_size / self.pte_size
    }

    #[inline]
    pub(crate) fn log2_page(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    #[inline]
    pub(crate) fn log2_fanout(&self) -> u32 {
        self.table_fanout().trailing_zeros()
    }

    /// Depth of the page-table tree covering the virtual address space.
    pub fn level_count(&self) -> u32 {
        let vpn_bits = VIRTUAL_ADDR_BITS - self.log2_page();
        vpn_bits.div_ceil(self.log2_fanout())
    }
}
