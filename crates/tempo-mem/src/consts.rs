//! Geometry constants shared across the hierarchy.

pub const PAGE_SIZE: u64 = 4096;
pub const LOG2_PAGE_SIZE: u32 = 12;

pub const BLOCK_SIZE: u64 = 64;
pub const LOG2_BLOCK_SIZE: u32 = 6;

/// Size of one page-table entry in bytes.
pub const PTE_SIZE: u64 = 8;

/// Simulated virtual address width in bits.
pub const VIRTUAL_ADDR_BITS: u32 = 48;
