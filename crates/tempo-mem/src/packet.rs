use std::collections::BTreeSet;

use crate::consts::LOG2_PAGE_SIZE;

/// Request class carried by a [`Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    #[default]
    Load,
    Rfo,
    Prefetch,
    Writeback,
    /// A virtual-address translation request on its way to the walker.
    Translation,
}

/// How far down the hierarchy a fill must propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FillLevel {
    #[default]
    L1,
    L2,
    Llc,
    Dram,
}

/// The transport record exchanged between hierarchy levels.
///
/// A packet carries both the logical request (the virtual address being
/// translated, the originating instruction) and, while a dependent load is in
/// flight, the transient probe address in `address`/`full_addr`. For a
/// translation request, `address` and `v_address` hold the virtual page
/// number and `full_addr`/`full_v_addr` the full virtual address; the walker
/// overwrites `address`/`full_addr` with the PTE physical address on each
/// probe it issues.
///
/// `address != 0` for any valid packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: RequestKind,
    pub fill_level: FillLevel,
    pub fill_l1i: bool,
    pub fill_l1d: bool,

    /// Block- or page-granular request key. Never zero for a live packet.
    pub address: u64,
    pub full_addr: u64,
    pub v_address: u64,
    pub full_v_addr: u64,

    /// Filled-in result (the translated physical address, once resolved).
    pub data: u64,
    pub event_cycle: u64,

    pub cpu: u32,
    pub asid: [u8; 2],

    pub instr_id: u64,
    pub ip: u64,
    pub rob_index: usize,

    /// Request originated from the instruction-fetch side.
    pub is_instruction: bool,
    /// Request originated from the data side.
    pub is_data: bool,
    /// A later instruction-side request was coalesced into this one.
    pub instr_merged: bool,
    /// A later data-side request was coalesced into this one.
    pub load_merged: bool,

    /// ROB entries whose wakeup depends on this request. Ordered and
    /// duplicate-free; the originating entry's own `rob_index` is included.
    pub rob_depends: BTreeSet<usize>,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            kind: RequestKind::default(),
            fill_level: FillLevel::default(),
            fill_l1i: false,
            fill_l1d: false,
            address: 0,
            full_addr: 0,
            v_address: 0,
            full_v_addr: 0,
            data: 0,
            event_cycle: u64::MAX,
            cpu: 0,
            asid: [u8::MAX; 2],
            instr_id: 0,
            ip: 0,
            rob_index: 0,
            is_instruction: false,
            is_data: false,
            instr_merged: false,
            load_merged: false,
            rob_depends: BTreeSet::new(),
        }
    }
}

impl Packet {
    /// Build a translation request for `vaddr` as a TLB would submit it to
    /// the walker.
    pub fn translation_request(
        cpu: u32,
        vaddr: u64,
        asid: [u8; 2],
        instr_id: u64,
        rob_index: usize,
        is_instruction: bool,
    ) -> Self {
        Self {
            kind: RequestKind::Translation,
            address: vaddr >> LOG2_PAGE_SIZE,
            full_addr: vaddr,
            v_address: vaddr >> LOG2_PAGE_SIZE,
            full_v_addr: vaddr,
            cpu,
            asid,
            instr_id,
            rob_index,
            is_instruction,
            is_data: !is_instruction,
            rob_depends: BTreeSet::from([rob_index]),
            ..Self::default()
        }
    }

    /// Virtual page number of the request.
    #[inline]
    pub fn vpn(&self) -> u64 {
        self.full_v_addr >> LOG2_PAGE_SIZE
    }
}
