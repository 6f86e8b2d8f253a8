use tempo_mem::Packet;

/// One in-flight walk.
///
/// `level_to_issue` counts up from 0 (root probe not yet issued) to the tree
/// depth (walk complete); it never decreases while the slot is live. At most
/// one PTE load is outstanding per slot: `inflight` implies `valid`.
#[derive(Debug, Clone, Default)]
pub struct WalkSlot {
    pub valid: bool,
    pub inflight: bool,
    pub level_to_issue: u32,
    /// The original translation request.
    pub packet: Packet,
    /// The currently outstanding PTE-load probe, when `inflight`.
    pub probe: Packet,
}

/// The walker register file: a small fixed set of in-flight walks.
///
/// Slot identity is the array index; every lookup is a scan over the (tiny)
/// array.
#[derive(Debug)]
pub struct ActiveWalkTable {
    slots: Vec<WalkSlot>,
}

impl ActiveWalkTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![WalkSlot::default(); capacity],
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slots(&self) -> &[WalkSlot] {
        &self.slots
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut WalkSlot {
        &mut self.slots[index]
    }

    /// First live walk for the given (vpn, asid) key.
    pub fn find_in_flight_matching(&self, vpn: u64, asid: [u8; 2]) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.valid && s.packet.address == vpn && s.packet.asid == asid)
    }

    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.valid)
    }

    /// Slot whose outstanding probe carries this block address.
    pub fn find_by_probe_addr(&self, address: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.valid && s.inflight && s.probe.address == address)
    }

    pub fn valid_count(&self) -> usize {
        self.slots.iter().filter(|s| s.valid).count()
    }
}
