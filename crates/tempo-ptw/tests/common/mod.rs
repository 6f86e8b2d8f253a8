//! Test bench: a walker wired to a capturing lower-level cache, recording
//! upper-level ports, and a counting eviction sink.

use tempo_mem::{Enqueue, MemoryRequestConsumer, MemoryRequestProducer, Packet, QueueKind, SimCtx};
use tempo_ptw::{PageTableWalker, TranslationSink, WalkerConfig, WalkerPorts};
use tempo_vmem::{EvictionSink, VirtualMemory, VmemConfig};

/// Lower-level cache stand-in. Accepted loads complete on the next cycle
/// (the earliest the protocol allows); `full` simulates queue backpressure.
#[derive(Default)]
pub struct CapturingCache {
    pending: Vec<Packet>,
    ready: Vec<Packet>,
    pub issued: Vec<Packet>,
    pub full: bool,
}

impl CapturingCache {
    pub fn take_ready(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.ready)
    }

    /// End of cycle: loads issued this cycle become completable next cycle.
    pub fn age(&mut self) {
        self.ready.append(&mut self.pending);
    }
}

impl MemoryRequestConsumer for CapturingCache {
    fn add_rq(&mut self, packet: &Packet) -> Enqueue {
        if self.full {
            return Enqueue::Full;
        }
        self.pending.push(packet.clone());
        self.issued.push(packet.clone());
        Enqueue::Accepted
    }

    fn add_wq(&mut self, _packet: &Packet) -> Enqueue {
        Enqueue::Accepted
    }

    fn add_pq(&mut self, _packet: &Packet) -> Enqueue {
        Enqueue::Accepted
    }

    fn occupancy(&self, _queue: QueueKind, _address: u64) -> usize {
        self.pending.len() + self.ready.len()
    }

    fn size(&self, _queue: QueueKind, _address: u64) -> usize {
        usize::MAX
    }
}

/// Records completions per upper-level port.
#[derive(Default)]
pub struct Deliveries {
    pub icache: Vec<Packet>,
    pub dcache: Vec<Packet>,
}

impl TranslationSink for Deliveries {
    fn return_instruction(&mut self, _cpu: u32, packet: &Packet) {
        self.icache.push(packet.clone());
    }

    fn return_data(&mut self, _cpu: u32, packet: &Packet) {
        self.dcache.push(packet.clone());
    }
}

#[derive(Default)]
pub struct CountingEvict {
    pub pages: Vec<(u32, u64)>,
    pub blocks: Vec<(u32, u64)>,
}

impl EvictionSink for CountingEvict {
    fn invalidate_page(&mut self, cpu: u32, vaddr: u64) {
        self.pages.push((cpu, vaddr));
    }

    fn invalidate_block(&mut self, cpu: u32, block_addr: u64) {
        self.blocks.push((cpu, block_addr));
    }
}

pub struct Bench {
    pub walker: PageTableWalker,
    pub vmem: VirtualMemory,
    pub ctx: SimCtx,
    pub lower: CapturingCache,
    pub upper: Deliveries,
    pub evict: CountingEvict,
}

impl Bench {
    pub fn new(walker_cfg: WalkerConfig, vmem_cfg: VmemConfig) -> Self {
        let num_cpus = vmem_cfg.num_cpus;
        Self {
            walker: PageTableWalker::new(walker_cfg).expect("valid walker config"),
            vmem: VirtualMemory::new(vmem_cfg, 0).expect("valid vmem config"),
            ctx: SimCtx::new(num_cpus),
            lower: CapturingCache::default(),
            upper: Deliveries::default(),
            evict: CountingEvict::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(WalkerConfig::default(), VmemConfig::default())
    }

    pub fn submit(&mut self, packet: &Packet) -> Enqueue {
        self.walker.add_rq(packet)
    }

    /// One scheduler cycle: completions from the previous cycle first, then
    /// the walker's operate, then the clocks.
    pub fn cycle(&mut self) {
        for packet in self.lower.take_ready() {
            self.walker.return_data(&packet);
        }
        self.walker.operate(&mut WalkerPorts {
            ctx: &mut self.ctx,
            vmem: &mut self.vmem,
            evict: &mut self.evict,
            lower: &mut self.lower,
            upper: &mut self.upper,
        });
        self.lower.age();
        self.ctx.advance();
    }

    pub fn run(&mut self, cycles: usize) {
        for _ in 0..cycles {
            self.cycle();
        }
    }
}
