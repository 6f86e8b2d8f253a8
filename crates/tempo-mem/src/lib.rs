//! Shared memory-transaction protocol for the tempo hierarchy.
//!
//! Every level of the simulated memory system exchanges [`Packet`]s through a
//! narrow capability pair: a [`MemoryRequestConsumer`] accepts requests from
//! the level above it, a [`MemoryRequestProducer`] is notified when a request
//! it issued downward completes. This crate also carries the bounded
//! [`TranslationQueue`] used by the page-table walker and the injected
//! per-core timing state ([`SimCtx`]).

#![forbid(unsafe_code)]

pub mod consts;

mod packet;
mod queue;
mod sim;

pub use packet::{FillLevel, Packet, RequestKind};
pub use queue::{QueueStats, TranslationQueue};
pub use sim::{CoreTiming, SimCtx};

/// Which queue of a [`MemoryRequestConsumer`] an occupancy/size query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Read,
    Write,
    Prefetch,
}

/// Outcome of submitting a packet to a consumer queue.
///
/// Levels that cannot accept the request this cycle report [`Enqueue::Full`];
/// the producer retries on a later cycle. There is no error here: backpressure
/// is part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// Coalesced into the in-flight entry at this queue index.
    Merged(usize),
    /// Accepted as a fresh entry.
    Accepted,
    /// The queue is full; retry on a later cycle.
    Full,
}

impl Enqueue {
    #[inline]
    pub fn is_full(self) -> bool {
        matches!(self, Enqueue::Full)
    }
}

/// The downward-facing side of a memory level: accepts read, write, and
/// prefetch requests from the level above and reports queue pressure.
pub trait MemoryRequestConsumer {
    fn add_rq(&mut self, packet: &Packet) -> Enqueue;
    fn add_wq(&mut self, packet: &Packet) -> Enqueue;
    fn add_pq(&mut self, packet: &Packet) -> Enqueue;

    /// Current occupancy of the given queue. `address` lets set-associative
    /// levels report per-set pressure; queue-organized levels ignore it.
    fn occupancy(&self, queue: QueueKind, address: u64) -> usize;

    /// Capacity of the given queue.
    fn size(&self, queue: QueueKind, address: u64) -> usize;
}

/// The upward-facing side: called by the level below when a previously issued
/// request completes.
pub trait MemoryRequestProducer {
    fn return_data(&mut self, packet: &Packet);
}
