use crate::{config, fifo::Fifo, mem_fetch};
use console::style;
use std::collections::VecDeque;

/// Number of request entries a sub partition must be able to accept from the
/// interconnect in one L2 cycle (four sectors).
pub const SECTOR_CHUNK_SIZE: usize = 4;

/// The L2 side of a memory partition.
///
/// Requests arrive from the interconnect, pass through the L2 and DRAM and
/// leave as replies towards the interconnect.
pub trait SubPartition: std::fmt::Debug {
    fn id(&self) -> usize;

    /// Whether any request is still in flight.
    fn busy(&self) -> bool;

    /// Whether the interconnect to L2 queue cannot accept `size` more entries.
    fn full(&self, size: usize) -> bool;

    fn push(&mut self, fetch: mem_fetch::MemFetch, cycle: u64);

    /// Next reply to be sent to the interconnect, if any.
    fn top(&self) -> Option<&mem_fetch::MemFetch>;

    fn pop(&mut self) -> Option<mem_fetch::MemFetch>;

    fn cache_cycle(&mut self, cycle: u64);

    /// Flushes the L2 and returns the number of dirty lines.
    fn flush_l2(&mut self) -> usize {
        0
    }
}

/// Sub partition with a fixed L2 latency.
#[derive(Debug)]
pub struct MemorySubPartition {
    pub id: usize,
    pub partition_id: usize,
    l2_latency: u64,

    pub interconn_to_l2_queue: Fifo<mem_fetch::MemFetch>,
    l2_pipeline: VecDeque<(u64, mem_fetch::MemFetch)>,
    pub l2_to_dram_queue: Fifo<mem_fetch::MemFetch>,
    pub dram_to_l2_queue: Fifo<mem_fetch::MemFetch>,
    pub l2_to_interconn_queue: Fifo<mem_fetch::MemFetch>,

    num_pending: usize,
}

impl MemorySubPartition {
    #[must_use]
    pub fn new(id: usize, partition_id: usize, config: &config::GPU) -> Self {
        let queue_size = Some(config.sub_partition_queue_size);
        Self {
            id,
            partition_id,
            l2_latency: config.l2_latency,
            interconn_to_l2_queue: Fifo::new(queue_size),
            l2_pipeline: VecDeque::new(),
            l2_to_dram_queue: Fifo::new(queue_size),
            dram_to_l2_queue: Fifo::new(queue_size),
            l2_to_interconn_queue: Fifo::new(queue_size),
            num_pending: 0,
        }
    }

    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.num_pending
    }
}

impl SubPartition for MemorySubPartition {
    fn id(&self) -> usize {
        self.id
    }

    fn busy(&self) -> bool {
        self.num_pending > 0
    }

    fn full(&self, size: usize) -> bool {
        !self.interconn_to_l2_queue.can_fit(size)
    }

    fn push(&mut self, mut fetch: mem_fetch::MemFetch, _cycle: u64) {
        assert!(!self.interconn_to_l2_queue.full());
        fetch.set_status(mem_fetch::Status::InInterconnToL2Queue);
        self.num_pending += 1;
        self.interconn_to_l2_queue.enqueue(fetch);
    }

    fn top(&self) -> Option<&mem_fetch::MemFetch> {
        self.l2_to_interconn_queue.first()
    }

    fn pop(&mut self) -> Option<mem_fetch::MemFetch> {
        let fetch = self.l2_to_interconn_queue.dequeue()?;
        self.num_pending -= 1;
        Some(fetch)
    }

    #[tracing::instrument(name = "sub_partition_cache_cycle")]
    fn cache_cycle(&mut self, cycle: u64) {
        log::trace!(
            "{}",
            style(format!(
                " => memory sub partition[{}] cache cycle {}: icnt to l2 queue={} l2 to icnt queue={}",
                self.id,
                cycle,
                self.interconn_to_l2_queue.len(),
                self.l2_to_interconn_queue.len(),
            ))
            .blue()
        );

        // dram replies towards the interconnect
        if !self.l2_to_interconn_queue.full() {
            if let Some(mut reply) = self.dram_to_l2_queue.dequeue() {
                reply.set_status(mem_fetch::Status::InL2ToInterconnQueue);
                self.l2_to_interconn_queue.enqueue(reply);
            }
        }

        // l2 misses towards dram
        match self.l2_pipeline.front() {
            Some((ready_cycle, _)) if *ready_cycle <= cycle && !self.l2_to_dram_queue.full() => {
                if let Some((_, mut fetch)) = self.l2_pipeline.pop_front() {
                    fetch.set_status(mem_fetch::Status::InL2ToDramQueue);
                    self.l2_to_dram_queue.enqueue(fetch);
                }
            }
            _ => {}
        }

        // new requests into the l2
        if let Some(mut fetch) = self.interconn_to_l2_queue.dequeue() {
            fetch.set_status(mem_fetch::Status::InL2Pipeline);
            self.l2_pipeline.push_back((cycle + self.l2_latency, fetch));
        }
    }
}
