use crate::mem_sub_partition::{MemorySubPartition, SubPartition};
use crate::{config, mem_fetch};
use console::style;
use std::collections::VecDeque;

/// A memory partition: a DRAM channel shared by its sub partitions.
pub trait MemoryPartition: std::fmt::Debug {
    type SubPartition: SubPartition;

    fn id(&self) -> usize;

    fn busy(&self) -> bool;

    fn dram_cycle(&mut self, cycle: u64);

    fn sub_partitions(&self) -> &[Self::SubPartition];

    fn sub_partitions_mut(&mut self) -> &mut [Self::SubPartition];
}

/// Memory partition with a fixed DRAM latency.
#[derive(Debug)]
pub struct MemoryPartitionUnit {
    pub id: usize,
    dram_latency: u64,
    pub sub_partitions: Vec<MemorySubPartition>,
    pub dram_latency_queue: VecDeque<(u64, mem_fetch::MemFetch)>,
    /// sub partition that is served first in the next dram cycle
    next_sub_partition: usize,
}

impl MemoryPartitionUnit {
    #[must_use]
    pub fn new(partition_id: usize, config: &config::GPU) -> Self {
        let num_sub_partitions = config.num_sub_partitions_per_memory_controller;
        let sub_partitions = (0..num_sub_partitions)
            .map(|local_id| {
                let id = partition_id * num_sub_partitions + local_id;
                MemorySubPartition::new(id, partition_id, config)
            })
            .collect();
        Self {
            id: partition_id,
            dram_latency: config.dram_latency,
            sub_partitions,
            dram_latency_queue: VecDeque::new(),
            next_sub_partition: 0,
        }
    }

    fn global_sub_partition_id_to_local_id(&self, global_sub_partition_id: usize) -> usize {
        global_sub_partition_id - self.id * self.sub_partitions.len()
    }
}

impl MemoryPartition for MemoryPartitionUnit {
    type SubPartition = MemorySubPartition;

    fn id(&self) -> usize {
        self.id
    }

    fn busy(&self) -> bool {
        !self.dram_latency_queue.is_empty() || self.sub_partitions.iter().any(SubPartition::busy)
    }

    fn sub_partitions(&self) -> &[MemorySubPartition] {
        &self.sub_partitions
    }

    fn sub_partitions_mut(&mut self) -> &mut [MemorySubPartition] {
        &mut self.sub_partitions
    }

    #[tracing::instrument(name = "partition_dram_cycle")]
    fn dram_cycle(&mut self, cycle: u64) {
        log::trace!("{} ...", style(format!("partition {} dram cycle {cycle}", self.id)).red());

        // return a completed dram access to its sub partition
        let returned = match self.dram_latency_queue.front() {
            Some((ready_cycle, fetch)) if *ready_cycle <= cycle => {
                let local_id = self.global_sub_partition_id_to_local_id(fetch.sub_partition_id);
                let sub = &self.sub_partitions[local_id];
                debug_assert_eq!(sub.id, fetch.sub_partition_id);
                (!sub.dram_to_l2_queue.full()).then_some(local_id)
            }
            _ => None,
        };
        if let Some(local_id) = returned {
            if let Some((_, mut fetch)) = self.dram_latency_queue.pop_front() {
                fetch.set_reply();
                fetch.set_status(mem_fetch::Status::InDramToL2Queue);
                log::trace!("dram returned {fetch} to sub partition {local_id}");
                self.sub_partitions[local_id].dram_to_l2_queue.enqueue(fetch);
            }
        }

        // accept one request per cycle, round robin over the sub partitions
        let num_sub_partitions = self.sub_partitions.len();
        for i in 0..num_sub_partitions {
            let local_id = (self.next_sub_partition + i) % num_sub_partitions;
            if let Some(mut fetch) = self.sub_partitions[local_id].l2_to_dram_queue.dequeue() {
                fetch.set_status(mem_fetch::Status::InDram);
                self.dram_latency_queue
                    .push_back((cycle + self.dram_latency, fetch));
                self.next_sub_partition = (local_id + 1) % num_sub_partitions;
                break;
            }
        }
    }
}
