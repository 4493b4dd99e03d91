//! Per core resource accounting for concurrently resident blocks.
//!
//! A block is admitted only if its padded thread count, shared memory,
//! registers and one block slot all fit the remaining budgets *and* an
//! aligned span of free hardware thread ids exists.

use crate::config::{self, registers_per_thread_padded, GPU};
use crate::kernel::Kernel;
use bitvec::vec::BitVec;
use std::collections::HashMap;

/// Resources a single block of a kernel occupies on a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    /// Thread count padded to a multiple of the warp size
    pub threads: usize,
    pub shared_memory: usize,
    pub registers: usize,
}

impl Request {
    #[must_use]
    pub fn new(kernel: &Kernel, config: &GPU) -> Self {
        let threads = config::pad_to_multiple(kernel.threads_per_block(), config.warp_size);
        Self {
            threads,
            shared_memory: kernel.config().shared_mem_bytes as usize,
            registers: threads * registers_per_thread_padded(kernel.config().num_registers),
        }
    }
}

/// Reason a block does not fit onto a core.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejected {
    #[error("{requested} threads exceed budget ({occupied}/{limit} occupied)")]
    Threads {
        requested: usize,
        occupied: usize,
        limit: usize,
    },
    #[error("no aligned span of {size} free hardware thread ids")]
    NoAlignedThreadIds { size: usize },
    #[error("{requested} bytes of shared memory exceed budget ({occupied}/{limit} occupied)")]
    SharedMemory {
        requested: usize,
        occupied: usize,
        limit: usize,
    },
    #[error("{requested} registers exceed budget ({occupied}/{limit} occupied)")]
    Registers {
        requested: usize,
        occupied: usize,
        limit: usize,
    },
    #[error("all {limit} block slots occupied")]
    Blocks { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Budget {
    pub threads: usize,
    pub shared_memory: usize,
    pub registers: usize,
    pub blocks: usize,
}

impl From<&GPU> for Budget {
    fn from(config: &GPU) -> Self {
        Self {
            threads: config.max_threads_per_core,
            shared_memory: config.shared_memory_size as usize,
            registers: config.shader_registers,
            blocks: config.max_concurrent_blocks_per_core,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupancy {
    budget: Budget,
    pub num_threads: usize,
    pub shared_memory: usize,
    pub registers: usize,
    pub num_blocks: usize,
    hw_thread_ids: BitVec,
    block_to_hw_thread_id: HashMap<usize, usize>,
}

impl Occupancy {
    #[must_use]
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            num_threads: 0,
            shared_memory: 0,
            registers: 0,
            num_blocks: 0,
            hw_thread_ids: BitVec::repeat(false, budget.threads),
            block_to_hw_thread_id: HashMap::new(),
        }
    }

    #[must_use]
    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }

    #[must_use]
    pub fn is_occupied(&self, hw_thread_id: usize) -> bool {
        self.hw_thread_ids
            .get(hw_thread_id)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn hw_thread_id(&self, hw_block_id: usize) -> Option<usize> {
        self.block_to_hw_thread_id.get(&hw_block_id).copied()
    }

    /// Finds the first aligned span of `size` free hardware thread ids.
    ///
    /// Candidate spans start at multiples of `size`.
    /// Spans extending past the thread budget are never returned.
    pub fn find_available_hw_thread_id(&mut self, size: usize, occupy: bool) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let num_threads = self.hw_thread_ids.len();
        let start = (0..num_threads)
            .step_by(size)
            .take_while(|step| step + size <= num_threads)
            .find(|&step| self.hw_thread_ids[step..(step + size)].not_any())?;
        if occupy {
            self.hw_thread_ids[start..(start + size)].fill(true);
        }
        Some(start)
    }

    /// Checks whether a block fits, and reserves its resources if `occupy` is set.
    ///
    /// All budgets are checked before anything is committed.
    pub fn occupy(&mut self, request: &Request, occupy: bool) -> Result<(), Rejected> {
        let budget = self.budget;
        if self.num_threads + request.threads > budget.threads {
            return Err(Rejected::Threads {
                requested: request.threads,
                occupied: self.num_threads,
                limit: budget.threads,
            });
        }
        if self.find_available_hw_thread_id(request.threads, false).is_none() {
            return Err(Rejected::NoAlignedThreadIds {
                size: request.threads,
            });
        }
        if self.shared_memory + request.shared_memory > budget.shared_memory {
            return Err(Rejected::SharedMemory {
                requested: request.shared_memory,
                occupied: self.shared_memory,
                limit: budget.shared_memory,
            });
        }
        if self.registers + request.registers > budget.registers {
            return Err(Rejected::Registers {
                requested: request.registers,
                occupied: self.registers,
                limit: budget.registers,
            });
        }
        if self.num_blocks + 1 > budget.blocks {
            return Err(Rejected::Blocks {
                limit: budget.blocks,
            });
        }

        if occupy {
            self.num_threads += request.threads;
            self.shared_memory += request.shared_memory;
            self.registers += request.registers;
            self.num_blocks += 1;
            log::trace!(
                "occupied {} threads, {} shared mem, {} registers, {} blocks",
                self.num_threads,
                human_bytes::human_bytes(self.shared_memory as f64),
                self.registers,
                self.num_blocks,
            );
        }
        Ok(())
    }

    /// Binds a hardware block slot to its span of hardware thread ids.
    ///
    /// Returns the first hardware thread id of the block.
    ///
    /// # Panics
    /// If the block slot is already bound or no span is available,
    /// which cannot happen after a successful `occupy`.
    pub fn bind(&mut self, hw_block_id: usize, request: &Request) -> usize {
        let start_thread = self
            .find_available_hw_thread_id(request.threads, true)
            .unwrap_or_else(|| panic!("no free hardware threads for block slot {hw_block_id}"));
        let previous = self.block_to_hw_thread_id.insert(hw_block_id, start_thread);
        assert_eq!(previous, None, "block slot {hw_block_id} is already bound");
        start_thread
    }

    /// Returns the resources of a completed block.
    ///
    /// # Panics
    /// If any counter would underflow or the block slot is not bound.
    pub fn release(&mut self, hw_block_id: usize, request: &Request) {
        assert!(self.num_threads >= request.threads);
        self.num_threads -= request.threads;

        let start_thread = self
            .block_to_hw_thread_id
            .remove(&hw_block_id)
            .unwrap_or_else(|| panic!("block slot {hw_block_id} is not bound"));
        self.hw_thread_ids[start_thread..(start_thread + request.threads)].fill(false);

        assert!(self.shared_memory >= request.shared_memory);
        self.shared_memory -= request.shared_memory;

        assert!(self.registers >= request.registers);
        self.registers -= request.registers;

        assert!(self.num_blocks >= 1);
        self.num_blocks -= 1;
    }

    pub fn reset(&mut self) {
        self.num_threads = 0;
        self.shared_memory = 0;
        self.registers = 0;
        self.num_blocks = 0;
        self.hw_thread_ids.fill(false);
        self.block_to_hw_thread_id.clear();
    }
}
