//! Functional execution of admitted blocks.
//!
//! The timing model only asks the engine to bind threads to hardware slots
//! and reports back what each core retired in a cycle.

use crate::checkpoint;
use crate::kernel::{Kernel, KernelLaunch};
use crate::mem_fetch;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Per kernel resources reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Resources {
    /// Registers per thread
    pub num_registers: u32,
    /// Shared memory per block in bytes
    pub shared_mem_bytes: u32,
}

/// Hardware placement of a single thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadContext {
    pub kernel_id: u64,
    pub block_id: u64,
    pub thread_in_block: usize,
    pub hw_thread_id: usize,
    pub hw_block_id: usize,
    pub warp_id: usize,
    /// global core id
    pub core_id: usize,
}

/// What a core retired in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Retired warp instructions per kernel id
    pub instructions: SmallVec<[(u64, u64); 2]>,
    /// Hardware block ids whose threads all exited
    pub completed_blocks: SmallVec<[usize; 4]>,
    /// Memory accesses issued, tagged with the issuing kernel id
    pub accesses: SmallVec<[(u64, mem_fetch::Access); 4]>,
}

impl Progress {
    #[must_use]
    pub fn num_instructions(&self) -> u64 {
        self.instructions.iter().map(|(_, n)| n).sum()
    }

    pub fn add_instructions(&mut self, kernel_id: u64, n: u64) {
        match self.instructions.iter_mut().find(|(id, _)| *id == kernel_id) {
            Some((_, count)) => *count += n,
            None => self.instructions.push((kernel_id, n)),
        }
    }
}

/// A functional execution engine.
pub trait Engine: std::fmt::Debug {
    fn kernel_resources(&self, kernel: &KernelLaunch) -> Resources;

    /// Initializes a thread of an admitted block.
    ///
    /// Returns whether the thread is active.
    fn init_thread(&mut self, kernel: &Kernel, thread: &ThreadContext) -> bool;

    /// Restores the state of a thread saved by a checkpoint.
    fn resume_thread(&mut self, _thread: &ThreadContext, _state: checkpoint::ThreadState) {}

    /// Restores the shared memory of a block saved by a checkpoint.
    fn resume_shared_memory(&mut self, _core_id: usize, _hw_block_id: usize, _data: Vec<u8>) {}

    /// Advances all blocks resident on core `core_id` by one core cycle.
    fn cycle(&mut self, core_id: usize, cycle: u64) -> Progress;
}

/// Execution profile of a kernel under the synthetic engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Warp instructions every warp retires before it exits
    pub instructions_per_warp: u64,
    /// Every n-th warp instruction accesses memory (0 disables memory accesses)
    pub memory_access_interval: u64,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            instructions_per_warp: 100,
            memory_access_interval: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Block {
    hw_block_id: usize,
    kernel_id: u64,
    block_id: u64,
    warps: Vec<usize>,
    retired: u64,
    profile: Profile,
}

impl Block {
    fn total(&self) -> u64 {
        self.profile.instructions_per_warp * self.warps.len() as u64
    }

    fn done(&self) -> bool {
        self.retired >= self.total()
    }
}

/// Deterministic engine with a fixed issue width per core.
///
/// Each cycle a core retires up to `issue_width` warp instructions, taking at
/// most one instruction per warp and rotating over resident blocks.
/// Kernels sharing a core thereby compete for issue slots.
#[derive(Debug, Clone)]
pub struct Synthetic {
    pub issue_width: usize,
    pub default_profile: Profile,
    profiles: HashMap<u64, Profile>,
    blocks: HashMap<usize, Vec<Block>>,
    next_block: HashMap<usize, usize>,
    pub num_resumed_threads: usize,
    pub num_resumed_shared_memory_bytes: usize,
}

impl Default for Synthetic {
    fn default() -> Self {
        Self::new(4, Profile::default())
    }
}

impl Synthetic {
    #[must_use]
    pub fn new(issue_width: usize, default_profile: Profile) -> Self {
        Self {
            issue_width,
            default_profile,
            profiles: HashMap::new(),
            blocks: HashMap::new(),
            next_block: HashMap::new(),
            num_resumed_threads: 0,
            num_resumed_shared_memory_bytes: 0,
        }
    }

    pub fn set_profile(&mut self, kernel_id: u64, profile: Profile) {
        self.profiles.insert(kernel_id, profile);
    }

    #[must_use]
    pub fn profile(&self, kernel_id: u64) -> Profile {
        self.profiles
            .get(&kernel_id)
            .copied()
            .unwrap_or(self.default_profile)
    }

    #[must_use]
    pub fn num_resident_blocks(&self, core_id: usize) -> usize {
        self.blocks.get(&core_id).map_or(0, Vec::len)
    }

    fn address(block: &Block, warp_id: usize) -> u64 {
        const WARP_FOOTPRINT: u64 = 128;
        ((block.kernel_id << 32) | (block.block_id << 12))
            + warp_id as u64 * WARP_FOOTPRINT
            + block.retired * 4
    }
}

impl Engine for Synthetic {
    fn kernel_resources(&self, kernel: &KernelLaunch) -> Resources {
        Resources {
            num_registers: kernel.num_registers,
            shared_mem_bytes: kernel.shared_mem_bytes,
        }
    }

    fn init_thread(&mut self, kernel: &Kernel, thread: &ThreadContext) -> bool {
        let profile = self.profile(kernel.id());
        let blocks = self.blocks.entry(thread.core_id).or_default();
        let block = match blocks
            .iter_mut()
            .position(|block| block.hw_block_id == thread.hw_block_id)
        {
            Some(idx) => &mut blocks[idx],
            None => {
                blocks.push(Block {
                    hw_block_id: thread.hw_block_id,
                    kernel_id: thread.kernel_id,
                    block_id: thread.block_id,
                    warps: Vec::new(),
                    retired: 0,
                    profile,
                });
                let last = blocks.len() - 1;
                &mut blocks[last]
            }
        };
        debug_assert_eq!(block.block_id, thread.block_id);
        if !block.warps.contains(&thread.warp_id) {
            block.warps.push(thread.warp_id);
        }
        true
    }

    fn resume_thread(&mut self, thread: &ThreadContext, state: checkpoint::ThreadState) {
        log::trace!(
            "resume thread {} of block {} with {} registers",
            thread.thread_in_block,
            thread.block_id,
            state.registers.len()
        );
        self.num_resumed_threads += 1;
    }

    fn resume_shared_memory(&mut self, _core_id: usize, _hw_block_id: usize, data: Vec<u8>) {
        self.num_resumed_shared_memory_bytes += data.len();
    }

    fn cycle(&mut self, core_id: usize, _cycle: u64) -> Progress {
        let mut progress = Progress::default();
        let Some(blocks) = self.blocks.get_mut(&core_id) else {
            return progress;
        };
        if blocks.is_empty() {
            return progress;
        }

        let num_blocks = blocks.len();
        let start = self.next_block.get(&core_id).copied().unwrap_or(0) % num_blocks;
        let mut slots = self.issue_width;

        for i in 0..num_blocks {
            if slots == 0 {
                break;
            }
            let block = &mut blocks[(start + i) % num_blocks];
            let remaining = block.total() - block.retired;
            let issued = (block.warps.len() as u64).min(remaining).min(slots as u64);
            for warp in 0..issued {
                let interval = block.profile.memory_access_interval;
                if interval > 0 && (block.retired + warp + 1) % interval == 0 {
                    let warp_id = block.warps[warp as usize];
                    let access = mem_fetch::Access {
                        addr: Self::address(block, warp_id),
                        kind: if (block.retired + warp) % 4 == 0 {
                            mem_fetch::AccessKind::Write
                        } else {
                            mem_fetch::AccessKind::Read
                        },
                        data_size: 32,
                    };
                    progress.accesses.push((block.kernel_id, access));
                }
            }
            block.retired += issued;
            slots -= issued as usize;
            progress.add_instructions(block.kernel_id, issued);
        }
        self.next_block.insert(core_id, (start + 1) % num_blocks);

        blocks.retain(|block| {
            if block.done() {
                progress.completed_blocks.push(block.hw_block_id);
                false
            } else {
                true
            }
        });
        progress
    }
}
