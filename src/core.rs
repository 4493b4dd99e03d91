use crate::exec::{self, Engine};
use crate::kernel::Kernel;
use crate::occupancy::{self, Occupancy};
use crate::{checkpoint, config, mem_fetch};
use color_eyre::eyre;
use console::style;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Checkpoint store and the range of blocks that resume from it.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint<'a> {
    pub resume: &'a config::Resume,
    pub store: &'a dyn checkpoint::Store,
}

/// Checkpoint state of a block, loaded before the block is admitted.
#[derive(Debug, Default)]
struct ResumedBlock {
    threads: Vec<Option<checkpoint::ThreadState>>,
    shared_memory: Option<Vec<u8>>,
}

impl ResumedBlock {
    fn load(checkpoint: Checkpoint<'_>, kernel: &Kernel, block_id: u64) -> eyre::Result<Self> {
        let threads = (0..kernel.threads_per_block())
            .map(|thread_in_block| {
                checkpoint
                    .store
                    .load_thread(kernel.id(), thread_in_block, block_id)
            })
            .collect::<eyre::Result<Vec<_>>>()?;
        let shared_memory = checkpoint.store.load_shared_memory(kernel.id(), block_id)?;
        Ok(Self {
            threads,
            shared_memory,
        })
    }
}

#[derive(Debug, Clone)]
struct ResidentBlock {
    kernel: Arc<Kernel>,
    block_id: u64,
    request: occupancy::Request,
    num_threads: usize,
}

/// A shader core holding up to `max_concurrent_blocks_per_core` blocks.
///
/// Blocks are admitted through the core's [`Occupancy`] when kernels may
/// share the core, and placed at `hw_block_id * padded_block_size`
/// otherwise.
pub struct Core {
    /// Position of the core within its cluster
    pub core_id: usize,
    pub global_core_id: usize,
    pub cluster_id: usize,
    pub config: Arc<config::GPU>,
    pub occupancy: Occupancy,

    blocks: Box<[Option<ResidentBlock>]>,
    num_active_blocks: usize,
    num_active_threads: usize,

    /// Kernel the core issues blocks for when kernels do not share cores
    pub current_kernel: Option<Arc<Kernel>>,
    pub current_kernel_max_blocks: usize,
    pub thread_block_size: usize,

    /// Memory requests waiting for the interconnect
    pub memory_requests: VecDeque<mem_fetch::MemFetch>,
    pub num_responses: u64,
    fetch_uid: Arc<AtomicU64>,
    l1_dirty_lines: usize,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Core@{}-{}", self.cluster_id, self.core_id)
    }
}

impl Core {
    #[must_use]
    pub fn new(
        cluster_id: usize,
        core_id: usize,
        fetch_uid: Arc<AtomicU64>,
        config: Arc<config::GPU>,
    ) -> Self {
        let blocks = vec![None; config.max_concurrent_blocks_per_core].into_boxed_slice();
        Self {
            core_id,
            global_core_id: config.global_core_id(cluster_id, core_id),
            cluster_id,
            occupancy: Occupancy::new(occupancy::Budget::from(&*config)),
            blocks,
            num_active_blocks: 0,
            num_active_threads: 0,
            current_kernel: None,
            current_kernel_max_blocks: 0,
            thread_block_size: 0,
            memory_requests: VecDeque::new(),
            num_responses: 0,
            fetch_uid,
            l1_dirty_lines: 0,
            config,
        }
    }

    #[must_use]
    pub fn id(&self) -> (usize, usize) {
        (self.cluster_id, self.core_id)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.num_active_blocks > 0
    }

    #[must_use]
    pub fn num_active_blocks(&self) -> usize {
        self.num_active_blocks
    }

    /// Number of threads that did not complete yet.
    #[must_use]
    pub fn not_completed(&self) -> usize {
        self.num_active_threads
    }

    /// Number of resident blocks of kernel `kernel_id`.
    #[must_use]
    pub fn num_blocks_of(&self, kernel_id: u64) -> usize {
        self.blocks
            .iter()
            .flatten()
            .filter(|block| block.kernel.id() == kernel_id)
            .count()
    }

    /// Resident kernels and their number of blocks on this core.
    #[must_use]
    pub fn resident_kernels(&self) -> Vec<(Arc<Kernel>, usize)> {
        let mut resident: Vec<(Arc<Kernel>, usize)> = Vec::new();
        for block in self.blocks.iter().flatten() {
            match resident
                .iter_mut()
                .find(|(kernel, _)| kernel.id() == block.kernel.id())
            {
                Some((_, count)) => *count += 1,
                None => resident.push((Arc::clone(&block.kernel), 1)),
            }
        }
        resident
    }

    pub fn can_issue_block(&mut self, kernel: &Kernel) -> bool {
        let max_blocks = match self.config.max_blocks(kernel) {
            Ok(max_blocks) => max_blocks,
            Err(err) => {
                log::trace!("core {:?}: {err}", self.id());
                return false;
            }
        };
        if self.config.concurrent_kernel_sm {
            let request = occupancy::Request::new(kernel, &self.config);
            match self.occupancy.occupy(&request, false) {
                Ok(()) => true,
                Err(rejected) => {
                    log::trace!("core {:?}: cannot issue {kernel}: {rejected}", self.id());
                    false
                }
            }
        } else {
            self.num_active_blocks < max_blocks
        }
    }

    /// Admits the next block of `kernel`.
    ///
    /// Returns the id of the issued block, or `None` if the kernel has no
    /// blocks left or the core has no room for it.
    #[tracing::instrument(name = "core_issue_block", skip(engine, checkpoint))]
    pub fn issue_block(
        &mut self,
        kernel: &Arc<Kernel>,
        engine: &mut dyn Engine,
        checkpoint: Option<Checkpoint<'_>>,
        cycle: u64,
    ) -> eyre::Result<Option<u64>> {
        let Some(block_id) = kernel.next_block() else {
            return Ok(None);
        };
        let request = occupancy::Request::new(kernel, &self.config);

        // find a free block context
        let Some(hw_block_id) = self.blocks.iter().position(Option::is_none) else {
            log::debug!("core {:?}: no free block slot", self.id());
            return Ok(None);
        };

        // max block count for address mapping when kernels do not share the core
        let exclusive_max_blocks = if self.config.concurrent_kernel_sm {
            if let Err(rejected) = self.occupancy.occupy(&request, false) {
                log::debug!("core {:?}: rejected {kernel}: {rejected}", self.id());
                return Ok(None);
            }
            None
        } else {
            Some(self.config.max_blocks(kernel)?)
        };

        // nothing is committed before the checkpoint state is loaded
        let mut resumed = match checkpoint
            .filter(|checkpoint| checkpoint.resume.applies_to(kernel.id(), block_id))
        {
            Some(checkpoint) => Some(ResumedBlock::load(checkpoint, kernel, block_id)?),
            None => None,
        };

        if !kernel.claim_block(block_id) {
            log::debug!("core {:?}: block {block_id} of {kernel} was already issued", self.id());
            return Ok(None);
        }
        let start_thread = match exclusive_max_blocks {
            None => {
                self.occupancy
                    .occupy(&request, true)
                    .map_err(|rejected| eyre::eyre!("core {:?}: {rejected}", self.id()))?;
                self.occupancy.bind(hw_block_id, &request)
            }
            Some(max_blocks) => {
                self.current_kernel_max_blocks = max_blocks;
                self.thread_block_size = request.threads;
                hw_block_id * request.threads
            }
        };
        log::debug!(
            "{}",
            style(format!(
                "cycle {cycle:02} core {:?}: issue block {block_id} of {kernel} to hw block {hw_block_id} (threads {}..{})",
                self.id(),
                start_thread,
                start_thread + kernel.threads_per_block(),
            ))
            .green()
        );

        let mut num_threads = 0;
        for thread_in_block in 0..kernel.threads_per_block() {
            let hw_thread_id = start_thread + thread_in_block;
            let thread = exec::ThreadContext {
                kernel_id: kernel.id(),
                block_id,
                thread_in_block,
                hw_thread_id,
                hw_block_id,
                warp_id: hw_thread_id / self.config.warp_size,
                core_id: self.global_core_id,
            };
            if engine.init_thread(kernel, &thread) {
                num_threads += 1;
            }
            let state = resumed
                .as_mut()
                .and_then(|resumed| resumed.threads.get_mut(thread_in_block))
                .and_then(Option::take);
            if let Some(state) = state {
                engine.resume_thread(&thread, state);
            }
        }
        if let Some(data) = resumed.and_then(|resumed| resumed.shared_memory) {
            engine.resume_shared_memory(self.global_core_id, hw_block_id, data);
        }

        kernel.increment_running_blocks();
        self.blocks[hw_block_id] = Some(ResidentBlock {
            kernel: Arc::clone(kernel),
            block_id,
            request,
            num_threads,
        });
        self.num_active_blocks += 1;
        self.num_active_threads += num_threads;
        Ok(Some(block_id))
    }

    fn release_block(&mut self, hw_block_id: usize, cycle: u64) {
        let block = self.blocks[hw_block_id]
            .take()
            .unwrap_or_else(|| panic!("core {:?}: hw block {hw_block_id} is not active", self.id()));
        if self.config.concurrent_kernel_sm {
            self.occupancy.release(hw_block_id, &block.request);
        }
        log::debug!(
            "cycle {cycle:02} core {:?}: block {} of {} completed (hw block {hw_block_id})",
            self.id(),
            block.block_id,
            block.kernel,
        );
        block.kernel.decrement_running_blocks();
        self.num_active_blocks -= 1;
        self.num_active_threads -= block.num_threads;
    }

    fn resident_kernel(&self, kernel_id: u64) -> Option<&Arc<Kernel>> {
        self.blocks
            .iter()
            .flatten()
            .map(|block| &block.kernel)
            .find(|kernel| kernel.id() == kernel_id)
    }

    /// Advances the core by one cycle.
    #[tracing::instrument(name = "core_cycle", skip(engine))]
    pub fn cycle(&mut self, engine: &mut dyn Engine, cycle: u64) -> exec::Progress {
        if !self.is_active() {
            return exec::Progress::default();
        }
        let progress = engine.cycle(self.global_core_id, cycle);

        for &(kernel_id, num_instructions) in &progress.instructions {
            match self.resident_kernel(kernel_id) {
                Some(kernel) => kernel.add_instructions(num_instructions),
                None => log::warn!(
                    "core {:?}: retired {num_instructions} instructions of kernel {kernel_id} which is not resident",
                    self.id()
                ),
            }
        }

        let num_sub_partitions = self.config.num_sub_partitions();
        for &(kernel_id, access) in &progress.accesses {
            if access.kind == mem_fetch::AccessKind::Write {
                self.l1_dirty_lines += 1;
            }
            let fetch = mem_fetch::MemFetch {
                uid: self.fetch_uid.fetch_add(1, Ordering::Relaxed),
                kernel_id,
                core_id: self.global_core_id,
                cluster_id: self.cluster_id,
                sub_partition_id: mem_fetch::sub_partition_id(access.addr, num_sub_partitions),
                access,
                is_reply: false,
                status: mem_fetch::Status::InCoreQueue,
            };
            self.memory_requests.push_back(fetch);
        }

        for &hw_block_id in &progress.completed_blocks {
            self.release_block(hw_block_id, cycle);
        }
        progress
    }

    pub fn accept_response(&mut self, mut fetch: mem_fetch::MemFetch) {
        debug_assert_eq!(fetch.core_id, self.global_core_id);
        fetch.set_status(mem_fetch::Status::InInterconnToCoreQueue);
        log::trace!("core {:?}: received {fetch}", self.id());
        self.num_responses += 1;
    }

    /// Flushes the L1 cache and returns the number of dirty lines written back.
    pub fn flush_l1(&mut self) -> usize {
        std::mem::take(&mut self.l1_dirty_lines)
    }
}

#[cfg(test)]
mod tests {
    use super::{Checkpoint, Core};
    use crate::exec::{self, Engine};
    use crate::kernel::{Kernel, KernelLaunch};
    use crate::{checkpoint, config, testing};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    /// Records thread placement, blocks never complete.
    #[derive(Debug, Default)]
    struct Recorder {
        threads: Vec<exec::ThreadContext>,
    }

    impl Engine for Recorder {
        fn kernel_resources(&self, kernel: &KernelLaunch) -> exec::Resources {
            exec::Resources {
                num_registers: kernel.num_registers,
                shared_mem_bytes: kernel.shared_mem_bytes,
            }
        }

        fn init_thread(&mut self, _kernel: &Kernel, thread: &exec::ThreadContext) -> bool {
            self.threads.push(*thread);
            true
        }

        fn cycle(&mut self, _core_id: usize, _cycle: u64) -> exec::Progress {
            exec::Progress::default()
        }
    }

    fn core(config: config::GPU) -> Core {
        Core::new(1, 1, Arc::new(AtomicU64::new(0)), Arc::new(config))
    }

    #[test]
    fn test_exclusive_placement() -> eyre::Result<()> {
        let mut core = core(testing::small_gpu());
        let mut engine = Recorder::default();
        let kernel = testing::kernel(1, 1000, 100);

        assert!(core.can_issue_block(&kernel));
        diff::assert_eq!(core.issue_block(&kernel, &mut engine, None, 0)?, Some(0));
        diff::assert_eq!(core.issue_block(&kernel, &mut engine, None, 0)?, Some(1));
        diff::assert_eq!(core.global_core_id, 3);

        // the second block starts at hw block 1 * 128 padded threads
        let second: Vec<_> = engine.threads.iter().filter(|t| t.block_id == 1).collect();
        diff::assert_eq!(second.len(), 100);
        diff::assert_eq!(second[0].hw_thread_id, 128);
        diff::assert_eq!(second[0].hw_block_id, 1);
        diff::assert_eq!(second[0].warp_id, 4);
        diff::assert_eq!(core.not_completed(), 200);
        diff::assert_eq!(core.thread_block_size, 128);
        diff::assert_eq!(kernel.num_running_blocks(), 2);
        Ok(())
    }

    #[test]
    fn test_exclusive_mode_respects_max_blocks() -> eyre::Result<()> {
        let mut core = core(testing::small_gpu());
        let mut engine = Recorder::default();
        // 1024 threads: at most two blocks per core
        let kernel = testing::kernel(1, 1000, 1024);
        while core.can_issue_block(&kernel) {
            core.issue_block(&kernel, &mut engine, None, 0)?;
        }
        diff::assert_eq!(core.num_active_blocks(), 2);
        diff::assert_eq!(core.current_kernel_max_blocks, 2);
        Ok(())
    }

    #[test]
    fn test_full_core_rejects_second_block_until_release() -> eyre::Result<()> {
        let config = config::GPU {
            max_threads_per_core: 1024,
            concurrent_kernel_sm: true,
            ..testing::small_gpu()
        };
        let mut core = core(config);
        let mut engine = exec::Synthetic::new(
            32,
            exec::Profile {
                instructions_per_warp: 2,
                memory_access_interval: 0,
            },
        );
        let big = testing::kernel(1, 1, 1024);
        let small = testing::kernel(2, 4, 32);

        assert!(core.can_issue_block(&big));
        diff::assert_eq!(core.issue_block(&big, &mut engine, None, 0)?, Some(0));
        diff::assert_eq!(core.occupancy.num_threads, 1024);
        assert!(!core.can_issue_block(&small));
        diff::assert_eq!(core.issue_block(&small, &mut engine, None, 0)?, None);
        diff::assert_eq!(small.num_issued_blocks(), 0);

        // 32 warps * 2 instructions at 32 per cycle
        let progress = core.cycle(&mut engine, 1);
        assert!(progress.completed_blocks.is_empty());
        let progress = core.cycle(&mut engine, 2);
        diff::assert_eq!(progress.completed_blocks.to_vec(), vec![0]);
        diff::assert_eq!(big.num_instructions(), 64);
        assert!(big.done());

        diff::assert_eq!(core.occupancy.num_threads, 0);
        assert!(core.can_issue_block(&small));
        diff::assert_eq!(core.issue_block(&small, &mut engine, None, 3)?, Some(0));
        Ok(())
    }

    #[test]
    fn test_shared_mode_mixes_kernels() -> eyre::Result<()> {
        let config = config::GPU {
            concurrent_kernel_sm: true,
            ..testing::small_gpu()
        };
        let mut core = core(config);
        let mut engine = Recorder::default();
        let a = testing::kernel_with_resources(1, 100, 256, 32, 0);
        let b = testing::kernel_with_resources(2, 100, 128, 16, 8 * 1024);

        core.issue_block(&a, &mut engine, None, 0)?;
        core.issue_block(&b, &mut engine, None, 0)?;
        core.issue_block(&a, &mut engine, None, 0)?;
        diff::assert_eq!(core.num_blocks_of(1), 2);
        diff::assert_eq!(core.num_blocks_of(2), 1);
        diff::assert_eq!(core.occupancy.num_threads, 640);
        diff::assert_eq!(core.occupancy.registers, 2 * 256 * 32 + 128 * 16);
        diff::assert_eq!(core.occupancy.shared_memory, 8 * 1024);

        // a 128 thread block after a 256 thread block starts at the next aligned offset
        let b_start = engine
            .threads
            .iter()
            .find(|t| t.kernel_id == 2)
            .map(|t| t.hw_thread_id);
        diff::assert_eq!(b_start, Some(256));
        Ok(())
    }

    /// Store whose thread state cannot be read.
    #[derive(Debug)]
    struct Unreadable;

    impl checkpoint::Store for Unreadable {
        fn load_thread(
            &self,
            _kernel_id: u64,
            thread_in_block: usize,
            block_id: u64,
        ) -> eyre::Result<Option<checkpoint::ThreadState>> {
            eyre::bail!("thread {thread_in_block} of block {block_id} is corrupted")
        }

        fn load_shared_memory(
            &self,
            _kernel_id: u64,
            _block_id: u64,
        ) -> eyre::Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    #[test]
    fn test_failed_checkpoint_load_leaves_core_untouched() -> eyre::Result<()> {
        let mut core = core(config::GPU {
            concurrent_kernel_sm: true,
            ..testing::small_gpu()
        });
        let mut engine = Recorder::default();
        let kernel = testing::kernel(3, 4, 64);
        let resume = config::Resume {
            kernel_id: 3,
            resume_block: 0,
            checkpoint_block: 1,
        };
        let checkpoint = Checkpoint {
            resume: &resume,
            store: &Unreadable,
        };

        assert!(core
            .issue_block(&kernel, &mut engine, Some(checkpoint), 0)
            .is_err());
        assert!(core.occupancy.is_empty());
        diff::assert_eq!(core.occupancy.num_threads, 0);
        diff::assert_eq!(core.num_active_blocks(), 0);
        diff::assert_eq!(core.not_completed(), 0);
        diff::assert_eq!(kernel.next_block(), Some(0));
        diff::assert_eq!(kernel.num_running_blocks(), 0);
        assert!(engine.threads.is_empty());

        // the same block issues once it no longer resumes
        diff::assert_eq!(core.issue_block(&kernel, &mut engine, None, 0)?, Some(0));
        diff::assert_eq!(core.occupancy.num_threads, 64);
        Ok(())
    }

    #[test]
    fn test_resume_from_checkpoint() -> eyre::Result<()> {
        let mut core = core(testing::small_gpu());
        let mut engine = exec::Synthetic::default();
        let kernel = testing::kernel(3, 8, 64);

        let mut store = checkpoint::InMemory::default();
        for block_id in 0..8 {
            for thread in 0..64 {
                store.insert_thread(3, thread, block_id, checkpoint::ThreadState::default());
            }
            store.insert_shared_memory(3, block_id, vec![0; 16]);
        }
        let resume = config::Resume {
            kernel_id: 3,
            resume_block: 1,
            checkpoint_block: 2,
        };
        let checkpoint = Checkpoint {
            resume: &resume,
            store: &store,
        };
        for _ in 0..3 {
            core.issue_block(&kernel, &mut engine, Some(checkpoint), 0)?;
        }
        // only block 1 resumes
        diff::assert_eq!(engine.num_resumed_threads, 64);
        diff::assert_eq!(engine.num_resumed_shared_memory_bytes, 16);
        Ok(())
    }

    #[test]
    fn test_memory_requests_and_l1_flush() -> eyre::Result<()> {
        let mut core = core(testing::small_gpu());
        let mut engine = exec::Synthetic::new(
            4,
            exec::Profile {
                instructions_per_warp: 8,
                memory_access_interval: 1,
            },
        );
        let kernel = testing::kernel(1, 1, 128);
        core.issue_block(&kernel, &mut engine, None, 0)?;
        let progress = core.cycle(&mut engine, 1);
        diff::assert_eq!(progress.accesses.len(), 4);
        diff::assert_eq!(core.memory_requests.len(), 4);
        assert!(core
            .memory_requests
            .iter()
            .all(|fetch| fetch.core_id == 3 && fetch.cluster_id == 1));
        diff::assert_eq!(core.flush_l1(), 1);
        diff::assert_eq!(core.flush_l1(), 0);
        Ok(())
    }
}
