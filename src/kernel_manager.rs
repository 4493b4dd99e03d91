use crate::{config, kernel::Kernel, kernel::Status};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;

pub trait SelectKernel: std::fmt::Debug {
    fn select_kernel(&self, cycle: u64) -> Option<Arc<Kernel>>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("limit of {max_concurrent_kernels} concurrent kernels reached")]
    LimitReached { max_concurrent_kernels: usize },

    #[error("block size of {threads_per_block} threads too large (limit is {max_threads_per_block} threads per block)")]
    BlockSizeTooLarge {
        threads_per_block: usize,
        max_threads_per_block: usize,
    },
}

#[derive(Debug)]
pub struct KernelManager {
    /// Kernels selected for execution at least once, in order of first selection.
    pub executed_kernels: RwLock<IndexMap<u64, Arc<Kernel>>>,

    running_kernels: Box<[Option<Arc<Kernel>>]>,
    last_issued_kernel: Mutex<usize>,
    finished_kernels: VecDeque<u64>,
    pub config: Arc<config::GPU>,
}

impl KernelManager {
    #[must_use]
    pub fn new(config: Arc<config::GPU>) -> Self {
        let running_kernels = vec![None; config.max_concurrent_kernels].into_boxed_slice();
        Self {
            executed_kernels: RwLock::new(IndexMap::new()),
            running_kernels,
            last_issued_kernel: Mutex::new(0),
            finished_kernels: VecDeque::new(),
            config,
        }
    }

    /// Kernels currently resident, in slot order.
    pub fn running_kernels(&self) -> impl Iterator<Item = &Arc<Kernel>> + '_ {
        self.running_kernels.iter().filter_map(Option::as_ref)
    }

    #[must_use]
    pub fn num_running_kernels(&self) -> usize {
        self.running_kernels().count()
    }

    /// Number of blocks issued by all kernels selected so far.
    #[must_use]
    pub fn num_issued_blocks(&self) -> u64 {
        self.executed_kernels
            .read()
            .values()
            .map(|kernel| kernel.num_issued_blocks())
            .sum()
    }

    /// Whether the global block ceiling is reached.
    #[must_use]
    pub fn hit_max_block_count(&self) -> bool {
        match self.config.limits.max_blocks {
            Some(max_blocks) => self.num_issued_blocks() >= max_blocks,
            None => false,
        }
    }

    #[must_use]
    pub fn kernel_more_blocks_left(&self, kernel: &Kernel) -> bool {
        !self.hit_max_block_count() && !kernel.no_more_blocks_to_run()
    }

    #[must_use]
    pub fn more_blocks_to_run(&self) -> bool {
        !self.hit_max_block_count()
            && self
                .running_kernels()
                .any(|kernel| !kernel.no_more_blocks_to_run())
    }

    #[must_use]
    pub fn can_start_kernel(&self) -> bool {
        self.running_kernels.iter().any(|slot| match slot {
            Some(kernel) => kernel.done(),
            None => true,
        })
    }

    /// Places a kernel into the first free slot.
    ///
    /// A slot is free if it is empty or holds a kernel that is done.
    pub fn launch(&mut self, kernel: Arc<Kernel>, cycle: u64) -> Result<(), LaunchError> {
        let threads_per_block = kernel.threads_per_block();
        let max_threads_per_block = self.config.max_threads_per_core;
        if threads_per_block > max_threads_per_block {
            log::error!(
                "{kernel}: block size {threads_per_block} exceeds the {max_threads_per_block} threads of a core",
            );
            return Err(LaunchError::BlockSizeTooLarge {
                threads_per_block,
                max_threads_per_block,
            });
        }

        let max_concurrent_kernels = self.running_kernels.len();
        let free_slot = self
            .running_kernels
            .iter_mut()
            .find(|slot| slot.as_ref().map_or(true, |kernel| kernel.done()))
            .ok_or(LaunchError::LimitReached {
                max_concurrent_kernels,
            })?;

        log::debug!("launching {kernel} at cycle {cycle}");
        kernel.set_status(Status::Init);
        kernel.set_launched();
        *free_slot = Some(kernel);
        Ok(())
    }

    /// Removes a finished kernel from its slot.
    ///
    /// # Panics
    /// If the kernel is not resident.
    pub fn set_kernel_done(&mut self, kernel: &Kernel, cycle: u64) {
        let slot = self
            .running_kernels
            .iter_mut()
            .find(|slot| slot.as_deref().map(Kernel::id) == Some(kernel.id()))
            .unwrap_or_else(|| panic!("{kernel} is not running"));
        log::debug!("{kernel} done at cycle {cycle}");
        kernel.set_completed(cycle);
        kernel.set_status(Status::Done);
        self.finished_kernels.push_back(kernel.id());
        *slot = None;
    }

    /// Finds a kernel that completed all its blocks and marks it done.
    pub fn get_finished_kernel(&mut self, cycle: u64) -> Option<Arc<Kernel>> {
        let finished = self
            .running_kernels()
            .find(|kernel| kernel.no_more_blocks_to_run() && !kernel.running() && kernel.launched())
            .map(Arc::clone)?;
        self.set_kernel_done(&finished, cycle);
        Some(finished)
    }

    /// Pops the id of the oldest kernel that finished.
    pub fn finished_kernel(&mut self) -> Option<u64> {
        self.finished_kernels.pop_front()
    }

    pub fn stop_all_running_kernels(&mut self, cycle: u64) {
        let running: Vec<_> = self.running_kernels().map(Arc::clone).collect();
        for kernel in running {
            self.set_kernel_done(&kernel, cycle);
        }
    }

    /// Kernels a core may issue a block of, in order of preference.
    ///
    /// The selected kernel comes first, followed by all other resident
    /// kernels with blocks left that are restricted by a per core quota,
    /// so that a kernel that exhausted its quota does not starve the others.
    pub fn candidate_kernels(&self, cycle: u64) -> SmallVec<[Arc<Kernel>; 2]> {
        let mut candidates: SmallVec<[Arc<Kernel>; 2]> = SmallVec::new();
        let selected = self.select_kernel(cycle);
        let selected_id = selected.as_ref().map(|kernel| kernel.id());
        candidates.extend(selected);
        for kernel in self.running_kernels() {
            if Some(kernel.id()) != selected_id
                && kernel.quota().is_some()
                && self.kernel_more_blocks_left(kernel)
            {
                self.record_executed(kernel, cycle);
                candidates.push(Arc::clone(kernel));
            }
        }
        candidates
    }

    fn record_executed(&self, kernel: &Arc<Kernel>, cycle: u64) {
        let mut executed = self.executed_kernels.write();
        if !executed.contains_key(&kernel.id()) {
            kernel.set_started(cycle);
            executed.insert(kernel.id(), Arc::clone(kernel));
        }
    }
}

impl SelectKernel for KernelManager {
    fn select_kernel(&self, cycle: u64) -> Option<Arc<Kernel>> {
        let mut last_issued_kernel = self.last_issued_kernel.lock();

        // issue same kernel again
        if let Some(ref last_kernel) = self.running_kernels[*last_issued_kernel] {
            if self.kernel_more_blocks_left(last_kernel) {
                self.record_executed(last_kernel, cycle);
                return Some(Arc::clone(last_kernel));
            }
        }

        // issue new kernel
        let num_kernels = self.running_kernels.len();
        for n in 0..num_kernels {
            let idx = (n + *last_issued_kernel + 1) % num_kernels;
            match self.running_kernels[idx] {
                Some(ref kernel) if self.kernel_more_blocks_left(kernel) => {
                    log::trace!(
                        "select kernel: running_kernels[{idx}] {kernel} with {}/{} blocks issued",
                        kernel.num_issued_blocks(),
                        kernel.num_blocks(),
                    );
                    *last_issued_kernel = idx;
                    self.record_executed(kernel, cycle);
                    return Some(Arc::clone(kernel));
                }
                _ => {}
            }
        }
        None
    }
}
