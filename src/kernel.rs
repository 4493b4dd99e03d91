use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Per core block quota of a kernel, indexed by core position within a cluster.
pub type Quota = SmallVec<[usize; 4]>;

/// Lifecycle of a kernel under co-execution.
#[derive(
    strum::Display, strum::EnumIter, Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Init,
    Ready,
    Reschedule,
    Evicted,
    Done,
}

/// Launch configuration of a kernel.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelLaunch {
    pub id: u64,
    pub name: String,
    pub stream_id: u64,
    /// Number of blocks in the grid
    pub num_blocks: u32,
    pub threads_per_block: usize,
    /// Registers per thread
    pub num_registers: u32,
    /// Shared memory per block in bytes
    pub shared_mem_bytes: u32,
}

/// A kernel and its state of execution.
///
/// Kernels are shared between the kernel manager, the executed kernel ledger
/// and the cores running their blocks, hence all mutable state uses interior
/// mutability.
pub struct Kernel {
    config: KernelLaunch,
    next_block: AtomicU64,
    running_blocks: AtomicUsize,
    launched: AtomicBool,
    status: RwLock<Status>,
    /// `None` means the kernel is not restricted by a quota
    max_blocks_per_core: RwLock<Option<Quota>>,
    num_exceeded_blocks: AtomicUsize,
    num_instructions: AtomicU64,

    start_cycle: Mutex<Option<u64>>,
    completed_cycle: Mutex<Option<u64>>,
    start_time: Mutex<Option<std::time::Instant>>,
    completed_time: Mutex<Option<std::time::Instant>>,
}

impl PartialEq for Kernel {
    fn eq(&self, other: &Self) -> bool {
        self.config.id == other.config.id
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.config.name)
            .field("id", &self.config.id)
            .field("status", &*self.status.read())
            .finish()
    }
}

impl std::fmt::Display for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Kernel({}, id={})", self.config.name, self.config.id)
    }
}

impl Kernel {
    #[must_use]
    pub fn new(config: KernelLaunch) -> Self {
        Self {
            config,
            next_block: AtomicU64::new(0),
            running_blocks: AtomicUsize::new(0),
            launched: AtomicBool::new(false),
            status: RwLock::new(Status::Init),
            max_blocks_per_core: RwLock::new(None),
            num_exceeded_blocks: AtomicUsize::new(0),
            num_instructions: AtomicU64::new(0),
            start_cycle: Mutex::new(None),
            completed_cycle: Mutex::new(None),
            start_time: Mutex::new(None),
            completed_time: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.config.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &KernelLaunch {
        &self.config
    }

    #[must_use]
    pub fn num_blocks(&self) -> u64 {
        u64::from(self.config.num_blocks)
    }

    #[must_use]
    pub fn threads_per_block(&self) -> usize {
        self.config.threads_per_block
    }

    /// Id of the next block to be issued, if any.
    #[must_use]
    pub fn next_block(&self) -> Option<u64> {
        let next = self.next_block.load(Ordering::Acquire);
        (next < self.num_blocks()).then_some(next)
    }

    /// Claims the next block id.
    pub fn take_next_block(&self) -> Option<u64> {
        let num_blocks = self.num_blocks();
        self.next_block
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < num_blocks).then_some(next + 1)
            })
            .ok()
    }

    /// Claims `block_id` if it is still the next block to be issued.
    pub fn claim_block(&self, block_id: u64) -> bool {
        block_id < self.num_blocks()
            && self
                .next_block
                .compare_exchange(block_id, block_id + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    #[must_use]
    pub fn num_issued_blocks(&self) -> u64 {
        self.next_block.load(Ordering::Acquire).min(self.num_blocks())
    }

    #[must_use]
    pub fn no_more_blocks_to_run(&self) -> bool {
        self.next_block().is_none()
    }

    pub fn increment_running_blocks(&self) {
        self.running_blocks.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_running_blocks(&self) {
        let previous = self.running_blocks.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "{self} has no running blocks");
    }

    #[must_use]
    pub fn num_running_blocks(&self) -> usize {
        self.running_blocks.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.num_running_blocks() > 0
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.no_more_blocks_to_run() && !self.running()
    }

    pub fn set_launched(&self) {
        self.launched.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn launched(&self) -> bool {
        self.launched.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn set_status(&self, status: Status) {
        let mut current = self.status.write();
        if *current != status {
            log::debug!("{self}: status {} => {}", *current, status);
        }
        *current = status;
    }

    /// Block quota for the core at `position` within its cluster.
    #[must_use]
    pub fn max_blocks_per_core(&self, position: usize) -> Option<usize> {
        self.max_blocks_per_core
            .read()
            .as_ref()
            .map(|quota| quota.get(position).copied().unwrap_or(0))
    }

    #[must_use]
    pub fn quota(&self) -> Option<Quota> {
        self.max_blocks_per_core.read().clone()
    }

    pub fn set_quota(&self, quota: Option<Quota>) {
        *self.max_blocks_per_core.write() = quota;
    }

    #[must_use]
    pub fn num_exceeded_blocks(&self) -> usize {
        self.num_exceeded_blocks.load(Ordering::Acquire)
    }

    pub fn reset_exceeded_blocks(&self) {
        self.num_exceeded_blocks.store(0, Ordering::Release);
    }

    pub fn add_exceeded_blocks(&self, n: usize) {
        self.num_exceeded_blocks.fetch_add(n, Ordering::AcqRel);
    }

    pub fn add_instructions(&self, n: u64) {
        self.num_instructions.fetch_add(n, Ordering::AcqRel);
    }

    #[must_use]
    pub fn num_instructions(&self) -> u64 {
        self.num_instructions.load(Ordering::Acquire)
    }

    // cold function
    pub fn set_started(&self, cycle: u64) {
        *self.start_time.lock() = Some(std::time::Instant::now());
        *self.start_cycle.lock() = Some(cycle);
    }

    // cold function
    pub fn set_completed(&self, cycle: u64) {
        *self.completed_time.lock() = Some(std::time::Instant::now());
        *self.completed_cycle.lock() = Some(cycle);
    }

    #[must_use]
    pub fn start_cycle(&self) -> Option<u64> {
        *self.start_cycle.lock()
    }

    #[must_use]
    pub fn completed_cycle(&self) -> Option<u64> {
        *self.completed_cycle.lock()
    }

    #[must_use]
    pub fn elapsed_cycles(&self) -> Option<u64> {
        match (self.start_cycle(), self.completed_cycle()) {
            (Some(start), Some(completed)) => Some(completed.saturating_sub(start)),
            _ => None,
        }
    }

    #[must_use]
    pub fn elapsed_time(&self) -> Option<std::time::Duration> {
        let start_time = self.start_time.lock();
        let completed_time = self.completed_time.lock();
        match (*start_time, *completed_time) {
            (Some(start_time), Some(completed_time)) => Some(completed_time - start_time),
            _ => None,
        }
    }
}
