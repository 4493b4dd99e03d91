#![allow(
    clippy::upper_case_acronyms,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

pub mod checkpoint;
pub mod clock;
pub mod cluster;
pub mod coexec;
pub mod config;
pub mod core;
pub mod deadlock;
pub mod exec;
pub mod fifo;
pub mod interconn;
pub mod kernel;
pub mod kernel_manager;
pub mod mem_fetch;
pub mod mem_partition_unit;
pub mod mem_sub_partition;
pub mod occupancy;
pub mod stats;

#[cfg(test)]
pub mod testing;

use self::core::Checkpoint;
use cluster::Cluster;
use interconn as ic;
use kernel::{Kernel, KernelLaunch};
use kernel_manager::KernelManager;
use mem_partition_unit::{MemoryPartition, MemoryPartitionUnit};
use mem_sub_partition::SubPartition;

use color_eyre::eyre::{self, WrapErr};
use console::style;
use itertools::Itertools;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// The simulated GPU and everything it needs to run kernels.
///
/// All simulation state lives here and is advanced one clock tick at a time
/// by [`Simulator::cycle`].
pub struct Simulator<I, MP, E> {
    pub config: Arc<config::GPU>,
    pub clock: clock::Domains,
    pub clusters: Vec<Cluster<I>>,
    pub mem_partition_units: Vec<MP>,
    pub interconn: Arc<I>,
    pub engine: E,
    pub kernel_manager: KernelManager,
    pub partitioner: Option<coexec::Partitioner>,
    pub detector: deadlock::Detector,
    pub checkpoint_store: Option<Box<dyn checkpoint::Store>>,
    pub stats: stats::Stats,

    /// Kernels added but not yet completed
    kernels: VecDeque<Arc<Kernel>>,
    busy_streams: VecDeque<u64>,
    last_cluster_issue: usize,
    /// Core cycles simulated so far
    cycle: u64,
    start_time: std::time::Instant,
}

impl<I, MP, E> std::fmt::Debug for Simulator<I, MP, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("cycle", &self.cycle)
            .field("num_clusters", &self.clusters.len())
            .field("num_mem_partitions", &self.mem_partition_units.len())
            .field("kernels", &self.kernels.len())
            .finish_non_exhaustive()
    }
}

impl<I, E> Simulator<I, MemoryPartitionUnit, E>
where
    I: ic::Interconnect<mem_fetch::MemFetch>,
    E: exec::Engine,
{
    #[must_use]
    pub fn new(interconn: Arc<I>, engine: E, config: Arc<config::GPU>) -> Self {
        let mem_partition_units = (0..config.num_memory_controllers)
            .map(|partition_id| MemoryPartitionUnit::new(partition_id, &config))
            .collect();
        Self::with_memory(interconn, mem_partition_units, engine, config)
    }
}

impl<I, MP, E> Simulator<I, MP, E>
where
    I: ic::Interconnect<mem_fetch::MemFetch>,
    MP: MemoryPartition,
    E: exec::Engine,
{
    #[must_use]
    pub fn with_memory(
        interconn: Arc<I>,
        mem_partition_units: Vec<MP>,
        engine: E,
        config: Arc<config::GPU>,
    ) -> Self {
        let fetch_uid = Arc::new(AtomicU64::new(0));
        let clusters = (0..config.num_simt_clusters)
            .map(|cluster_id| Cluster::new(cluster_id, &fetch_uid, &interconn, &config))
            .collect();

        let partitioner = match config.coexec {
            Some(ref coexec) if config.concurrent_kernel_sm => {
                Some(coexec::Partitioner::new(coexec.clone()))
            }
            _ => None,
        };

        Self {
            clock: clock::Domains::from(&config.clock_frequencies),
            clusters,
            mem_partition_units,
            interconn,
            engine,
            kernel_manager: KernelManager::new(Arc::clone(&config)),
            partitioner,
            detector: deadlock::Detector::new(config.deadlock_check, config.deadlock_window),
            checkpoint_store: None,
            stats: stats::Stats::default(),
            kernels: VecDeque::new(),
            busy_streams: VecDeque::new(),
            last_cluster_issue: config.num_simt_clusters.saturating_sub(1),
            cycle: 0,
            start_time: std::time::Instant::now(),
            config,
        }
    }

    /// Core cycles simulated so far.
    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.cycle
    }

    /// Queues a kernel for launch.
    ///
    /// Register and shared memory usage reported by the engine take
    /// precedence over smaller values in the launch configuration.
    pub fn add_kernel(&mut self, mut launch: KernelLaunch) -> Arc<Kernel> {
        let resources = self.engine.kernel_resources(&launch);
        launch.num_registers = launch.num_registers.max(resources.num_registers);
        launch.shared_mem_bytes = launch.shared_mem_bytes.max(resources.shared_mem_bytes);
        let kernel = Arc::new(Kernel::new(launch));
        log::debug!("added {kernel}");
        self.kernels.push_back(Arc::clone(&kernel));
        kernel
    }

    #[must_use]
    pub fn kernels_left(&self) -> bool {
        !self.kernels.is_empty()
    }

    /// Kernels that may be launched concurrently.
    fn launch_window(&self) -> usize {
        if self.config.concurrent_kernel_sm {
            self.config.max_concurrent_kernels
        } else {
            1
        }
    }

    /// Launches queued kernels within the launch window.
    ///
    /// A kernel is only launched if no other kernel of its stream is running.
    pub fn launch_kernels(&mut self) -> eyre::Result<()> {
        let window = self.launch_window();
        let mut launch_queue: Vec<Arc<Kernel>> = Vec::new();
        for kernel in self.kernels.iter().take(window) {
            if kernel.launched() {
                continue;
            }
            let stream_id = kernel.config().stream_id;
            let stream_busy = self.busy_streams.contains(&stream_id)
                || launch_queue.iter().any(|k| k.config().stream_id == stream_id);
            if !stream_busy {
                launch_queue.push(Arc::clone(kernel));
            }
        }

        for kernel in launch_queue {
            if !self.kernel_manager.can_start_kernel() {
                break;
            }
            log::info!("launching {kernel} at cycle {}", self.cycle);
            self.kernel_manager
                .launch(Arc::clone(&kernel), self.cycle)
                .wrap_err_with(|| format!("failed to launch {kernel}"))?;
            self.busy_streams.push_back(kernel.config().stream_id);
        }
        Ok(())
    }

    /// Whether a simulation limit from the configuration was reached.
    #[must_use]
    pub fn reached_limit(&self) -> bool {
        let limits = &self.config.limits;
        let reached = |limit: Option<u64>, value: u64| matches!(limit, Some(limit) if value >= limit);
        reached(limits.max_cycles, self.cycle)
            || reached(limits.max_instructions, self.stats.sim.instructions)
            || reached(limits.max_completed_blocks, self.stats.sim.num_blocks_completed)
            || self.kernel_manager.hit_max_block_count()
    }

    /// Whether any component still has work to do.
    #[must_use]
    pub fn active(&self) -> bool {
        if self.detector.deadlocked() || self.reached_limit() {
            return false;
        }
        if self.clusters.iter().any(|cluster| cluster.not_completed() > 0) {
            return true;
        }
        if self.mem_partition_units.iter().any(MP::busy) {
            return true;
        }
        if self.interconn.busy() {
            return true;
        }
        self.kernel_manager.more_blocks_to_run()
    }

    /// Issues blocks of the resident kernels to the cores.
    ///
    /// Clusters are visited round robin, starting after the cluster that
    /// issued last.
    #[tracing::instrument(skip(self))]
    fn issue_block_to_core(&mut self, cycle: u64) -> eyre::Result<()> {
        if let Some(ref mut partitioner) = self.partitioner {
            for kernel in self.kernel_manager.running_kernels() {
                kernel.reset_exceeded_blocks();
            }
            for cluster in &self.clusters {
                cluster.count_exceeded_blocks();
            }
            partitioner.update(&self.kernel_manager, cycle);
        }

        let checkpoint = match (self.config.resume.as_ref(), self.checkpoint_store.as_deref()) {
            (Some(resume), Some(store)) => Some(Checkpoint { resume, store }),
            _ => None,
        };
        let num_clusters = self.clusters.len();
        let last_issued = self.last_cluster_issue;
        for i in 0..num_clusters {
            let cluster_id = (i + last_issued + 1) % num_clusters;
            let cluster = &mut self.clusters[cluster_id];
            debug_assert_eq!(cluster_id, cluster.cluster_id);
            let num_blocks_issued =
                cluster.issue_block_to_core(&self.kernel_manager, &mut self.engine, checkpoint, cycle)?;
            log::trace!("cluster[{cluster_id}] issued {num_blocks_issued} blocks");
            if num_blocks_issued > 0 {
                self.last_cluster_issue = cluster_id;
                self.stats.sim.num_blocks_issued += num_blocks_issued as u64;
            }
        }
        Ok(())
    }

    /// Advances the simulation by one clock tick.
    ///
    /// Returns the clock domains that were due.
    #[tracing::instrument(name = "cycle", skip(self))]
    pub fn cycle(&mut self) -> eyre::Result<clock::Mask> {
        let mask = self.clock.next();
        let cycle = self.cycle;

        if mask.contains(clock::Mask::CORE) {
            // shader core loading (pop from interconnect into core)
            for cluster in &mut self.clusters {
                cluster.interconn_cycle(cycle);
            }
        }

        if mask.contains(clock::Mask::ICNT) {
            // pop from memory controller to interconnect
            for partition in &mut self.mem_partition_units {
                for sub in partition.sub_partitions_mut() {
                    let Some(fetch) = sub.top() else {
                        continue;
                    };
                    let response_size = fetch.response_size();
                    let device = self.config.mem_id_to_device_id(sub.id());
                    if self.interconn.has_buffer(device, response_size) {
                        if let Some(mut fetch) = sub.pop() {
                            fetch.set_status(mem_fetch::Status::InInterconnToCoreQueue);
                            let cluster_id = fetch.cluster_id;
                            self.interconn.push(device, cluster_id, fetch, response_size);
                            self.stats.memory.partition_replies_in_parallel += 1;
                        }
                    } else {
                        self.stats.memory.stall_icnt_to_core += 1;
                    }
                }
            }
        }

        if mask.contains(clock::Mask::DRAM) {
            for partition in &mut self.mem_partition_units {
                partition.dram_cycle(cycle);
            }
        }

        if mask.contains(clock::Mask::L2) {
            let mut requests_in_parallel = 0;
            for partition in &mut self.mem_partition_units {
                for sub in partition.sub_partitions_mut() {
                    // move memory requests from the interconnect into the
                    // sub partition if it is not backed up
                    let device = self.config.mem_id_to_device_id(sub.id());
                    if sub.full(mem_sub_partition::SECTOR_CHUNK_SIZE) {
                        log::debug!("skip sub partition {}: dram full stall", sub.id());
                        self.stats.memory.stall_dram_full += 1;
                    } else if let Some(fetch) = self.interconn.pop(device) {
                        log::debug!("sub partition {} received {fetch}", sub.id());
                        sub.push(fetch, cycle);
                        requests_in_parallel += 1;
                    }
                    sub.cache_cycle(cycle);
                }
            }
            self.stats.memory.partition_requests_in_parallel += requests_in_parallel;
            if requests_in_parallel > 0 {
                self.stats.memory.partition_util_cycles += 1;
            }
        }

        if mask.contains(clock::Mask::ICNT) {
            self.interconn.transfer();
        }

        if mask.contains(clock::Mask::CORE) {
            self.core_cycle(cycle)?;
            self.cycle += 1;
        }
        Ok(mask)
    }

    fn core_cycle(&mut self, cycle: u64) -> eyre::Result<()> {
        let mut num_instructions = 0;
        let mut num_completed_blocks = 0;
        for cluster in &mut self.clusters {
            let (instructions, completed_blocks) = cluster.cycle(&mut self.engine, cycle);
            num_instructions += instructions;
            num_completed_blocks += completed_blocks as u64;
        }
        self.stats.sim.instructions += num_instructions;
        self.stats.sim.num_blocks_completed += num_completed_blocks;

        self.issue_block_to_core(cycle)?;

        self.flush_caches();

        // cycle counts from one
        let cycle = cycle + 1;
        self.stats.sim.cycles = cycle;
        if self.config.stat_sample_freq > 0 && cycle % self.config.stat_sample_freq == 0 {
            self.print_liveness(cycle);
        }
        if self.detector.check(cycle, self.stats.sim.instructions) {
            log::error!("{}", style(format!("deadlock detected at cycle {cycle}")).red());
        }
        Ok(())
    }

    /// Flushes the L1 of every cluster without unfinished threads, and the L2
    /// once no cluster has unfinished threads.
    fn flush_caches(&mut self) {
        if self.config.flush_l1_cache {
            let num_flushed: usize = self
                .clusters
                .iter_mut()
                .filter(|cluster| cluster.not_completed() == 0)
                .map(Cluster::flush_l1)
                .sum();
            self.stats.memory.l1_flushed_lines += num_flushed as u64;
        }
        let all_threads_complete = self
            .clusters
            .iter()
            .all(|cluster| cluster.not_completed() == 0);
        if self.config.flush_l2_cache && all_threads_complete {
            let mut num_flushed = 0;
            for partition in &mut self.mem_partition_units {
                for sub in partition.sub_partitions_mut() {
                    num_flushed += sub.flush_l2();
                }
            }
            self.stats.memory.l2_flushed_lines += num_flushed as u64;
        }
    }

    fn print_liveness(&self, cycle: u64) {
        let active_cores: usize = self.clusters.iter().map(Cluster::num_active_cores).sum();
        let resident = self
            .kernel_manager
            .running_kernels()
            .map(|kernel| format!("{kernel} ({} running blocks)", kernel.num_running_blocks()))
            .join(", ");
        log::info!(
            "cycle {cycle}: {} instructions (ipc {:.2}), {active_cores}/{} active cores, kernels: [{resident}]",
            self.stats.sim.instructions,
            self.stats.ipc(),
            self.config.total_cores(),
        );
    }

    /// Lists the components that still hold work.
    #[must_use]
    pub fn deadlock_report(&self) -> deadlock::Report {
        let busy_cores = self
            .clusters
            .iter()
            .flat_map(|cluster| cluster.cores.iter())
            .filter(|core| core.not_completed() > 0)
            .map(|core| deadlock::BusyCore {
                cluster_id: core.cluster_id,
                core_id: core.core_id,
                global_core_id: core.global_core_id,
                not_completed: core.not_completed(),
            })
            .collect();
        let busy_memory_partitions = self
            .mem_partition_units
            .iter()
            .filter(|partition| partition.busy())
            .map(MP::id)
            .collect();
        deadlock::Report {
            cycle: self.cycle,
            num_instructions: self.stats.sim.instructions,
            busy_cores,
            busy_memory_partitions,
            interconn_busy: self.interconn.busy(),
        }
    }

    /// Pops the id of the oldest kernel that completed.
    pub fn finished_kernel(&mut self) -> Option<u64> {
        self.kernel_manager.finished_kernel()
    }

    fn cleanup_finished_kernel(&mut self, kernel: &Kernel) {
        log::info!(
            "{}",
            style(format!(
                "{kernel} completed at cycle {} ({} instructions)",
                self.cycle,
                kernel.num_instructions()
            ))
            .green()
        );
        self.kernels.retain(|k| k.id() != kernel.id());
        self.busy_streams
            .retain(|stream_id| *stream_id != kernel.config().stream_id);

        self.stats.kernels.insert(
            kernel.id(),
            stats::Kernel {
                id: kernel.id(),
                name: kernel.name().to_string(),
                start_cycle: kernel.start_cycle(),
                completed_cycle: kernel.completed_cycle(),
                instructions: kernel.num_instructions(),
                num_blocks: kernel.num_issued_blocks(),
                elapsed_millis: kernel.elapsed_time().map(|elapsed| elapsed.as_millis()),
            },
        );
    }

    /// Runs until all kernels completed or a limit was reached.
    ///
    /// # Errors
    /// If a kernel cannot be launched or the simulation deadlocks.
    #[tracing::instrument(skip(self))]
    pub fn run_to_completion(&mut self) -> eyre::Result<()> {
        log::info!(
            "simulating {} cores in {} clusters",
            self.config.total_cores(),
            self.config.num_simt_clusters
        );
        while self.kernels_left() && !self.reached_limit() {
            self.launch_kernels()?;
            self.cycle()?;

            while let Some(kernel) = self.kernel_manager.get_finished_kernel(self.cycle) {
                self.cleanup_finished_kernel(&kernel);
            }

            if self.detector.deadlocked() {
                let report = self.deadlock_report();
                log::error!("{report}");
                return Err(deadlock::DeadlockError { report }.into());
            }
        }

        if self.kernels_left() {
            log::warn!("simulation limit reached at cycle {}", self.cycle);
            self.kernel_manager.stop_all_running_kernels(self.cycle);
        }
        self.stats.sim.elapsed_millis = self.start_time.elapsed().as_millis();
        self.stats.coexec = self.partitioner.as_ref().map(stats::Coexec::from);
        log::info!(
            "exit after {} cycles ({} instructions, ipc {:.2})",
            self.cycle,
            self.stats.sim.instructions,
            self.stats.ipc()
        );
        Ok(())
    }
}

pub fn save_stats_to_file(stats: &stats::Stats, path: &Path) -> eyre::Result<()> {
    use serde::Serialize;

    let path = path.with_extension("json");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let output_file = std::fs::File::create(&path)
        .wrap_err_with(|| format!("failed to create {}", path.display()))?;
    let mut json_serializer = serde_json::Serializer::with_formatter(
        std::io::BufWriter::new(output_file),
        serde_json::ser::PrettyFormatter::with_indent(b"    "),
    );
    stats.serialize(&mut json_serializer)?;
    Ok(())
}
