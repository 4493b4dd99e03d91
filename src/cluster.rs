use crate::core::{Checkpoint, Core};
use crate::exec::{self, Engine};
use crate::interconn as ic;
use crate::kernel::Kernel;
use crate::kernel_manager::KernelManager;
use crate::{config, mem_fetch};
use color_eyre::eyre;
use console::style;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub struct Cluster<I> {
    pub cluster_id: usize,
    pub cores: Vec<Core>,
    pub config: Arc<config::GPU>,
    pub interconn: Arc<I>,

    pub block_issue_next_core: usize,
    pub response_fifo: VecDeque<mem_fetch::MemFetch>,
}

impl<I> std::fmt::Debug for Cluster<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Cluster@{}", self.cluster_id)
    }
}

impl<I> Cluster<I>
where
    I: ic::Interconnect<mem_fetch::MemFetch>,
{
    pub fn new(
        cluster_id: usize,
        fetch_uid: &Arc<AtomicU64>,
        interconn: &Arc<I>,
        config: &Arc<config::GPU>,
    ) -> Self {
        let num_cores = config.num_cores_per_simt_cluster;
        let cores = (0..num_cores)
            .map(|core_id| {
                Core::new(
                    cluster_id,
                    core_id,
                    Arc::clone(fetch_uid),
                    Arc::clone(config),
                )
            })
            .collect();
        Self {
            cluster_id,
            cores,
            config: Arc::clone(config),
            interconn: Arc::clone(interconn),
            block_issue_next_core: num_cores - 1,
            response_fifo: VecDeque::new(),
        }
    }

    pub fn num_active_cores(&self) -> usize {
        self.cores.iter().filter(|core| core.is_active()).count()
    }

    pub fn not_completed(&self) -> usize {
        self.cores.iter().map(Core::not_completed).sum()
    }

    /// Moves replies from the interconnect towards the cores.
    #[tracing::instrument]
    pub fn interconn_cycle(&mut self, cycle: u64) {
        log::debug!(
            "{}",
            style(format!(
                "cycle {:02} cluster {}: interconn cycle (response fifo={:?})",
                cycle,
                self.cluster_id,
                self.response_fifo
                    .iter()
                    .map(std::string::ToString::to_string)
                    .collect::<Vec<_>>(),
            ))
            .cyan()
        );

        if let Some(fetch) = self.response_fifo.pop_front() {
            let core_id = self.config.global_core_id_to_core_id(fetch.core_id);
            self.cores[core_id].accept_response(fetch);
        }

        let eject_buffer_size = self.config.num_cluster_ejection_buffer_size;
        if self.response_fifo.len() >= eject_buffer_size {
            log::debug!(
                "skip: ejection buffer full ({}/{})",
                self.response_fifo.len(),
                eject_buffer_size
            );
            return;
        }

        let Some(mut fetch) = self.interconn.pop(self.cluster_id) else {
            return;
        };
        debug_assert_eq!(fetch.cluster_id, self.cluster_id);
        fetch.set_status(mem_fetch::Status::InInterconnToCoreQueue);
        self.response_fifo.push_back(fetch);
    }

    /// Cycles all cores and injects their memory requests into the interconnect.
    ///
    /// Returns the number of retired instructions and completed blocks.
    pub fn cycle(&mut self, engine: &mut dyn Engine, cycle: u64) -> (u64, usize) {
        let mut num_instructions = 0;
        let mut num_completed_blocks = 0;
        for core in &mut self.cores {
            let exec::Progress {
                instructions,
                completed_blocks,
                ..
            } = core.cycle(engine, cycle);
            num_instructions += instructions.iter().map(|(_, n)| n).sum::<u64>();
            num_completed_blocks += completed_blocks.len();

            // one request per core and cycle
            let Some(fetch) = core.memory_requests.front() else {
                continue;
            };
            let size = fetch.request_size();
            if !self.interconn.has_buffer(self.cluster_id, size) {
                continue;
            }
            if let Some(fetch) = core.memory_requests.pop_front() {
                let dest = self.config.mem_id_to_device_id(fetch.sub_partition_id);
                self.interconn.push(self.cluster_id, dest, fetch, size);
            }
        }
        (num_instructions, num_completed_blocks)
    }

    pub fn flush_l1(&mut self) -> usize {
        self.cores.iter_mut().map(Core::flush_l1).sum()
    }

    /// Recounts the blocks each kernel holds above its per core quota.
    pub fn count_exceeded_blocks(&self) {
        for core in &self.cores {
            for (kernel, num_blocks) in core.resident_kernels() {
                if let Some(quota) = kernel.max_blocks_per_core(core.core_id) {
                    if num_blocks > quota {
                        kernel.add_exceeded_blocks(num_blocks - quota);
                    }
                }
            }
        }
    }

    fn within_quota(core: &Core, kernel: &Kernel) -> bool {
        match kernel.max_blocks_per_core(core.core_id) {
            Some(quota) => core.num_blocks_of(kernel.id()) < quota,
            None => true,
        }
    }

    /// Issues at most one block to one of the cores.
    ///
    /// Cores are visited round robin, starting after the core that received
    /// the last block.
    #[tracing::instrument(name = "cluster_issue_block_to_core", skip_all, fields(cluster = self.cluster_id))]
    pub fn issue_block_to_core(
        &mut self,
        kernel_manager: &KernelManager,
        engine: &mut dyn Engine,
        checkpoint: Option<Checkpoint<'_>>,
        cycle: u64,
    ) -> eyre::Result<usize> {
        use crate::kernel_manager::SelectKernel;

        let num_cores = self.cores.len();
        log::debug!(
            "cluster {}: issue block to core for {} cores",
            self.cluster_id,
            num_cores
        );

        for core_id in 0..num_cores {
            let core_id = (core_id + self.block_issue_next_core + 1) % num_cores;
            let core = &mut self.cores[core_id];

            let candidates: SmallVec<[Arc<Kernel>; 2]> = if self.config.concurrent_kernel_sm {
                kernel_manager.candidate_kernels(cycle)
            } else {
                // if no more blocks left, get new kernel once current block completes
                let mut current_kernel = core.current_kernel.clone();
                let should_select_new_kernel = match current_kernel {
                    Some(ref current) => {
                        !kernel_manager.kernel_more_blocks_left(current)
                            && core.not_completed() == 0
                    }
                    None => true,
                };
                if should_select_new_kernel {
                    current_kernel = kernel_manager.select_kernel(cycle);
                    if current_kernel.is_some() {
                        core.current_kernel.clone_from(&current_kernel);
                    }
                }
                current_kernel.into_iter().collect()
            };

            if candidates.is_empty() {
                log::trace!(
                    "core {}-{}: selected kernel NULL",
                    self.cluster_id,
                    core_id
                );
            }

            for kernel in candidates {
                let can_issue = kernel_manager.kernel_more_blocks_left(&kernel)
                    && Self::within_quota(core, &kernel)
                    && core.can_issue_block(&kernel);
                log::trace!(
                    "core {}-{}: selected kernel {} more blocks={} can issue={}",
                    self.cluster_id,
                    core_id,
                    kernel,
                    !kernel.no_more_blocks_to_run(),
                    can_issue,
                );
                if !can_issue {
                    continue;
                }
                if core.issue_block(&kernel, engine, checkpoint, cycle)?.is_some() {
                    self.block_issue_next_core = core_id;
                    return Ok(1);
                }
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::Cluster;
    use crate::interconn::{Interconnect, ToyInterconnect};
    use crate::kernel_manager::KernelManager;
    use crate::{config, exec, mem_fetch, testing};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;
    use smallvec::smallvec;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn cluster(config: config::GPU) -> (Cluster<ToyInterconnect<mem_fetch::MemFetch>>, Arc<config::GPU>) {
        let config = Arc::new(config);
        let interconn = Arc::new(ToyInterconnect::new(
            config.num_simt_clusters,
            config.num_sub_partitions(),
            config.interconn_buffer_size,
        ));
        let cluster = Cluster::new(0, &Arc::new(AtomicU64::new(0)), &interconn, &config);
        (cluster, config)
    }

    #[test]
    fn test_round_robin_over_cores() -> eyre::Result<()> {
        let (mut cluster, config) = cluster(config::GPU {
            num_cores_per_simt_cluster: 3,
            ..testing::small_gpu()
        });
        let mut manager = KernelManager::new(Arc::clone(&config));
        manager.launch(testing::kernel(1, 100, 64), 0)?;
        let mut engine = exec::Synthetic::default();

        for cycle in 0..6 {
            diff::assert_eq!(
                cluster.issue_block_to_core(&manager, &mut engine, None, cycle)?,
                1
            );
        }
        let blocks: Vec<_> = cluster.cores.iter().map(|core| core.num_active_blocks()).collect();
        diff::assert_eq!(blocks, vec![2, 2, 2]);
        diff::assert_eq!(cluster.block_issue_next_core, 2);
        Ok(())
    }

    #[test]
    fn test_quota_limits_blocks_per_core() -> eyre::Result<()> {
        let (mut cluster, config) = cluster(config::GPU {
            concurrent_kernel_sm: true,
            ..testing::small_gpu()
        });
        let mut manager = KernelManager::new(Arc::clone(&config));
        let a = testing::kernel(1, 100, 64);
        let b = testing::kernel(2, 100, 64);
        a.set_quota(Some(smallvec![2, 1]));
        b.set_quota(Some(smallvec![1, 1]));
        manager.launch(Arc::clone(&a), 0)?;
        manager.launch(Arc::clone(&b), 0)?;
        let mut engine = exec::Synthetic::default();

        let mut issued = 0;
        for cycle in 0..20 {
            issued += cluster.issue_block_to_core(&manager, &mut engine, None, cycle)?;
        }
        diff::assert_eq!(issued, 5);
        diff::assert_eq!(cluster.cores[0].num_blocks_of(1), 2);
        diff::assert_eq!(cluster.cores[1].num_blocks_of(1), 1);
        diff::assert_eq!(cluster.cores[0].num_blocks_of(2), 1);
        diff::assert_eq!(cluster.cores[1].num_blocks_of(2), 1);

        // lowering the quota marks blocks above it as exceeded
        a.set_quota(Some(smallvec![0, 0]));
        cluster.count_exceeded_blocks();
        diff::assert_eq!(a.num_exceeded_blocks(), 3);
        diff::assert_eq!(b.num_exceeded_blocks(), 0);
        Ok(())
    }

    #[test]
    fn test_requests_and_replies_pass_the_interconnect() -> eyre::Result<()> {
        let (mut cluster, config) = cluster(testing::small_gpu());
        let mut manager = KernelManager::new(Arc::clone(&config));
        manager.launch(testing::kernel(1, 1, 32), 0)?;
        let mut engine = exec::Synthetic::new(
            1,
            exec::Profile {
                instructions_per_warp: 4,
                memory_access_interval: 1,
            },
        );
        cluster.issue_block_to_core(&manager, &mut engine, None, 0)?;
        diff::assert_eq!(cluster.cycle(&mut engine, 1), (1, 0));
        assert!(cluster.interconn.busy());

        cluster.interconn.transfer();
        let dest = config.mem_id_to_device_id(0);
        let mut request = cluster.interconn.pop(dest).expect("request");
        diff::assert_eq!(request.core_id, 0);

        request.set_reply();
        cluster.interconn.push(dest, 0, request, 40);
        cluster.interconn.transfer();
        cluster.interconn_cycle(2);
        diff::assert_eq!(cluster.response_fifo.len(), 1);
        cluster.interconn_cycle(3);
        diff::assert_eq!(cluster.cores[0].num_responses, 1);
        Ok(())
    }
}
