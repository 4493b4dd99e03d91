//! Block quotas for two kernels sharing the cores of the GPU.
//!
//! The partitioner only ever writes the quota and status of the first two
//! resident kernels. Per core occupancy is left to the admission checks of
//! the cores.

pub mod search;

pub use search::{Direction, Outcome, Search, Step};

use crate::config::GPU;
use crate::kernel::{Kernel, Quota, Status};
use crate::kernel_manager::KernelManager;
use crate::occupancy::{Budget, Request};
use color_eyre::eyre;
use console::style;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Kernel A runs alone until its IPC is stable, then kernel B.
    #[default]
    SequentialBaseline,
    /// Fixed number of blocks of kernel A per cluster.
    Static { kernel_a_blocks: usize },
    /// Hill climb over the blocks of kernel A per cluster.
    AdaptiveSearch {
        initial: usize,
        min: usize,
        max: usize,
        step: usize,
    },
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complement {
    /// Fill whatever the blocks of kernel A leave on a core.
    #[default]
    Residual,
    /// Blocks of kernel B per core keyed by blocks of kernel A per core.
    Table(BTreeMap<usize, usize>),
}

/// Blocks of kernel B that fit next to a given number of blocks of kernel A.
pub trait CapacityComplement: std::fmt::Debug {
    fn complement(&self, blocks_a: usize, kernel_a: &Kernel, kernel_b: &Kernel, config: &GPU)
        -> usize;
}

impl CapacityComplement for Complement {
    fn complement(
        &self,
        blocks_a: usize,
        kernel_a: &Kernel,
        kernel_b: &Kernel,
        config: &GPU,
    ) -> usize {
        match self {
            Self::Table(table) => match table.get(&blocks_a) {
                Some(blocks_b) => *blocks_b,
                None => {
                    log::warn!("no complement for {blocks_a} blocks configured, using residual");
                    residual(blocks_a, kernel_a, kernel_b, config)
                }
            },
            Self::Residual => residual(blocks_a, kernel_a, kernel_b, config),
        }
    }
}

fn residual(blocks_a: usize, kernel_a: &Kernel, kernel_b: &Kernel, config: &GPU) -> usize {
    let budget = Budget::from(config);
    let a = Request::new(kernel_a, config);
    let b = Request::new(kernel_b, config);

    let fit = |limit: usize, used: usize, per_block: usize| {
        if per_block == 0 {
            usize::MAX
        } else {
            limit.saturating_sub(blocks_a * used) / per_block
        }
    };
    [
        fit(budget.threads, a.threads, b.threads),
        fit(budget.shared_memory, a.shared_memory, b.shared_memory),
        fit(budget.registers, a.registers, b.registers),
        budget.blocks.saturating_sub(blocks_a),
    ]
    .into_iter()
    .min()
    .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub policy: Policy,
    pub complement: Complement,
    /// Core cycles between two IPC samples of a kernel running alone
    pub sample_interval: u64,
    /// Core cycles to wait after a quota change before sampling
    pub warmup: u64,
    /// Core cycles over which co-running kernels are sampled
    pub sample_window: u64,
    /// Relative IPC difference under which a kernel is considered stable
    pub stable_tolerance: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            complement: Complement::default(),
            sample_interval: 10_000,
            warmup: 10_000,
            sample_window: 10_000,
            stable_tolerance: 0.03,
        }
    }
}

impl Config {
    pub fn validate(&self, config: &GPU) -> eyre::Result<()> {
        if !config.concurrent_kernel_sm {
            eyre::bail!("co-execution requires concurrent kernels on a core");
        }
        if self.sample_interval == 0 || self.sample_window == 0 {
            eyre::bail!("co-execution sampling intervals must be non-zero");
        }
        if !(0.0..1.0).contains(&self.stable_tolerance) {
            eyre::bail!(
                "stable tolerance {} must be within [0, 1)",
                self.stable_tolerance
            );
        }
        let max_blocks_per_cluster =
            config.max_concurrent_blocks_per_core * config.num_cores_per_simt_cluster;
        match self.policy {
            Policy::Static { kernel_a_blocks } if kernel_a_blocks > max_blocks_per_cluster => {
                eyre::bail!(
                    "{kernel_a_blocks} blocks of kernel A do not fit a cluster ({max_blocks_per_cluster} max)"
                );
            }
            Policy::AdaptiveSearch {
                initial,
                min,
                max,
                step,
            } => {
                if step == 0 {
                    eyre::bail!("search step must be non-zero");
                }
                if !(min <= initial && initial <= max) {
                    eyre::bail!("initial quota {initial} outside of [{min}, {max}]");
                }
                if max > max_blocks_per_cluster {
                    eyre::bail!(
                        "maximum quota {max} exceeds {max_blocks_per_cluster} blocks per cluster"
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Spreads `total` blocks over `num_cores` core positions.
///
/// The first `total % num_cores` positions receive one extra block.
#[must_use]
pub fn spread(total: usize, num_cores: usize) -> Quota {
    if num_cores == 0 {
        return Quota::new();
    }
    let (q, r) = (total / num_cores, total % num_cores);
    (0..num_cores).map(|c| q + usize::from(c < r)).collect()
}

/// Performance of both kernels under one quota configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationPerf {
    /// Blocks of kernel A per cluster
    pub blocks_a: usize,
    /// Blocks of kernel B per cluster
    pub blocks_b: usize,
    pub instructions_a: u64,
    pub instructions_b: u64,
    pub ipc_a: f64,
    pub ipc_b: f64,
}

/// IPC of the two kernels running alone.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baselines {
    pub ipc_a: Option<f64>,
    pub ipc_b: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    start_cycle: u64,
    instructions_a: u64,
    instructions_b: u64,
}

impl Window {
    fn open(a: &Kernel, b: &Kernel, cycle: u64) -> Self {
        Self {
            start_cycle: cycle,
            instructions_a: a.num_instructions(),
            instructions_b: b.num_instructions(),
        }
    }
}

/// Tracks the IPC of a kernel running alone.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Stability {
    start_cycle: u64,
    start_instructions: u64,
    last_sample_cycle: u64,
    previous_ipc: f64,
}

impl Stability {
    fn new(kernel: &Kernel, cycle: u64) -> Self {
        Self {
            start_cycle: cycle,
            start_instructions: kernel.num_instructions(),
            last_sample_cycle: cycle,
            previous_ipc: 0.001,
        }
    }

    /// Returns the IPC once it changed by less than `tolerance` since the last sample.
    fn sample(&mut self, kernel: &Kernel, cycle: u64, tolerance: f64) -> Option<f64> {
        let elapsed = cycle.saturating_sub(self.start_cycle);
        if elapsed == 0 {
            return None;
        }
        let instructions = kernel.num_instructions() - self.start_instructions;
        let ipc = instructions as f64 / elapsed as f64;
        self.last_sample_cycle = cycle;
        if ipc > 0.0 {
            let ratio = self.previous_ipc / ipc;
            if (1.0 - tolerance) < ratio && ratio < (1.0 + tolerance) {
                return Some(ipc);
            }
        }
        log::debug!("{kernel}: ipc {ipc:.3} (previous {:.3})", self.previous_ipc);
        self.previous_ipc = ipc;
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Idle,
    /// Waiting for the hardware to settle after a quota change
    Warmup { since: u64 },
    Sampling(Window),
    Alone { a: Stability, b: Option<Stability> },
    Done,
}

#[derive(Debug)]
pub struct Partitioner {
    pub config: Config,
    complement: Box<dyn CapacityComplement>,
    pair: Option<(Arc<Kernel>, Arc<Kernel>)>,
    phase: Phase,
    search: Option<Search>,
    /// Configurations sampled by the adaptive search
    pub samples: Vec<ConfigurationPerf>,
    pub outcome: Option<Outcome>,
    pub baselines: Baselines,
}

impl Partitioner {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let complement = Box::new(config.complement.clone());
        Self::with_complement(config, complement)
    }

    #[must_use]
    pub fn with_complement(config: Config, complement: Box<dyn CapacityComplement>) -> Self {
        Self {
            config,
            complement,
            pair: None,
            phase: Phase::Idle,
            search: None,
            samples: Vec::new(),
            outcome: None,
            baselines: Baselines::default(),
        }
    }

    #[must_use]
    pub fn search(&self) -> Option<&Search> {
        self.search.as_ref()
    }

    fn complement_quota(&self, quota_a: &Quota, a: &Kernel, b: &Kernel, config: &GPU) -> Quota {
        quota_a
            .iter()
            .map(|blocks_a| self.complement.complement(*blocks_a, a, b, config))
            .collect()
    }

    /// Applies `blocks_a` blocks per cluster to kernel A and the complement to kernel B.
    fn apply(&self, blocks_a: usize, a: &Kernel, b: &Kernel, config: &GPU) -> usize {
        let quota_a = spread(blocks_a, config.num_cores_per_simt_cluster);
        let quota_b = self.complement_quota(&quota_a, a, b, config);
        let blocks_b = quota_b.iter().sum();
        log::info!(
            "{}",
            style(format!(
                "co-execution: {a} gets {quota_a:?}, {b} gets {quota_b:?} blocks per core"
            ))
            .magenta()
        );
        a.set_quota(Some(quota_a));
        b.set_quota(Some(quota_b));
        blocks_b
    }

    /// Lifts the quota of kernels that are no longer co-running.
    fn dissolve(&mut self) {
        if let Some((a, b)) = self.pair.take() {
            for kernel in [a, b] {
                if !kernel.done() {
                    kernel.set_quota(None);
                    if kernel.status() != Status::Done {
                        kernel.set_status(Status::Ready);
                    }
                }
            }
        }
        self.phase = Phase::Idle;
        self.search = None;
    }

    /// Updates the quotas of the first two resident kernels.
    ///
    /// Must run before each issue pass, after the exceeded blocks were counted.
    pub fn update(&mut self, kernels: &KernelManager, cycle: u64) {
        let mut running = kernels.running_kernels();
        let (Some(a), Some(b), None) = (running.next(), running.next(), running.next()) else {
            if self.pair.is_some() {
                self.dissolve();
            }
            return;
        };

        let same_pair = self
            .pair
            .as_ref()
            .is_some_and(|(pa, pb)| pa.id() == a.id() && pb.id() == b.id());
        if !same_pair {
            if self.pair.is_some() {
                self.dissolve();
            }
            log::debug!("co-execution: new pair ({a}, {b})");
            // the policy starts over, even for a pair that co-ran before
            a.set_status(Status::Init);
            b.set_status(Status::Init);
            self.pair = Some((Arc::clone(a), Arc::clone(b)));
        }

        let config = &kernels.config;
        match self.config.policy.clone() {
            Policy::Static { kernel_a_blocks } => self.update_static(kernel_a_blocks, a, b, config),
            Policy::SequentialBaseline => self.update_sequential(a, b, config, cycle),
            Policy::AdaptiveSearch {
                initial,
                min,
                max,
                step,
            } => self.update_adaptive(Search::new(initial, min, max, step), a, b, config, cycle),
        }
    }

    fn update_static(&mut self, kernel_a_blocks: usize, a: &Kernel, b: &Kernel, config: &GPU) {
        if a.status() == Status::Init || b.status() == Status::Init {
            self.apply(kernel_a_blocks, a, b, config);
            a.set_status(Status::Ready);
            b.set_status(Status::Ready);
            self.phase = Phase::Done;
        }
    }

    fn update_sequential(&mut self, a: &Kernel, b: &Kernel, config: &GPU, cycle: u64) {
        let num_cores = config.num_cores_per_simt_cluster;
        let max_quota = |kernel: &Kernel| {
            let max_blocks = config.max_blocks(kernel).unwrap_or(0);
            Some(Quota::from_elem(max_blocks, num_cores))
        };
        let tolerance = self.config.stable_tolerance;
        let interval = self.config.sample_interval;

        if a.status() == Status::Init {
            a.set_quota(max_quota(a));
            a.set_status(Status::Ready);
            self.phase = Phase::Alone {
                a: Stability::new(a, cycle),
                b: None,
            };
        }
        if a.status() != Status::Evicted && b.status() == Status::Init {
            // kernel B waits until kernel A is evicted
            b.set_quota(Some(Quota::from_elem(0, num_cores)));
        }

        let Phase::Alone {
            a: ref mut stability_a,
            b: ref mut stability_b,
        } = self.phase
        else {
            return;
        };

        match a.status() {
            Status::Ready if cycle - stability_a.last_sample_cycle >= interval => {
                if let Some(ipc) = stability_a.sample(a, cycle, tolerance) {
                    log::info!("co-execution: {a} is stable at ipc {ipc:.3}, evicting");
                    self.baselines.ipc_a = Some(ipc);
                    a.set_quota(Some(Quota::from_elem(0, num_cores)));
                    a.set_status(Status::Evicted);
                }
            }
            Status::Evicted => {
                if b.status() == Status::Init {
                    b.set_quota(max_quota(b));
                    b.set_status(Status::Ready);
                    *stability_b = Some(Stability::new(b, cycle));
                }
                let Some(stability_b) = stability_b else {
                    return;
                };
                if a.num_exceeded_blocks() > 0 {
                    // kernel A still occupies the cores
                    *stability_b = Stability::new(b, cycle);
                } else if cycle - stability_b.last_sample_cycle >= interval {
                    if let Some(ipc) = stability_b.sample(b, cycle, tolerance) {
                        log::info!("co-execution: {b} is stable at ipc {ipc:.3}");
                        self.baselines.ipc_b = Some(ipc);
                        // both baselines are known, let the kernels finish
                        a.set_quota(None);
                        a.set_status(Status::Ready);
                        b.set_quota(None);
                        self.phase = Phase::Done;
                    }
                }
            }
            _ => {}
        }
    }

    fn update_adaptive(&mut self, search: Search, a: &Kernel, b: &Kernel, config: &GPU, cycle: u64) {
        if a.status() == Status::Init || b.status() == Status::Init {
            self.apply(search.current(), a, b, config);
            a.set_status(Status::Ready);
            b.set_status(Status::Ready);
            self.search = Some(search);
            self.phase = Phase::Warmup { since: cycle };
            return;
        }

        let exceeded = a.num_exceeded_blocks() > 0 || b.num_exceeded_blocks() > 0;
        match self.phase {
            Phase::Warmup { since } if cycle - since >= self.config.warmup => {
                if exceeded {
                    log::trace!("co-execution: blocks above quota, extending warmup");
                    self.phase = Phase::Warmup { since: cycle };
                } else {
                    self.phase = Phase::Sampling(Window::open(a, b, cycle));
                }
            }
            Phase::Sampling(_) if exceeded => {
                self.phase = Phase::Sampling(Window::open(a, b, cycle));
            }
            Phase::Sampling(window) if cycle - window.start_cycle >= self.config.sample_window => {
                let Some(ref mut search) = self.search else {
                    return;
                };
                let elapsed = (cycle - window.start_cycle) as f64;
                let instructions_a = a.num_instructions() - window.instructions_a;
                let instructions_b = b.num_instructions() - window.instructions_b;
                let quota_b = b.quota().unwrap_or_default();
                let sample = ConfigurationPerf {
                    blocks_a: search.current(),
                    blocks_b: quota_b.iter().sum(),
                    instructions_a,
                    instructions_b,
                    ipc_a: instructions_a as f64 / elapsed,
                    ipc_b: instructions_b as f64 / elapsed,
                };
                log::debug!("co-execution: cycle {cycle} sampled {sample:?}");
                self.samples.push(sample.clone());

                match search.evaluate(sample) {
                    Step::Continue(blocks_a) => {
                        a.set_status(Status::Reschedule);
                        b.set_status(Status::Reschedule);
                        self.apply(blocks_a, a, b, config);
                        a.set_status(Status::Ready);
                        b.set_status(Status::Ready);
                        self.phase = Phase::Warmup { since: cycle };
                    }
                    Step::Done(outcome) => {
                        log::info!(
                            "{}",
                            style(format!("co-execution search finished at cycle {cycle}: {outcome}"))
                                .green()
                        );
                        self.apply(outcome.configuration().blocks_a, a, b, config);
                        self.outcome = Some(outcome);
                        self.phase = Phase::Done;
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{spread, Complement, Config, Outcome, Partitioner, Policy};
    use crate::kernel::{Quota, Status};
    use crate::kernel_manager::KernelManager;
    use crate::{config, testing};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;
    use smallvec::smallvec;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn gpu() -> config::GPU {
        config::GPU {
            concurrent_kernel_sm: true,
            max_threads_per_core: 1024,
            max_concurrent_blocks_per_core: 8,
            ..testing::small_gpu()
        }
    }

    #[test]
    fn test_spread_over_cores() {
        diff::assert_eq!(spread(7, 3), Quota::from_slice(&[3, 2, 2]));
        diff::assert_eq!(spread(2, 4), Quota::from_slice(&[1, 1, 0, 0]));
        diff::assert_eq!(spread(0, 2), Quota::from_slice(&[0, 0]));
    }

    #[test]
    fn test_residual_complement() {
        use super::CapacityComplement;
        let config = gpu();
        let a = testing::kernel(1, 10, 256);
        let b = testing::kernel(2, 10, 128);
        // 1024 threads, 8 block slots
        diff::assert_eq!(Complement::Residual.complement(0, &a, &b, &config), 8);
        diff::assert_eq!(Complement::Residual.complement(2, &a, &b, &config), 4);
        diff::assert_eq!(Complement::Residual.complement(4, &a, &b, &config), 0);

        let table = Complement::Table(BTreeMap::from([(2, 3)]));
        diff::assert_eq!(table.complement(2, &a, &b, &config), 3);
        diff::assert_eq!(table.complement(1, &a, &b, &config), 6);
    }

    #[test]
    fn test_validate_policies() {
        let config = gpu();
        let coexec = |policy| Config {
            policy,
            ..Config::default()
        };
        assert!(coexec(Policy::Static { kernel_a_blocks: 16 })
            .validate(&config)
            .is_ok());
        assert!(coexec(Policy::Static { kernel_a_blocks: 17 })
            .validate(&config)
            .is_err());
        assert!(coexec(Policy::AdaptiveSearch {
            initial: 0,
            min: 1,
            max: 10,
            step: 1
        })
        .validate(&config)
        .is_err());
        assert!(Config::default()
            .validate(&config::GPU {
                concurrent_kernel_sm: false,
                ..gpu()
            })
            .is_err());
    }

    #[test]
    fn test_static_policy_sets_quotas() -> eyre::Result<()> {
        let config = Arc::new(gpu());
        let mut manager = KernelManager::new(Arc::clone(&config));
        let a = testing::kernel(1, 100, 256);
        let b = testing::kernel(2, 100, 256);
        manager.launch(Arc::clone(&a), 0)?;
        manager.launch(Arc::clone(&b), 0)?;

        let mut partitioner = Partitioner::new(Config {
            policy: Policy::Static { kernel_a_blocks: 3 },
            ..Config::default()
        });
        partitioner.update(&manager, 0);
        diff::assert_eq!(a.quota(), Some(smallvec![2, 1]));
        diff::assert_eq!(b.quota(), Some(smallvec![2, 3]));
        diff::assert_eq!(a.status(), Status::Ready);
        diff::assert_eq!(b.status(), Status::Ready);

        // quotas are lifted once kernel A is gone
        manager.set_kernel_done(&a, 10);
        partitioner.update(&manager, 11);
        diff::assert_eq!(b.quota(), None);
        Ok(())
    }

    #[test]
    fn test_sequential_baseline() -> eyre::Result<()> {
        let config = Arc::new(gpu());
        let mut manager = KernelManager::new(Arc::clone(&config));
        let a = testing::kernel(1, 100, 256);
        let b = testing::kernel(2, 100, 256);
        manager.launch(Arc::clone(&a), 0)?;
        manager.launch(Arc::clone(&b), 0)?;

        let mut partitioner = Partitioner::new(Config {
            policy: Policy::SequentialBaseline,
            sample_interval: 100,
            ..Config::default()
        });
        partitioner.update(&manager, 0);
        diff::assert_eq!(a.quota(), Some(smallvec![4, 4]));
        diff::assert_eq!(b.quota(), Some(smallvec![0, 0]));

        let mut cycle = 0;
        while a.status() != Status::Evicted {
            cycle += 1;
            assert!(cycle < 10_000, "kernel A never stabilized");
            a.add_instructions(2);
            partitioner.update(&manager, cycle);
        }
        diff::assert_eq!(partitioner.baselines.ipc_a, Some(2.0));
        diff::assert_eq!(a.quota(), Some(smallvec![0, 0]));

        // blocks of kernel A still resident delay sampling
        a.add_exceeded_blocks(1);
        for _ in 0..500 {
            cycle += 1;
            b.add_instructions(3);
            partitioner.update(&manager, cycle);
        }
        diff::assert_eq!(b.status(), Status::Ready);
        diff::assert_eq!(b.quota(), Some(smallvec![4, 4]));
        diff::assert_eq!(partitioner.baselines.ipc_b, None);

        a.reset_exceeded_blocks();
        while partitioner.baselines.ipc_b.is_none() {
            cycle += 1;
            assert!(cycle < 20_000, "kernel B never stabilized");
            b.add_instructions(3);
            partitioner.update(&manager, cycle);
        }
        diff::assert_eq!(partitioner.baselines.ipc_b, Some(3.0));
        diff::assert_eq!(a.quota(), None);
        diff::assert_eq!(b.quota(), None);
        Ok(())
    }

    #[test]
    fn test_adaptive_search_finds_best_quota() -> eyre::Result<()> {
        let config = Arc::new(gpu());
        let mut manager = KernelManager::new(Arc::clone(&config));
        let a = testing::kernel(1, 10_000, 128);
        let b = testing::kernel(2, 10_000, 128);
        manager.launch(Arc::clone(&a), 0)?;
        manager.launch(Arc::clone(&b), 0)?;

        let mut partitioner = Partitioner::new(Config {
            policy: Policy::AdaptiveSearch {
                initial: 2,
                min: 1,
                max: 10,
                step: 1,
            },
            warmup: 10,
            sample_window: 100,
            ..Config::default()
        });
        // throughput of kernel A peaks at 6 blocks per cluster
        let ipc_a = |blocks: usize| 10 - (blocks as i64 - 6).unsigned_abs();

        partitioner.update(&manager, 0);
        diff::assert_eq!(a.quota(), Some(smallvec![1, 1]));
        let mut cycle = 0;
        while partitioner.outcome.is_none() {
            cycle += 1;
            assert!(cycle < 100_000, "search did not terminate");
            let blocks_a = partitioner.search().map_or(0, |search| search.current());
            a.add_instructions(ipc_a(blocks_a));
            b.add_instructions(5);
            partitioner.update(&manager, cycle);
        }
        let outcome = partitioner.outcome.clone().expect("outcome");
        assert!(matches!(outcome, Outcome::Converged(_)));
        diff::assert_eq!(outcome.configuration().blocks_a, 6);
        diff::assert_eq!(outcome.configuration().ipc_a, 10.0);
        diff::assert_eq!(a.quota(), Some(smallvec![3, 3]));
        diff::assert_eq!(partitioner.samples.len(), 6);
        Ok(())
    }

    #[test]
    fn test_search_restarts_when_pair_forms_again() -> eyre::Result<()> {
        let config = Arc::new(gpu());
        let mut manager = KernelManager::new(Arc::clone(&config));
        let a = testing::kernel(1, 10_000, 128);
        let b = testing::kernel(2, 10_000, 128);
        manager.launch(Arc::clone(&a), 0)?;
        manager.launch(Arc::clone(&b), 0)?;

        let mut partitioner = Partitioner::new(Config {
            policy: Policy::AdaptiveSearch {
                initial: 2,
                min: 1,
                max: 10,
                step: 1,
            },
            warmup: 10,
            sample_window: 100,
            ..Config::default()
        });
        partitioner.update(&manager, 0);
        diff::assert_eq!(a.quota(), Some(smallvec![1, 1]));
        diff::assert_eq!(b.quota(), Some(smallvec![7, 7]));

        // a third resident kernel suspends co-execution
        let c = testing::kernel(3, 100, 128);
        manager.launch(Arc::clone(&c), 1)?;
        partitioner.update(&manager, 1);
        diff::assert_eq!(a.quota(), None);
        diff::assert_eq!(b.quota(), None);
        assert!(partitioner.search().is_none());

        manager.set_kernel_done(&c, 2);
        partitioner.update(&manager, 2);
        diff::assert_eq!(a.quota(), Some(smallvec![1, 1]));
        diff::assert_eq!(b.quota(), Some(smallvec![7, 7]));
        diff::assert_eq!(a.status(), Status::Ready);
        diff::assert_eq!(b.status(), Status::Ready);
        diff::assert_eq!(partitioner.search().map(|search| search.current()), Some(2));

        for cycle in 3..=200 {
            a.add_instructions(1);
            b.add_instructions(1);
            partitioner.update(&manager, cycle);
        }
        diff::assert_eq!(partitioner.samples.len(), 1);
        diff::assert_eq!(partitioner.samples[0].blocks_a, 2);
        diff::assert_eq!(partitioner.search().map(|search| search.current()), Some(3));
        Ok(())
    }

    #[test]
    fn test_sequential_baseline_restarts_for_new_pair() -> eyre::Result<()> {
        let config = Arc::new(gpu());
        let mut manager = KernelManager::new(Arc::clone(&config));
        let a = testing::kernel(1, 100, 256);
        let b = testing::kernel(2, 100, 256);
        let c = testing::kernel(3, 100, 256);
        manager.launch(Arc::clone(&a), 0)?;
        manager.launch(Arc::clone(&b), 0)?;

        let mut partitioner = Partitioner::new(Config {
            policy: Policy::SequentialBaseline,
            sample_interval: 100,
            ..Config::default()
        });
        partitioner.update(&manager, 0);
        diff::assert_eq!(b.quota(), Some(smallvec![0, 0]));

        // kernel C takes the slot of kernel B and pairs up with kernel A
        manager.set_kernel_done(&b, 1);
        manager.launch(Arc::clone(&c), 1)?;
        partitioner.update(&manager, 2);
        diff::assert_eq!(a.quota(), Some(smallvec![4, 4]));
        diff::assert_eq!(c.quota(), Some(smallvec![0, 0]));
        diff::assert_eq!(a.status(), Status::Ready);

        let mut cycle = 2;
        while a.status() != Status::Evicted {
            cycle += 1;
            assert!(cycle < 10_000, "kernel A never stabilized");
            a.add_instructions(2);
            partitioner.update(&manager, cycle);
        }
        diff::assert_eq!(partitioner.baselines.ipc_a, Some(2.0));
        Ok(())
    }

    #[test]
    fn test_adaptive_search_waits_for_exceeded_blocks() -> eyre::Result<()> {
        let config = Arc::new(gpu());
        let mut manager = KernelManager::new(Arc::clone(&config));
        let a = testing::kernel(1, 10_000, 128);
        let b = testing::kernel(2, 10_000, 128);
        manager.launch(Arc::clone(&a), 0)?;
        manager.launch(Arc::clone(&b), 0)?;

        let mut partitioner = Partitioner::new(Config {
            policy: Policy::AdaptiveSearch {
                initial: 4,
                min: 1,
                max: 10,
                step: 1,
            },
            warmup: 10,
            sample_window: 100,
            ..Config::default()
        });
        partitioner.update(&manager, 0);
        b.add_exceeded_blocks(2);
        for cycle in 1..1_000 {
            a.add_instructions(1);
            partitioner.update(&manager, cycle);
        }
        assert!(partitioner.samples.is_empty());

        b.reset_exceeded_blocks();
        for cycle in 1_000..1_200 {
            a.add_instructions(1);
            partitioner.update(&manager, cycle);
        }
        diff::assert_eq!(partitioner.samples.len(), 1);
        diff::assert_eq!(partitioner.samples[0].ipc_a, 1.0);
        diff::assert_eq!(partitioner.samples[0].blocks_a, 4);
        Ok(())
    }
}
