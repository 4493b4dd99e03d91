pub mod clock;

pub use clock::ClockFrequencies;

use crate::coexec;
use crate::kernel::Kernel;
use color_eyre::eyre;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid clock domains {0:?} (expected <core>:<icnt>:<l2>:<dram> in MHz)")]
    InvalidClockDomains(String),

    #[error("clock frequency of the {domain} domain must be positive (got {frequency} MHz)")]
    NonPositiveFrequency { domain: &'static str, frequency: f64 },

    #[error("kernel {kernel} requires more resources than a core has")]
    InsufficientResources { kernel: String },
}

/// Early termination limits.
///
/// A limit of `None` means the simulation is not bounded by it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// terminates simulation after this many core cycles
    pub max_cycles: Option<u64>,
    /// terminates simulation after this many retired instructions
    pub max_instructions: Option<u64>,
    /// terminates simulation after this many issued blocks
    pub max_blocks: Option<u64>,
    /// terminates simulation after this many completed blocks
    pub max_completed_blocks: Option<u64>,
}

/// Checkpoint resume configuration.
///
/// Blocks `resume_block..checkpoint_block` of kernel `kernel_id` load their
/// architectural state from the checkpoint store when they are admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    pub kernel_id: u64,
    pub resume_block: u64,
    pub checkpoint_block: u64,
}

impl Resume {
    #[must_use]
    pub fn applies_to(&self, kernel_id: u64, block_id: u64) -> bool {
        kernel_id == self.kernel_id
            && (self.resume_block..self.checkpoint_block).contains(&block_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GPU {
    /// Shader core pipeline warp size
    pub warp_size: usize,
    /// Number of threads per shader core
    pub max_threads_per_core: usize,
    /// Number of registers per shader core.
    /// Limits number of concurrent blocks.
    pub shader_registers: usize,
    /// Size of shared memory per shader core in bytes
    pub shared_memory_size: u32,
    /// Maximum number of concurrent blocks per shader core
    pub max_concurrent_blocks_per_core: usize,
    /// number of processing clusters
    pub num_simt_clusters: usize,
    /// number of simd cores per cluster
    pub num_cores_per_simt_cluster: usize,
    /// number of memory modules (e.g. memory controllers) in gpu
    pub num_memory_controllers: usize,
    /// number of memory subpartition in each memory module
    pub num_sub_partitions_per_memory_controller: usize,
    /// Support concurrent kernels on a core
    pub concurrent_kernel_sm: bool,
    /// Maximum kernels that can run concurrently on the GPU
    pub max_concurrent_kernels: usize,
    /// Clock domain frequencies in MHz
    pub clock_frequencies: ClockFrequencies,

    /// Stop the simulation at deadlock
    pub deadlock_check: bool,
    /// Number of core cycles between two deadlock checks
    pub deadlock_window: u64,
    /// Number of core cycles between two liveness messages
    pub stat_sample_freq: u64,

    /// Flush L1 caches once all threads completed
    pub flush_l1_cache: bool,
    /// Flush L2 caches once all threads completed
    pub flush_l2_cache: bool,

    /// Response packets a cluster can buffer from the interconnect
    pub num_cluster_ejection_buffer_size: usize,
    /// Packets buffered per interconnect node (`None` is unbounded)
    pub interconn_buffer_size: Option<usize>,
    /// Request queue capacity of each memory sub partition
    pub sub_partition_queue_size: usize,
    /// L2 access latency in L2 cycles
    pub l2_latency: u64,
    /// DRAM access latency in DRAM cycles
    pub dram_latency: u64,

    pub limits: Limits,
    pub coexec: Option<coexec::Config>,
    pub resume: Option<Resume>,
}

/// Rounds `n` up to the next multiple of `k`.
#[inline]
#[must_use]
pub fn pad_to_multiple(n: usize, k: usize) -> usize {
    let rem = n % k;
    if rem == 0 {
        n
    } else {
        ((n / k) + 1) * k
    }
}

/// Registers per thread rounded up to a multiple of four.
#[inline]
#[must_use]
pub fn registers_per_thread_padded(num_registers: u32) -> usize {
    ((num_registers + 3) & !3) as usize
}

impl GPU {
    pub fn from_reader(reader: impl std::io::Read) -> eyre::Result<Self> {
        let config: Self = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> eyre::Result<Self> {
        use color_eyre::eyre::WrapErr;
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .wrap_err_with(|| format!("failed to open config {}", path.display()))?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn validate(&self) -> eyre::Result<()> {
        self.clock_frequencies.validate()?;
        if self.warp_size == 0 {
            eyre::bail!("warp size must be non-zero");
        }
        if self.max_concurrent_kernels == 0 {
            eyre::bail!("at least one concurrent kernel must be allowed");
        }
        if self.num_simt_clusters == 0 || self.num_cores_per_simt_cluster == 0 {
            eyre::bail!("at least one core is required");
        }
        if self.deadlock_window == 0 {
            eyre::bail!("deadlock window must be non-zero");
        }
        if let Some(ref coexec) = self.coexec {
            coexec.validate(self)?;
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn total_cores(&self) -> usize {
        self.num_simt_clusters * self.num_cores_per_simt_cluster
    }

    #[inline]
    #[must_use]
    pub fn num_sub_partitions(&self) -> usize {
        self.num_memory_controllers * self.num_sub_partitions_per_memory_controller
    }

    #[inline]
    #[must_use]
    pub fn global_core_id(&self, cluster_id: usize, core_id: usize) -> usize {
        cluster_id * self.num_cores_per_simt_cluster + core_id
    }

    #[inline]
    #[must_use]
    pub fn global_core_id_to_cluster_id(&self, core_id: usize) -> usize {
        core_id / self.num_cores_per_simt_cluster
    }

    #[inline]
    #[must_use]
    pub fn global_core_id_to_core_id(&self, core_id: usize) -> usize {
        core_id % self.num_cores_per_simt_cluster
    }

    /// Interconnect device id of a memory sub partition.
    ///
    /// Clusters occupy the first device ids.
    #[inline]
    #[must_use]
    pub fn mem_id_to_device_id(&self, mem_id: usize) -> usize {
        mem_id + self.num_simt_clusters
    }

    /// Number of threads a kernel block occupies on a core.
    #[inline]
    #[must_use]
    pub fn threads_per_block_padded(&self, kernel: &Kernel) -> usize {
        pad_to_multiple(kernel.threads_per_block(), self.warp_size)
    }

    /// Number of registers a kernel block occupies on a core.
    #[inline]
    #[must_use]
    pub fn registers_per_block(&self, kernel: &Kernel) -> usize {
        self.threads_per_block_padded(kernel)
            * registers_per_thread_padded(kernel.config().num_registers)
    }

    /// Maximum number of blocks of `kernel` a single core can hold.
    ///
    /// This is the minimum over the thread, shared memory, register
    /// and block slot limits, further bounded when the grid is too small to
    /// keep every core busy.
    pub fn max_blocks(&self, kernel: &Kernel) -> Result<usize, Error> {
        let threads_per_block = self.threads_per_block_padded(kernel);
        let launch = kernel.config();

        // limit by n_threads/shader
        let by_thread_limit = if threads_per_block > 0 {
            self.max_threads_per_core / threads_per_block
        } else {
            0
        };

        // limit by shmem/shader
        let by_shared_mem_limit = if launch.shared_mem_bytes > 0 {
            Some(self.shared_memory_size as usize / launch.shared_mem_bytes as usize)
        } else {
            None
        };

        // limit by register count, rounded up to multiple of 4.
        let by_register_limit = if launch.num_registers > 0 {
            Some(self.shader_registers / self.registers_per_block(kernel).max(1))
        } else {
            None
        };

        let by_block_limit = self.max_concurrent_blocks_per_core;

        let mut limit = [
            Some(by_thread_limit),
            by_shared_mem_limit,
            by_register_limit,
            Some(by_block_limit),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(usize::MAX);

        // max blocks per shader is limited by number of blocks
        // if not enough to keep all cores busy
        let num_blocks = kernel.num_blocks() as usize;
        if num_blocks < limit.saturating_mul(self.total_cores()) {
            limit = num_blocks.div_ceil(self.total_cores());
        }
        if limit < 1 {
            return Err(Error::InsufficientResources {
                kernel: kernel.name().to_string(),
            });
        }
        Ok(limit)
    }
}

impl Default for GPU {
    fn default() -> Self {
        Self {
            warp_size: 32,
            max_threads_per_core: 2048,
            shader_registers: 65536,
            shared_memory_size: 98304,
            max_concurrent_blocks_per_core: 32,
            num_simt_clusters: 20,
            num_cores_per_simt_cluster: 2,
            num_memory_controllers: 8,
            num_sub_partitions_per_memory_controller: 2,
            concurrent_kernel_sm: false,
            max_concurrent_kernels: 8,
            clock_frequencies: ClockFrequencies::default(),
            deadlock_check: true,
            deadlock_window: 50_000,
            stat_sample_freq: 10_000,
            flush_l1_cache: false,
            flush_l2_cache: false,
            num_cluster_ejection_buffer_size: 8,
            interconn_buffer_size: Some(256),
            sub_partition_queue_size: 8,
            l2_latency: 10,
            dram_latency: 100,
            limits: Limits::default(),
            coexec: None,
            resume: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::{Kernel, KernelLaunch};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    fn kernel(threads: usize, registers: u32, shared_mem: u32, blocks: u32) -> Kernel {
        Kernel::new(KernelLaunch {
            threads_per_block: threads,
            num_registers: registers,
            shared_mem_bytes: shared_mem,
            num_blocks: blocks,
            ..KernelLaunch::default()
        })
    }

    #[test]
    fn test_pad_to_multiple() {
        diff::assert_eq!(super::pad_to_multiple(0, 32), 0);
        diff::assert_eq!(super::pad_to_multiple(1, 32), 32);
        diff::assert_eq!(super::pad_to_multiple(32, 32), 32);
        diff::assert_eq!(super::pad_to_multiple(33, 32), 64);
        diff::assert_eq!(super::registers_per_thread_padded(0), 0);
        diff::assert_eq!(super::registers_per_thread_padded(5), 8);
        diff::assert_eq!(super::registers_per_thread_padded(8), 8);
    }

    #[test]
    fn test_max_blocks_is_minimum_of_limits() -> eyre::Result<()> {
        let config = super::GPU::default();

        // 256 threads: 8 by threads, 96K/16K = 6 by shared memory,
        // 65536 / (256 * 32) = 8 by registers
        let k = kernel(256, 30, 16 * 1024, 10_000);
        diff::assert_eq!(config.max_blocks(&k)?, 6);

        // 100 threads are padded to 128: 16 by threads, 65536 / (128 * 64) = 8 by registers
        let k = kernel(100, 61, 0, 10_000);
        diff::assert_eq!(config.max_blocks(&k)?, 8);
        Ok(())
    }

    #[test]
    fn test_max_blocks_bounded_by_small_grid() -> eyre::Result<()> {
        let config = super::GPU::default();
        assert_eq!(config.total_cores(), 40);
        let k = kernel(32, 0, 0, 41);
        diff::assert_eq!(config.max_blocks(&k)?, 2);
        let k = kernel(32, 0, 0, 40);
        diff::assert_eq!(config.max_blocks(&k)?, 1);
        Ok(())
    }

    #[test]
    fn test_max_blocks_insufficient_resources() {
        let config = super::GPU::default();
        let k = kernel(32, 0, 200 * 1024, 100);
        assert!(matches!(
            config.max_blocks(&k),
            Err(super::Error::InsufficientResources { .. })
        ));
    }

    #[test]
    fn test_parse_yaml_config() -> eyre::Result<()> {
        let yaml = r#"
warp_size: 32
max_threads_per_core: 1024
concurrent_kernel_sm: true
clock_frequencies: "1000.0:1000.0:1000.0:500.0"
limits:
  max_cycles: 100
coexec:
  policy: !static
    kernel_a_blocks: 4
"#;
        let config = super::GPU::from_reader(yaml.as_bytes())?;
        diff::assert_eq!(config.max_threads_per_core, 1024);
        diff::assert_eq!(config.limits.max_cycles, Some(100));
        diff::assert_eq!(config.clock_frequencies.dram, 500.0);
        diff::assert_eq!(
            config.coexec.map(|coexec| coexec.policy),
            Some(crate::coexec::Policy::Static { kernel_a_blocks: 4 })
        );
        // defaults are kept for missing values
        diff::assert_eq!(config.deadlock_window, 50_000);
        Ok(())
    }

    #[test]
    fn test_resume_range() {
        let resume = super::Resume {
            kernel_id: 2,
            resume_block: 4,
            checkpoint_block: 8,
        };
        assert!(!resume.applies_to(1, 4));
        assert!(!resume.applies_to(2, 3));
        assert!(resume.applies_to(2, 4));
        assert!(resume.applies_to(2, 7));
        assert!(!resume.applies_to(2, 8));
    }
}
