use crate::kernel::{Kernel, KernelLaunch};
use crate::mem_fetch;
use std::sync::Arc;

static LOGGER: std::sync::Once = std::sync::Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        env_logger::builder().is_test(true).init();
    });
}

#[must_use]
pub fn fetch(uid: u64, kind: mem_fetch::AccessKind) -> mem_fetch::MemFetch {
    mem_fetch::MemFetch {
        uid,
        kernel_id: 1,
        core_id: 0,
        cluster_id: 0,
        sub_partition_id: 0,
        access: mem_fetch::Access {
            addr: uid * mem_fetch::PARTITION_INTERLEAVING,
            kind,
            data_size: 32,
        },
        is_reply: false,
        status: mem_fetch::Status::InCoreQueue,
    }
}

/// Kernel without register or shared memory usage.
#[must_use]
pub fn kernel(id: u64, num_blocks: u32, threads_per_block: usize) -> Arc<Kernel> {
    Arc::new(Kernel::new(KernelLaunch {
        id,
        name: format!("kernel-{id}"),
        num_blocks,
        threads_per_block,
        ..KernelLaunch::default()
    }))
}

#[must_use]
pub fn kernel_with_resources(
    id: u64,
    num_blocks: u32,
    threads_per_block: usize,
    num_registers: u32,
    shared_mem_bytes: u32,
) -> Arc<Kernel> {
    Arc::new(Kernel::new(KernelLaunch {
        id,
        name: format!("kernel-{id}"),
        num_blocks,
        threads_per_block,
        num_registers,
        shared_mem_bytes,
        ..KernelLaunch::default()
    }))
}

/// Small GPU with two clusters of two cores and two memory partitions.
#[must_use]
pub fn small_gpu() -> crate::config::GPU {
    crate::config::GPU {
        num_simt_clusters: 2,
        num_cores_per_simt_cluster: 2,
        num_memory_controllers: 2,
        num_sub_partitions_per_memory_controller: 2,
        max_concurrent_kernels: 4,
        deadlock_window: 5_000,
        stat_sample_freq: 1_000,
        ..crate::config::GPU::default()
    }
}
