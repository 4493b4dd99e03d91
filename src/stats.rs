use crate::coexec;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sim {
    /// Core cycles
    pub cycles: u64,
    pub instructions: u64,
    pub num_blocks_issued: u64,
    pub num_blocks_completed: u64,
    pub elapsed_millis: u128,
}

impl std::ops::AddAssign for Sim {
    fn add_assign(&mut self, other: Self) {
        self.cycles += other.cycles;
        self.instructions += other.instructions;
        self.num_blocks_issued += other.num_blocks_issued;
        self.num_blocks_completed += other.num_blocks_completed;
        self.elapsed_millis += other.elapsed_millis;
    }
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    pub id: u64,
    pub name: String,
    pub start_cycle: Option<u64>,
    pub completed_cycle: Option<u64>,
    pub instructions: u64,
    pub num_blocks: u64,
    pub elapsed_millis: Option<u128>,
}

impl Kernel {
    #[must_use]
    pub fn cycles(&self) -> Option<u64> {
        Some(self.completed_cycle? - self.start_cycle?)
    }

    #[must_use]
    pub fn ipc(&self) -> Option<f64> {
        let cycles = self.cycles()?;
        if cycles == 0 {
            return None;
        }
        Some(self.instructions as f64 / cycles as f64)
    }
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    /// Replies held back because the interconnect had no buffer space
    pub stall_icnt_to_core: u64,
    /// Requests held back because a sub partition was full
    pub stall_dram_full: u64,
    pub partition_requests_in_parallel: u64,
    pub partition_replies_in_parallel: u64,
    /// L2 cycles in which at least one sub partition received a request
    pub partition_util_cycles: u64,
    pub l1_flushed_lines: u64,
    pub l2_flushed_lines: u64,
}

#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coexec {
    pub samples: Vec<coexec::ConfigurationPerf>,
    pub outcome: Option<coexec::Outcome>,
    pub baselines: coexec::Baselines,
}

impl From<&coexec::Partitioner> for Coexec {
    fn from(partitioner: &coexec::Partitioner) -> Self {
        Self {
            samples: partitioner.samples.clone(),
            outcome: partitioner.outcome.clone(),
            baselines: partitioner.baselines.clone(),
        }
    }
}

#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub sim: Sim,
    pub memory: Memory,
    /// Completed kernels in order of completion
    pub kernels: IndexMap<u64, Kernel>,
    pub coexec: Option<Coexec>,
}

impl Stats {
    #[must_use]
    pub fn ipc(&self) -> f64 {
        if self.sim.cycles == 0 {
            0.0
        } else {
            self.sim.instructions as f64 / self.sim.cycles as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Kernel, Sim, Stats};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    #[test]
    fn test_kernel_ipc() {
        let kernel = Kernel {
            start_cycle: Some(100),
            completed_cycle: Some(300),
            instructions: 500,
            ..Kernel::default()
        };
        diff::assert_eq!(kernel.cycles(), Some(200));
        diff::assert_eq!(kernel.ipc(), Some(2.5));
        diff::assert_eq!(Kernel::default().ipc(), None);
    }

    #[test]
    fn test_serialize_stats() -> eyre::Result<()> {
        let mut stats = Stats::default();
        stats.sim += Sim {
            cycles: 10,
            instructions: 40,
            ..Sim::default()
        };
        stats.kernels.insert(
            3,
            Kernel {
                id: 3,
                name: "vectoradd".to_string(),
                ..Kernel::default()
            },
        );
        diff::assert_eq!(stats.ipc(), 4.0);
        let json = serde_json::to_string(&stats)?;
        let decoded: Stats = serde_json::from_str(&json)?;
        diff::assert_eq!(decoded, stats);
        Ok(())
    }
}
