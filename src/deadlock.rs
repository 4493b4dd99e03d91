use serde::Serialize;

/// Detects simulations that stopped making progress.
///
/// Every `window` core cycles the number of retired instructions is compared
/// against the count at the previous window boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detector {
    pub enabled: bool,
    pub window: u64,
    last_instructions: u64,
    deadlocked: bool,
}

impl Detector {
    #[must_use]
    pub fn new(enabled: bool, window: u64) -> Self {
        Self {
            enabled,
            window,
            last_instructions: 0,
            deadlocked: false,
        }
    }

    /// Checks for progress at the end of core cycle `cycle`.
    ///
    /// Returns whether a deadlock was detected.
    pub fn check(&mut self, cycle: u64, num_instructions: u64) -> bool {
        if !self.enabled || self.window == 0 || cycle % self.window != 0 {
            return self.deadlocked;
        }
        if num_instructions == self.last_instructions {
            log::warn!("no instructions retired in {} cycles until cycle {cycle}", self.window);
            self.deadlocked = true;
        } else {
            self.last_instructions = num_instructions;
        }
        self.deadlocked
    }

    #[must_use]
    pub fn deadlocked(&self) -> bool {
        self.enabled && self.deadlocked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusyCore {
    pub cluster_id: usize,
    pub core_id: usize,
    pub global_core_id: usize,
    /// Threads that did not complete
    pub not_completed: usize,
}

/// Components still holding work when a deadlock was detected.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub cycle: u64,
    pub num_instructions: u64,
    pub busy_cores: Vec<BusyCore>,
    pub busy_memory_partitions: Vec<usize>,
    pub interconn_busy: bool,
}

impl Report {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.busy_cores.is_empty() && self.busy_memory_partitions.is_empty() && !self.interconn_busy
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "DEADLOCK at cycle {} ({} instructions retired)",
            self.cycle, self.num_instructions
        )?;
        for core in &self.busy_cores {
            writeln!(
                f,
                "  core {} (cluster {}, core {}): {} unfinished threads",
                core.global_core_id, core.cluster_id, core.core_id, core.not_completed
            )?;
        }
        for partition_id in &self.busy_memory_partitions {
            writeln!(f, "  memory partition {partition_id}: busy")?;
        }
        if self.interconn_busy {
            writeln!(f, "  interconnect: busy")?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("deadlock detected\n{report}")]
pub struct DeadlockError {
    pub report: Report,
}
