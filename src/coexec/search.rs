//! Hill climb over the block quota of the first of two co-running kernels.

use super::ConfigurationPerf;
use serde::{Deserialize, Serialize};

#[derive(strum::Display, Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    #[default]
    None,
    Forward,
    Backward,
}

/// Why the search stopped.
///
/// Both variants carry the configuration the search settled on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The next step in the committed direction did not improve.
    Converged(ConfigurationPerf),
    /// The next step would leave the configured quota range.
    BoundaryReached(ConfigurationPerf),
}

impl Outcome {
    #[must_use]
    pub fn configuration(&self) -> &ConfigurationPerf {
        match self {
            Self::Converged(perf) | Self::BoundaryReached(perf) => perf,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (reason, perf) = match self {
            Self::Converged(perf) => ("converged", perf),
            Self::BoundaryReached(perf) => ("boundary reached", perf),
        };
        write!(
            f,
            "{reason}: {} + {} blocks (ipc {:.3} + {:.3})",
            perf.blocks_a, perf.blocks_b, perf.ipc_a, perf.ipc_b
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Sample the given number of blocks for kernel A next.
    Continue(usize),
    Done(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Search {
    pub direction: Direction,
    pub step: usize,
    pub min: usize,
    pub max: usize,
    current: usize,
    accepted: Option<ConfigurationPerf>,
    num_evaluations: usize,
}

impl Search {
    #[must_use]
    pub fn new(initial: usize, min: usize, max: usize, step: usize) -> Self {
        Self {
            direction: Direction::None,
            step,
            min,
            max,
            current: initial,
            accepted: None,
            num_evaluations: 0,
        }
    }

    /// Blocks of kernel A currently being sampled.
    #[must_use]
    pub fn current(&self) -> usize {
        self.current
    }

    /// Last configuration that improved on its predecessor.
    #[must_use]
    pub fn accepted(&self) -> Option<&ConfigurationPerf> {
        self.accepted.as_ref()
    }

    #[must_use]
    pub fn num_evaluations(&self) -> usize {
        self.num_evaluations
    }

    /// Mean of the per kernel speedups of `sample` over `reference`.
    #[must_use]
    pub fn weighted_speedup(sample: &ConfigurationPerf, reference: &ConfigurationPerf) -> f64 {
        let speedup = |current: f64, previous: f64| {
            if previous > 0.0 {
                current / previous
            } else if current > 0.0 {
                f64::INFINITY
            } else {
                1.0
            }
        };
        (speedup(sample.ipc_a, reference.ipc_a) + speedup(sample.ipc_b, reference.ipc_b)) / 2.0
    }

    /// Feeds the performance measured for the current configuration.
    pub fn evaluate(&mut self, sample: ConfigurationPerf) -> Step {
        let step = self.step as i64;
        let (next, accepted) = match self.accepted.take() {
            None => (self.current as i64 + step, sample),
            Some(accepted) => {
                self.num_evaluations += 1;
                let speedup = Self::weighted_speedup(&sample, &accepted);
                log::debug!(
                    "search: {} blocks give weighted speedup {speedup:.4} over {} blocks ({})",
                    sample.blocks_a,
                    accepted.blocks_a,
                    self.direction
                );
                if speedup > 1.0 {
                    if self.direction == Direction::None {
                        self.direction = Direction::Forward;
                    }
                    let next = match self.direction {
                        Direction::Backward => self.current as i64 - step,
                        _ => self.current as i64 + step,
                    };
                    (next, sample)
                } else if self.direction == Direction::None {
                    // the first forward probe did not pay off, try the other side
                    self.direction = Direction::Backward;
                    (self.current as i64 - 2 * step, accepted)
                } else {
                    return Step::Done(Outcome::Converged(accepted));
                }
            }
        };

        if next < self.min as i64 || next > self.max as i64 {
            return Step::Done(Outcome::BoundaryReached(accepted));
        }
        self.accepted = Some(accepted);
        self.current = next as usize;
        Step::Continue(self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::{Direction, Outcome, Search, Step};
    use crate::coexec::ConfigurationPerf;
    use pretty_assertions_sorted as diff;

    fn sample(blocks_a: usize, oracle: impl Fn(usize) -> f64) -> ConfigurationPerf {
        ConfigurationPerf {
            blocks_a,
            blocks_b: 10 - blocks_a,
            instructions_a: 0,
            instructions_b: 0,
            ipc_a: oracle(blocks_a),
            ipc_b: 1.0,
        }
    }

    fn run(mut search: Search, oracle: impl Fn(usize) -> f64) -> (Outcome, usize) {
        let mut num_windows = 0;
        loop {
            num_windows += 1;
            assert!(num_windows < 100, "search did not terminate");
            match search.evaluate(sample(search.current(), &oracle)) {
                Step::Continue(_) => {}
                Step::Done(outcome) => return (outcome, num_windows),
            }
        }
    }

    #[test]
    fn test_unimodal_oracle_finds_peak() {
        let oracle = |blocks: usize| 10.0 - (blocks as f64 - 6.0).abs();
        let (outcome, num_windows) = run(Search::new(1, 1, 10, 1), oracle);
        diff::assert_eq!(outcome, Outcome::Converged(sample(6, oracle)));
        diff::assert_eq!(num_windows, 7);
    }

    #[test]
    fn test_unimodal_oracle_from_above_peak() {
        let oracle = |blocks: usize| 10.0 - (blocks as f64 - 6.0).abs();
        let mut search = Search::new(8, 1, 10, 1);
        let outcome = loop {
            if let Step::Done(outcome) = search.evaluate(sample(search.current(), oracle)) {
                break outcome;
            }
        };
        diff::assert_eq!(search.direction, Direction::Backward);
        diff::assert_eq!(outcome.configuration().blocks_a, 6);
    }

    #[test]
    fn test_decreasing_oracle_keeps_initial_quota() {
        let oracle = |blocks: usize| 20.0 - blocks as f64;
        let mut search = Search::new(1, 1, 10, 1);
        diff::assert_eq!(search.evaluate(sample(1, oracle)), Step::Continue(2));
        // reversing would leave the range
        diff::assert_eq!(
            search.evaluate(sample(2, oracle)),
            Step::Done(Outcome::BoundaryReached(sample(1, oracle)))
        );
        diff::assert_eq!(search.num_evaluations(), 1);
    }

    #[test]
    fn test_increasing_oracle_stops_at_upper_bound() {
        let oracle = |blocks: usize| blocks as f64;
        let (outcome, _) = run(Search::new(3, 1, 5, 1), oracle);
        diff::assert_eq!(outcome, Outcome::BoundaryReached(sample(5, oracle)));
    }

    #[test]
    fn test_reversal_steps_back_past_initial() {
        let oracle = |blocks: usize| 20.0 - blocks as f64;
        let mut search = Search::new(4, 1, 10, 1);
        diff::assert_eq!(search.evaluate(sample(4, oracle)), Step::Continue(5));
        diff::assert_eq!(search.evaluate(sample(5, oracle)), Step::Continue(3));
        diff::assert_eq!(search.direction, Direction::Backward);
        diff::assert_eq!(search.evaluate(sample(3, oracle)), Step::Continue(2));
        diff::assert_eq!(search.evaluate(sample(2, oracle)), Step::Continue(1));
        diff::assert_eq!(
            search.evaluate(sample(1, oracle)),
            Step::Done(Outcome::BoundaryReached(sample(1, oracle)))
        );
    }
}
