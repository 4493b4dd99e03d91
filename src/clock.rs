//! Clock domains of the simulated GPU.
//!
//! Each domain keeps a virtual time in seconds that advances by exactly its
//! own period whenever the domain is due.

use crate::config::clock::{ClockFrequencies, ClockPeriods};

/// Set of clock domains due in a tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mask(u8);

impl Mask {
    pub const NONE: Self = Self(0);
    pub const CORE: Self = Self(1 << 0);
    pub const L2: Self = Self(1 << 1);
    pub const ICNT: Self = Self(1 << 2);
    pub const DRAM: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    #[inline]
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Mask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::fmt::Display for Mask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = [
            (Self::CORE, "CORE"),
            (Self::L2, "L2"),
            (Self::ICNT, "ICNT"),
            (Self::DRAM, "DRAM"),
        ]
        .into_iter()
        .filter(|(domain, _)| self.contains(*domain))
        .map(|(_, name)| name)
        .collect();
        write!(f, "{}", names.join("|"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Domains {
    pub core_time: f64,
    pub icnt_time: f64,
    pub l2_time: f64,
    pub dram_time: f64,
    periods: ClockPeriods,
}

impl From<&ClockFrequencies> for Domains {
    fn from(frequencies: &ClockFrequencies) -> Self {
        Self::new(frequencies.periods())
    }
}

impl Domains {
    #[must_use]
    pub fn new(periods: ClockPeriods) -> Self {
        Self {
            core_time: 0.0,
            icnt_time: 0.0,
            l2_time: 0.0,
            dram_time: 0.0,
            periods,
        }
    }

    #[must_use]
    pub fn periods(&self) -> &ClockPeriods {
        &self.periods
    }

    pub fn reset(&mut self) {
        self.core_time = 0.0;
        self.icnt_time = 0.0;
        self.l2_time = 0.0;
        self.dram_time = 0.0;
    }

    /// Determines the domains due next and advances each of them by one period.
    ///
    /// Times are compared exactly: domains that tie with the earliest
    /// time fire in the same tick.
    pub fn next(&mut self) -> Mask {
        let mut mask = Mask::NONE;

        // the l2 domain is compared against the earliest other domain
        let mut smallest = self.core_time.min(self.icnt_time).min(self.dram_time);
        if self.l2_time <= smallest {
            smallest = self.l2_time;
            mask.insert(Mask::L2);
            self.l2_time += self.periods.l2;
        }
        if self.icnt_time <= smallest {
            mask.insert(Mask::ICNT);
            self.icnt_time += self.periods.icnt;
        }
        if self.dram_time <= smallest {
            mask.insert(Mask::DRAM);
            self.dram_time += self.periods.dram;
        }
        if self.core_time <= smallest {
            mask.insert(Mask::CORE);
            self.core_time += self.periods.core;
        }
        mask
    }
}
