use super::Error;
use serde::{Deserialize, Serialize};

/// Clock domain frequencies in MHz.
///
/// Serialized as `<core>:<icnt>:<l2>:<dram>`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockFrequencies {
    pub core: f64,
    pub icnt: f64,
    pub l2: f64,
    pub dram: f64,
}

impl Default for ClockFrequencies {
    fn default() -> Self {
        Self {
            core: 500.0,
            icnt: 2000.0,
            l2: 2000.0,
            dram: 2000.0,
        }
    }
}

/// Clock periods in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockPeriods {
    pub core: f64,
    pub icnt: f64,
    pub l2: f64,
    pub dram: f64,
}

impl ClockFrequencies {
    pub fn validate(&self) -> Result<(), Error> {
        for (domain, frequency) in [
            ("core", self.core),
            ("icnt", self.icnt),
            ("l2", self.l2),
            ("dram", self.dram),
        ] {
            if !(frequency > 0.0 && frequency.is_finite()) {
                return Err(Error::NonPositiveFrequency { domain, frequency });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn periods(&self) -> ClockPeriods {
        const MHZ: f64 = 1e6;
        ClockPeriods {
            core: 1.0 / (self.core * MHZ),
            icnt: 1.0 / (self.icnt * MHZ),
            l2: 1.0 / (self.l2 * MHZ),
            dram: 1.0 / (self.dram * MHZ),
        }
    }
}

impl std::str::FromStr for ClockFrequencies {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidClockDomains(value.to_string());
        let frequencies = value
            .split(':')
            .map(|freq| freq.trim().parse::<f64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        let [core, icnt, l2, dram] = frequencies[..] else {
            return Err(invalid());
        };
        let frequencies = Self {
            core,
            icnt,
            l2,
            dram,
        };
        frequencies.validate()?;
        Ok(frequencies)
    }
}

impl TryFrom<String> for ClockFrequencies {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClockFrequencies> for String {
    fn from(freqs: ClockFrequencies) -> Self {
        freqs.to_string()
    }
}

impl std::fmt::Display for ClockFrequencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1}:{:.1}:{:.1}:{:.1}",
            self.core, self.icnt, self.l2, self.dram
        )
    }
}
