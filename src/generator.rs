//! Seeded generation of per-function specifications.
//!
//! Turns per-minute invocation counts into inter-arrival times and
//! per-invocation runtime requests. Every generator owns its RNG, so two
//! generators built from the same seed produce identical specifications.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::LoaderError;
use crate::function::{FunctionSpecification, RuntimeSpecification, TraceGranularity};

/// Shortest inter-arrival time the scheduler can honor, in microseconds.
const MIN_IAT_MICROS: f64 = 1.0;

/// Room left at the end of every slot, in microseconds.
const SLOT_SLACK_MICROS: u64 = 1_000;

/// How invocations are spread inside one trace slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IatDistribution {
    /// Poisson arrivals
    Exponential,
    /// Uniformly random gaps
    Uniform,
    /// Evenly spaced invocations
    Equidistant,
}

impl FromStr for IatDistribution {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exponential" => Ok(IatDistribution::Exponential),
            "uniform" => Ok(IatDistribution::Uniform),
            "equidistant" => Ok(IatDistribution::Equidistant),
            other => Err(LoaderError::UnsupportedDistribution(other.to_string())),
        }
    }
}

impl fmt::Display for IatDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IatDistribution::Exponential => write!(f, "exponential"),
            IatDistribution::Uniform => write!(f, "uniform"),
            IatDistribution::Equidistant => write!(f, "equidistant"),
        }
    }
}

/// Percentile statistics of a function's execution time, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub average: u32,
    pub minimum: u32,
    pub maximum: u32,
    pub percentile0: u32,
    pub percentile1: u32,
    pub percentile25: u32,
    pub percentile50: u32,
    pub percentile75: u32,
    pub percentile99: u32,
    pub percentile100: u32,
}

impl RuntimeStats {
    /// `(quantile upper bound, low, high)` for each band.
    fn bands(&self) -> [(f64, u32, u32); 7] {
        [
            (0.01, self.minimum, self.percentile0),
            (0.25, self.percentile1, self.percentile25),
            (0.50, self.percentile25, self.percentile50),
            (0.75, self.percentile50, self.percentile75),
            (0.95, self.percentile75, self.percentile99),
            (0.99, self.percentile99, self.percentile100),
            // The 100th percentile can sit below the maximum
            (1.0, self.percentile100, self.maximum),
        ]
    }
}

/// Percentile statistics of a function's memory footprint, in MiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub average: u32,
    pub percentile1: u32,
    pub percentile5: u32,
    pub percentile25: u32,
    pub percentile50: u32,
    pub percentile75: u32,
    pub percentile95: u32,
    pub percentile99: u32,
    pub percentile100: u32,
}

impl MemoryStats {
    fn bands(&self) -> [(f64, u32, u32); 8] {
        [
            (0.01, 1, self.percentile1),
            (0.05, self.percentile1, self.percentile5),
            (0.25, self.percentile5, self.percentile25),
            (0.50, self.percentile25, self.percentile50),
            (0.75, self.percentile50, self.percentile75),
            (0.95, self.percentile75, self.percentile95),
            (0.99, self.percentile95, self.percentile99),
            (1.0, self.percentile99, self.percentile100),
        ]
    }
}

/// What a function asks of the platform per invocation.
///
/// Without statistics every invocation requests the fixed `runtime` and
/// `memory`; with them each invocation is sampled independently.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecutionProfile {
    pub runtime: u32,
    pub memory: u32,
    pub runtime_stats: Option<RuntimeStats>,
    pub memory_stats: Option<MemoryStats>,
}

impl From<RuntimeSpecification> for ExecutionProfile {
    fn from(spec: RuntimeSpecification) -> Self {
        Self {
            runtime: spec.runtime,
            memory: spec.memory,
            runtime_stats: None,
            memory_stats: None,
        }
    }
}

/// Generates [`FunctionSpecification`]s from per-minute invocation counts.
pub struct SpecificationGenerator {
    rng: StdRng,
}

impl SpecificationGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Inter-arrival times for `count` invocations inside one trace slot.
    ///
    /// The result never spans more than one granularity unit minus 1ms: if
    /// the raw draws overshoot they are scaled down proportionally.
    pub fn generate_iats_for_slot(
        &mut self,
        count: usize,
        distribution: IatDistribution,
        granularity: TraceGranularity,
    ) -> Vec<f64> {
        if count == 0 {
            return Vec::new();
        }

        // Keep the last invocation inside the slot
        let slot = (granularity.unit_micros() - SLOT_SLACK_MICROS) as f64;
        let mean = slot / count as f64;

        let mut iats: Vec<f64> = (0..count)
            .map(|_| {
                let iat = match distribution {
                    IatDistribution::Equidistant => mean,
                    IatDistribution::Uniform => self.rng.gen_range(0.0..2.0 * mean),
                    IatDistribution::Exponential => {
                        // Inverse transform sampling; 1 - u lies in (0, 1]
                        let u: f64 = self.rng.gen();
                        -(1.0 - u).ln() * mean
                    }
                };
                iat.max(MIN_IAT_MICROS)
            })
            .collect();

        let total: f64 = iats.iter().sum();
        if total > slot {
            for iat in iats.iter_mut() {
                *iat = (*iat / total * slot).max(MIN_IAT_MICROS);
            }
        }

        iats
    }

    /// Runtime and memory request of one invocation.
    ///
    /// Each resource independently keeps its average with probability 1/2;
    /// otherwise a percentile band is picked by a uniform quantile and the
    /// value is drawn uniformly inside it.
    pub fn generate_execution_spec(&mut self, profile: &ExecutionProfile) -> RuntimeSpecification {
        let memory = match &profile.memory_stats {
            Some(stats) => self.sample_banded(stats.average, &stats.bands()),
            None => profile.memory,
        };
        let runtime = match &profile.runtime_stats {
            Some(stats) => self.sample_banded(stats.average, &stats.bands()),
            None => profile.runtime,
        };
        RuntimeSpecification { runtime, memory }
    }

    fn sample_banded(&mut self, average: u32, bands: &[(f64, u32, u32)]) -> u32 {
        let quantile: f64 = self.rng.gen();
        if self.rng.gen_bool(0.5) {
            return average;
        }

        let (_, low, high) = bands
            .iter()
            .copied()
            .find(|(upper, _, _)| quantile <= *upper)
            .unwrap_or(bands[bands.len() - 1]);
        self.rng.gen_range(low.min(high)..=low.max(high))
    }

    /// Full specification for a function whose trace asks for
    /// `per_minute_count` invocations shaped by `profile`.
    pub fn generate_invocation_data(
        &mut self,
        per_minute_count: &[usize],
        distribution: IatDistribution,
        granularity: TraceGranularity,
        profile: &ExecutionProfile,
    ) -> FunctionSpecification {
        let mut iat = Vec::with_capacity(per_minute_count.iter().sum());
        for &count in per_minute_count {
            iat.extend(self.generate_iats_for_slot(count, distribution, granularity));
        }

        let runtime_specification = (0..iat.len())
            .map(|_| self.generate_execution_spec(profile))
            .collect();

        FunctionSpecification {
            runtime_specification,
            iat,
            per_minute_count: per_minute_count.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_specification() {
        let counts = [5, 0, 12];
        let profile = ExecutionProfile::from(RuntimeSpecification {
            runtime: 100,
            memory: 128,
        });
        let a = SpecificationGenerator::new(7).generate_invocation_data(
            &counts,
            IatDistribution::Exponential,
            TraceGranularity::Minute,
            &profile,
        );
        let b = SpecificationGenerator::new(7).generate_invocation_data(
            &counts,
            IatDistribution::Exponential,
            TraceGranularity::Minute,
            &profile,
        );
        assert_eq!(a, b);
        assert!(a.is_consistent());
        assert_eq!(a.runtime_specification.len(), 17);
        assert!(a
            .runtime_specification
            .iter()
            .all(|spec| spec.runtime == 100 && spec.memory == 128));
    }

    fn profile_with_stats() -> ExecutionProfile {
        ExecutionProfile {
            runtime: 0,
            memory: 0,
            runtime_stats: Some(RuntimeStats {
                average: 120,
                minimum: 5,
                maximum: 900,
                percentile0: 8,
                percentile1: 10,
                percentile25: 40,
                percentile50: 100,
                percentile75: 150,
                percentile99: 600,
                percentile100: 850,
            }),
            memory_stats: Some(MemoryStats {
                average: 170,
                percentile1: 60,
                percentile5: 80,
                percentile25: 120,
                percentile50: 160,
                percentile75: 200,
                percentile95: 300,
                percentile99: 400,
                percentile100: 512,
            }),
        }
    }

    #[test]
    fn test_sampled_execution_specs_are_seeded_and_bounded() {
        let profile = profile_with_stats();
        let counts = [200, 150];
        let sample = |seed| {
            SpecificationGenerator::new(seed).generate_invocation_data(
                &counts,
                IatDistribution::Uniform,
                TraceGranularity::Minute,
                &profile,
            )
        };

        let a = sample(11);
        assert_eq!(a.runtime_specification, sample(11).runtime_specification);
        assert_ne!(a.runtime_specification, sample(12).runtime_specification);
        assert_eq!(a.runtime_specification.len(), 350);

        for spec in &a.runtime_specification {
            assert!((5..=900).contains(&spec.runtime), "runtime {}", spec.runtime);
            assert!((1..=512).contains(&spec.memory), "memory {}", spec.memory);
        }

        // Roughly half the invocations keep the average, the rest vary
        let averages = a
            .runtime_specification
            .iter()
            .filter(|spec| spec.runtime == 120)
            .count();
        assert!(averages > 100 && averages < 300, "averages {}", averages);
        let distinct: std::collections::HashSet<_> =
            a.runtime_specification.iter().map(|s| s.runtime).collect();
        assert!(distinct.len() > 20);
    }

    #[test]
    fn test_stats_only_for_memory() {
        let profile = ExecutionProfile {
            runtime: 250,
            runtime_stats: None,
            ..profile_with_stats()
        };
        let mut generator = SpecificationGenerator::new(5);
        for _ in 0..100 {
            let spec = generator.generate_execution_spec(&profile);
            assert_eq!(spec.runtime, 250);
            assert!(spec.memory >= 1 && spec.memory <= 512);
        }
    }

    #[test]
    fn test_stats_parse_from_json() {
        let stats: RuntimeStats = serde_json::from_str(
            r#"{"average":1,"minimum":1,"maximum":3,"percentile0":1,"percentile1":1,
                "percentile25":1,"percentile50":2,"percentile75":2,"percentile99":3,"percentile100":3}"#,
        )
        .unwrap();
        assert_eq!(stats.maximum, 3);
    }

    #[test]
    fn test_equidistant_spacing() {
        let iats = SpecificationGenerator::new(1).generate_iats_for_slot(
            4,
            IatDistribution::Equidistant,
            TraceGranularity::Second,
        );
        // One second minus the 1ms slack, split evenly
        assert_eq!(iats, vec![249_750.0; 4]);
    }

    #[test]
    fn test_slot_never_overflows() {
        let mut generator = SpecificationGenerator::new(3);
        for distribution in [IatDistribution::Exponential, IatDistribution::Uniform] {
            for _ in 0..20 {
                let iats =
                    generator.generate_iats_for_slot(50, distribution, TraceGranularity::Minute);
                let total: f64 = iats.iter().sum();
                // Allow for the 1us floor applied after normalization
                assert!(total <= 59_999_000.0 + 50.0, "total was {}", total);
                assert!(iats.iter().all(|iat| *iat >= MIN_IAT_MICROS));
            }
        }
    }

    #[test]
    fn test_empty_slot() {
        let iats = SpecificationGenerator::new(3).generate_iats_for_slot(
            0,
            IatDistribution::Uniform,
            TraceGranularity::Minute,
        );
        assert!(iats.is_empty());
    }

    #[test]
    fn test_distribution_parse() {
        assert_eq!(
            "Exponential".parse::<IatDistribution>().unwrap(),
            IatDistribution::Exponential
        );
        assert!("gaussian".parse::<IatDistribution>().is_err());
    }
}
