//! Functions under test and their trace-derived specifications.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Duration;

use crate::errors::LoaderError;

/// Resources requested by one scheduled invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeSpecification {
    /// Requested execution time in milliseconds
    pub runtime: u32,
    /// Requested memory in MiB
    pub memory: u32,
}

/// Per-function trace data, frozen before scheduling starts.
///
/// `iat` holds inter-arrival times in microseconds, partitioned into
/// contiguous per-minute runs whose lengths are `per_minute_count[i]`.
/// `runtime_specification` runs parallel to `iat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionSpecification {
    #[serde(rename = "IAT")]
    pub iat: Vec<f64>,
    pub per_minute_count: Vec<usize>,
    #[serde(default)]
    pub runtime_specification: Vec<RuntimeSpecification>,
}

impl FunctionSpecification {
    /// Total number of invocations the trace asks for.
    pub fn total_invocations(&self) -> usize {
        self.per_minute_count.iter().sum()
    }

    /// Whether `sum(per_minute_count) == len(iat)`.
    pub fn is_consistent(&self) -> bool {
        self.total_invocations() == self.iat.len()
    }

    /// Index into `iat` of the first invocation of `minute`.
    pub fn minute_offset(&self, minute: usize) -> usize {
        self.per_minute_count.iter().take(minute).sum()
    }

    /// Inter-arrival time at `index`, truncated to whole microseconds.
    pub fn iat_micros(&self, index: usize) -> Option<u64> {
        self.iat.get(index).map(|iat| iat.max(0.0) as u64)
    }

    /// Load a specification previously written as JSON.
    ///
    /// A file that does not parse is fatal.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, LoaderError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| LoaderError::MalformedSpecification {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Platform-specific metadata sent along with each invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadMetadata {
    #[serde(default)]
    pub image: String,
    #[serde(default = "default_multiplier")]
    pub iteration_multiplier: u32,
}

fn default_multiplier() -> u32 {
    1
}

/// A target of invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Function {
    pub name: String,
    pub endpoint: String,
    pub workload: WorkloadMetadata,
    pub specification: FunctionSpecification,
}

impl Function {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_specification(mut self, specification: FunctionSpecification) -> Self {
        self.specification = specification;
        self
    }

    /// Runtime specification for the invocation at `iat_index`.
    ///
    /// A specification shorter than the trace yields the default (zero)
    /// request instead of panicking.
    pub fn runtime_spec(&self, iat_index: usize) -> RuntimeSpecification {
        self.specification
            .runtime_specification
            .get(iat_index)
            .copied()
            .unwrap_or_default()
    }
}

/// An ordered train of dependent functions fired as one logical invocation.
///
/// The first element's specification drives the timing of the chain.
#[derive(Debug, Clone)]
pub struct DagChain {
    functions: Vec<Arc<Function>>,
}

impl DagChain {
    /// Returns `None` for an empty list.
    pub fn new(functions: Vec<Arc<Function>>) -> Option<Self> {
        if functions.is_empty() {
            None
        } else {
            Some(Self { functions })
        }
    }

    pub fn single(function: Arc<Function>) -> Self {
        Self {
            functions: vec![function],
        }
    }

    /// The function whose trace paces the chain.
    pub fn root(&self) -> &Arc<Function> {
        &self.functions[0]
    }

    pub fn functions(&self) -> &[Arc<Function>] {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Build the scheduling units for an experiment: one chain of every
/// function in DAG mode, otherwise one single-element chain per function.
pub fn build_chains(functions: &[Arc<Function>], dag_mode: bool) -> Vec<DagChain> {
    if dag_mode {
        DagChain::new(functions.to_vec()).into_iter().collect()
    } else {
        functions.iter().cloned().map(DagChain::single).collect()
    }
}

/// Whether an invocation counts towards measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentPhase {
    Warmup = 1,
    Execution = 2,
}

impl ExperimentPhase {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

impl fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExperimentPhase::Warmup => write!(f, "warmup"),
            ExperimentPhase::Execution => write!(f, "execution"),
        }
    }
}

/// The coarse time unit a trace is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceGranularity {
    Minute,
    Second,
}

impl TraceGranularity {
    /// Wall-clock length of one trace slot.
    pub fn unit(&self) -> Duration {
        match self {
            TraceGranularity::Minute => Duration::from_secs(60),
            TraceGranularity::Second => Duration::from_secs(1),
        }
    }

    pub fn unit_micros(&self) -> u64 {
        self.unit().as_micros() as u64
    }

    /// Prefix used in invocation identifiers.
    pub fn prefix(&self) -> &'static str {
        match self {
            TraceGranularity::Minute => "min",
            TraceGranularity::Second => "sec",
        }
    }
}

impl FromStr for TraceGranularity {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "minute" | "min" => Ok(TraceGranularity::Minute),
            "second" | "sec" => Ok(TraceGranularity::Second),
            other => Err(LoaderError::UnsupportedGranularity(other.to_string())),
        }
    }
}

/// Compose `<granularity><minuteIndex>.inv<invocationIndex>`, e.g. `min3.inv12`.
pub fn compose_invocation_id(
    granularity: TraceGranularity,
    minute_index: usize,
    invocation_index: usize,
) -> String {
    format!(
        "{}{}.inv{}",
        granularity.prefix(),
        minute_index,
        invocation_index
    )
}
