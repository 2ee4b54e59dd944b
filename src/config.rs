use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::time::Duration;

use crate::errors::LoaderError;
use crate::function::TraceGranularity;
use crate::generator::IatDistribution;
use crate::scheduler::DivergenceCheck;
use crate::utils::parse_duration_string;

/// Serverless platforms the HTTP transport can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Dirigent,
    DirigentDandelion,
}

impl FromStr for Platform {
    type Err = LoaderError;

    /// Accepts the `-RPS` variants used by RPS-mode experiment configs;
    /// pacing is identical for the scheduler.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        match name.strip_suffix("-RPS").unwrap_or(name) {
            "Dirigent" => Ok(Platform::Dirigent),
            "Dirigent-Dandelion" => Ok(Platform::DirigentDandelion),
            _ => Err(LoaderError::UnsupportedPlatform(name.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Dirigent => write!(f, "Dirigent"),
            Platform::DirigentDandelion => write!(f, "Dirigent-Dandelion"),
        }
    }
}

/// Experiment parameters.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub platform: Platform,
    /// JSON file describing the functions to invoke
    pub functions_file: Option<String>,
    /// Directory holding pre-generated `iat<i>.json` specifications
    pub specification_dir: Option<String>,
    /// Trace duration in granularity units (minutes for minute traces)
    pub trace_duration: usize,
    pub granularity: TraceGranularity,
    /// Warmup minutes, 0 disables the warmup phase
    pub warmup_duration: usize,
    pub dag_mode: bool,
    pub async_mode: bool,
    pub async_response_url: Option<String>,
    /// Grace period before async results are fetched
    pub async_wait_to_collect: Duration,
    pub async_batch_size: usize,
    pub async_fetch_timeout: Duration,
    /// Transport timeout for a single invocation
    pub function_timeout: Duration,
    pub enable_metrics_scraping: bool,
    pub metrics_scraping_period: Duration,
    pub output_path_prefix: String,
    pub metrics_port: Option<u16>,
    pub seed: u64,
    pub iat_distribution: IatDistribution,
    pub divergence_check: DivergenceCheck,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Dirigent,
            functions_file: None,
            specification_dir: None,
            trace_duration: 10,
            granularity: TraceGranularity::Minute,
            warmup_duration: 0,
            dag_mode: false,
            async_mode: false,
            async_response_url: None,
            async_wait_to_collect: Duration::from_secs(60),
            async_batch_size: 50,
            async_fetch_timeout: Duration::from_secs(2),
            function_timeout: Duration::from_secs(900),
            enable_metrics_scraping: false,
            metrics_scraping_period: Duration::from_secs(15),
            output_path_prefix: "data/out/experiment".to_string(),
            metrics_port: None,
            seed: 42,
            iat_distribution: IatDistribution::Exponential,
            divergence_check: DivergenceCheck::default(),
        }
    }
}

impl LoaderConfig {
    pub fn with_warmup(&self) -> bool {
        self.warmup_duration > 0
    }

    /// `<prefix>_<name>_<traceDuration>.csv`
    pub fn output_filename(&self, name: &str) -> String {
        format!(
            "{}_{}_{}.csv",
            self.output_path_prefix, name, self.trace_duration
        )
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, LoaderError> {
        let defaults = LoaderConfig::default();

        let config = LoaderConfig {
            platform: env_or("PLATFORM", defaults.platform)?,
            functions_file: env::var("FUNCTIONS_FILE").ok(),
            specification_dir: env::var("SPECIFICATION_DIR").ok(),
            trace_duration: env_or("TRACE_DURATION", defaults.trace_duration)?,
            granularity: env_or("TRACE_GRANULARITY", defaults.granularity)?,
            warmup_duration: env_or("WARMUP_DURATION", defaults.warmup_duration)?,
            dag_mode: env_bool("DAG_MODE", defaults.dag_mode),
            async_mode: env_bool("ASYNC_MODE", defaults.async_mode),
            async_response_url: env::var("ASYNC_RESPONSE_URL").ok(),
            async_wait_to_collect: env_duration(
                "ASYNC_WAIT_TO_COLLECT",
                defaults.async_wait_to_collect,
            )?,
            async_batch_size: env_or("ASYNC_BATCH_SIZE", defaults.async_batch_size)?,
            async_fetch_timeout: env_duration("ASYNC_FETCH_TIMEOUT", defaults.async_fetch_timeout)?,
            function_timeout: env_duration("FUNCTION_TIMEOUT", defaults.function_timeout)?,
            enable_metrics_scraping: env_bool(
                "ENABLE_METRICS_SCRAPING",
                defaults.enable_metrics_scraping,
            ),
            metrics_scraping_period: env_duration(
                "METRICS_SCRAPING_PERIOD",
                defaults.metrics_scraping_period,
            )?,
            output_path_prefix: env::var("OUTPUT_PATH_PREFIX")
                .unwrap_or(defaults.output_path_prefix),
            metrics_port: env::var("METRICS_PORT")
                .ok()
                .map(|p| parse_env("METRICS_PORT", &p))
                .transpose()?,
            seed: env_or("SEED", defaults.seed)?,
            iat_distribution: env_or("IAT_DISTRIBUTION", defaults.iat_distribution)?,
            divergence_check: DivergenceCheck {
                enabled: env_bool("DIVERGENCE_CHECK", false),
                ..DivergenceCheck::default()
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, LoaderError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, LoaderError> {
        let file: YamlLoaderConfig = serde_yaml::from_str(content)?;
        let defaults = LoaderConfig::default();

        let config = LoaderConfig {
            platform: file.platform.parse()?,
            functions_file: file.functions_file,
            specification_dir: file.specification_dir,
            trace_duration: file.trace_duration,
            granularity: file.granularity,
            warmup_duration: file.warmup_duration,
            dag_mode: file.dag_mode,
            async_mode: file.async_mode,
            async_response_url: file.async_response_url,
            async_wait_to_collect: duration_or(
                file.async_wait_to_collect,
                defaults.async_wait_to_collect,
            )?,
            async_batch_size: file.async_batch_size.unwrap_or(defaults.async_batch_size),
            async_fetch_timeout: duration_or(
                file.async_fetch_timeout,
                defaults.async_fetch_timeout,
            )?,
            function_timeout: duration_or(file.function_timeout, defaults.function_timeout)?,
            enable_metrics_scraping: file.enable_metrics_scraping,
            metrics_scraping_period: duration_or(
                file.metrics_scraping_period,
                defaults.metrics_scraping_period,
            )?,
            output_path_prefix: file
                .output_path_prefix
                .unwrap_or(defaults.output_path_prefix),
            metrics_port: file.metrics_port,
            seed: file.seed.unwrap_or(defaults.seed),
            iat_distribution: match file.iat_distribution {
                Some(d) => d.parse()?,
                None => defaults.iat_distribution,
            },
            divergence_check: DivergenceCheck {
                enabled: file.divergence_check,
                ..DivergenceCheck::default()
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the scheduler cannot run.
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.trace_duration == 0 {
            return Err(LoaderError::Config(
                "trace duration must be at least 1".to_string(),
            ));
        }
        if self.warmup_duration >= self.trace_duration {
            return Err(LoaderError::Config(format!(
                "warmup duration ({}) must be shorter than the trace duration ({})",
                self.warmup_duration, self.trace_duration
            )));
        }
        if self.async_mode
            && self
                .async_response_url
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(LoaderError::Config(
                "async mode requires an async response URL".to_string(),
            ));
        }
        if self.async_batch_size == 0 {
            return Err(LoaderError::Config(
                "async batch size must be greater than 0".to_string(),
            ));
        }
        if self.metrics_scraping_period.is_zero() {
            return Err(LoaderError::Config(
                "metrics scraping period must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Prints the configuration summary.
    pub fn print_summary(&self) {
        println!("Starting trace-driven experiment:");
        println!("  Platform: {}", self.platform);
        println!(
            "  Trace duration: {} x {:?}",
            self.trace_duration, self.granularity
        );
        if self.with_warmup() {
            println!("  Warmup: {} minute(s)", self.warmup_duration);
        } else {
            println!("  Warmup: disabled");
        }
        println!("  DAG mode: {}", self.dag_mode);
        if self.async_mode {
            println!(
                "  Async mode: yes (collect after {:?}, batches of {})",
                self.async_wait_to_collect, self.async_batch_size
            );
        } else {
            println!("  Async mode: no");
        }
        println!("  Function timeout: {:?}", self.function_timeout);
        if self.enable_metrics_scraping {
            println!(
                "  Metrics scraping: every {:?}",
                self.metrics_scraping_period
            );
        }
        println!("  Output prefix: {}", self.output_path_prefix);
    }
}

/// Duration format for YAML (e.g., 30 or "30s").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlDuration {
    Seconds(u64),
    String(String),
}

impl YamlDuration {
    pub fn to_std_duration(&self) -> Result<Duration, LoaderError> {
        match self {
            YamlDuration::Seconds(s) => Ok(Duration::from_secs(*s)),
            YamlDuration::String(s) => parse_duration_string(s)
                .map_err(|e| LoaderError::Config(format!("Invalid duration '{}': {}", s, e))),
        }
    }
}

/// On-disk layout of a YAML experiment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YamlLoaderConfig {
    #[serde(default = "default_platform")]
    platform: String,
    functions_file: Option<String>,
    specification_dir: Option<String>,
    trace_duration: usize,
    #[serde(default = "default_granularity")]
    granularity: TraceGranularity,
    #[serde(default)]
    warmup_duration: usize,
    #[serde(default)]
    dag_mode: bool,
    #[serde(default)]
    async_mode: bool,
    async_response_url: Option<String>,
    async_wait_to_collect: Option<YamlDuration>,
    async_batch_size: Option<usize>,
    async_fetch_timeout: Option<YamlDuration>,
    function_timeout: Option<YamlDuration>,
    #[serde(default)]
    enable_metrics_scraping: bool,
    metrics_scraping_period: Option<YamlDuration>,
    output_path_prefix: Option<String>,
    metrics_port: Option<u16>,
    seed: Option<u64>,
    iat_distribution: Option<String>,
    #[serde(default)]
    divergence_check: bool,
}

fn default_platform() -> String {
    "Dirigent".to_string()
}

fn default_granularity() -> TraceGranularity {
    TraceGranularity::Minute
}

fn duration_or(value: Option<YamlDuration>, default: Duration) -> Result<Duration, LoaderError> {
    value.map_or(Ok(default), |d| d.to_std_duration())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, LoaderError>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| LoaderError::Config(format!("Invalid {} '{}': {}", key, value, e)))
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, LoaderError>
where
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(value) => parse_env(key, &value),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Result<Duration, LoaderError> {
    match env::var(key) {
        Ok(value) => parse_duration_string(&value)
            .map_err(|e| LoaderError::Config(format!("Invalid {} '{}': {}", key, value, e))),
        Err(_) => Ok(default),
    }
}
