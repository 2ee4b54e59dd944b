//! Experiment orchestration.
//!
//! Wires the schedulers, the async collector, the completion coordinator
//! and the background telemetry together and runs one experiment to
//! completion.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Barrier;
use tracing::{error, info, warn};

use crate::async_queue::{AsyncQueue, AsyncResultCollector};
use crate::collector::{GlobalMetricsCollector, RecordSink};
use crate::config::LoaderConfig;
use crate::dispatcher::InvocationDispatcher;
use crate::errors::LoaderError;
use crate::function::{build_chains, Function, FunctionSpecification, WorkloadMetadata};
use crate::generator::{ExecutionProfile, MemoryStats, RuntimeStats, SpecificationGenerator};
use crate::percentiles::{format_percentile_table, PercentileStats};
use crate::scheduler::{FunctionScheduler, SchedulerReport, SchedulerSettings};
use crate::telemetry::{
    spawn_global_timekeeper, spawn_metrics_scraper, MetricsScraper, ScraperOutputs,
};
use crate::transport::{Invoker, ResultFetcher};

/// One entry of the functions file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub workload: WorkloadMetadata,
    /// Invocations per trace slot; ignored when specifications are read
    /// from a directory
    #[serde(default)]
    pub per_minute_count: Vec<usize>,
    #[serde(default)]
    pub runtime_ms: u32,
    #[serde(default)]
    pub memory_mib: u32,
    /// Per-invocation runtime sampling; `runtimeMs` is used when absent
    #[serde(default)]
    pub runtime_stats: Option<RuntimeStats>,
    #[serde(default)]
    pub memory_stats: Option<MemoryStats>,
}

impl FunctionDefinition {
    fn execution_profile(&self) -> ExecutionProfile {
        ExecutionProfile {
            runtime: self.runtime_ms,
            memory: self.memory_mib,
            runtime_stats: self.runtime_stats,
            memory_stats: self.memory_stats,
        }
    }
}

/// Reads the JSON array of function definitions at `path`.
pub fn load_function_definitions<P: AsRef<Path>>(
    path: P,
) -> Result<Vec<FunctionDefinition>, LoaderError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Builds the experiment's functions with their frozen specifications.
///
/// With a specification directory configured, function `i` reads
/// `<dir>/iat<i>.json`; otherwise the specification is generated from the
/// definition's per-minute counts with a generator seeded from the config.
pub fn prepare_functions(
    definitions: Vec<FunctionDefinition>,
    config: &LoaderConfig,
) -> Result<Vec<Arc<Function>>, LoaderError> {
    let mut generator = SpecificationGenerator::new(config.seed);
    let mut functions = Vec::with_capacity(definitions.len());

    for (i, definition) in definitions.into_iter().enumerate() {
        let specification = match &config.specification_dir {
            Some(dir) => {
                FunctionSpecification::from_json_file(Path::new(dir).join(format!("iat{}.json", i)))?
            }
            None => generator.generate_invocation_data(
                &definition.per_minute_count,
                config.iat_distribution,
                config.granularity,
                &definition.execution_profile(),
            ),
        };

        if specification.per_minute_count.len() < config.trace_duration {
            warn!(
                function = %definition.name,
                trace_minutes = specification.per_minute_count.len(),
                trace_duration = config.trace_duration,
                "Trace is shorter than the configured duration"
            );
        }

        let mut function = Function::new(definition.name, definition.endpoint)
            .with_specification(specification);
        function.workload = definition.workload;
        functions.push(Arc::new(function));
    }

    Ok(functions)
}

/// Outcome of a finished experiment.
#[derive(Debug, Clone)]
pub struct ExperimentSummary {
    /// Successful chain elements
    pub successful: u64,
    /// Failed ticks
    pub failed: u64,
    /// Dispatched ticks
    pub issued: u64,
    pub records_written: u64,
    /// `failed / issued`
    pub failure_rate: f64,
    pub schedulers: Vec<SchedulerReport>,
    pub latency: HashMap<String, PercentileStats>,
}

impl ExperimentSummary {
    pub fn print(&self) {
        println!("\n--- EXPERIMENT SUMMARY ---");
        println!("  Issued invocations:     {}", self.issued);
        println!("  Successful invocations: {}", self.successful);
        println!("  Failed invocations:     {}", self.failed);
        println!("  Failure rate:           {:.2}%", self.failure_rate * 100.0);
        println!("  Records written:        {}", self.records_written);
        println!(
            "{}",
            format_percentile_table("Response time by function", &self.latency)
        );
    }
}

/// Runs one experiment.
pub struct Driver<S: RecordSink> {
    config: LoaderConfig,
    functions: Vec<Arc<Function>>,
    invoker: Arc<dyn Invoker>,
    fetcher: Option<Arc<dyn ResultFetcher>>,
    scraper: Option<Arc<dyn MetricsScraper>>,
    sink: S,
}

impl<S: RecordSink + 'static> Driver<S> {
    pub fn new(
        config: LoaderConfig,
        functions: Vec<Arc<Function>>,
        invoker: Arc<dyn Invoker>,
        sink: S,
    ) -> Self {
        Self {
            config,
            functions,
            invoker,
            fetcher: None,
            scraper: None,
            sink,
        }
    }

    /// Fetcher for async results; required in async mode.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ResultFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Scraper used when metrics scraping is enabled.
    pub fn with_scraper(mut self, scraper: Arc<dyn MetricsScraper>) -> Self {
        self.scraper = Some(scraper);
        self
    }

    /// Runs every scheduler to completion and waits until all records are
    /// written. Returns the summary together with the sink.
    pub async fn run(self) -> Result<(ExperimentSummary, S), LoaderError> {
        let Driver {
            config,
            functions,
            invoker,
            fetcher,
            scraper,
            sink,
        } = self;

        let async_collector = match (config.async_mode, fetcher) {
            (false, _) => None,
            (true, Some(fetcher)) => Some(AsyncResultCollector::new(
                fetcher,
                config.async_batch_size,
                config.async_fetch_timeout,
            )),
            (true, None) => {
                return Err(LoaderError::Config(
                    "async mode requires a result fetcher".to_string(),
                ))
            }
        };
        let scraper = scraper.filter(|_| config.enable_metrics_scraping);

        // Background tasks plus this one
        let ready = Arc::new(Barrier::new(2 + usize::from(scraper.is_some())));
        let timekeeper =
            spawn_global_timekeeper(config.granularity, config.trace_duration, ready.clone());
        let scraper_handle = scraper.map(|scraper| {
            spawn_metrics_scraper(
                scraper,
                config.metrics_scraping_period,
                ScraperOutputs::from_config(&config),
                ready.clone(),
            )
        });
        let mut collector = GlobalMetricsCollector::spawn(sink);
        ready.wait().await;

        let chains = build_chains(&functions, config.dag_mode);
        info!(
            functions = functions.len(),
            schedulers = chains.len(),
            dag_mode = config.dag_mode,
            async_mode = config.async_mode,
            "Starting function invocation"
        );

        let async_queue = Arc::new(AsyncQueue::new());
        let dispatcher = InvocationDispatcher::new(
            invoker,
            config.async_mode,
            config.granularity,
            collector.sender(),
            async_queue.clone(),
        );
        let settings = SchedulerSettings {
            trace_duration: config.trace_duration,
            warmup_duration: config.warmup_duration,
            granularity: config.granularity,
            divergence_check: config.divergence_check.clone(),
        };

        let handles: Vec<_> = chains
            .into_iter()
            .map(|chain| {
                let scheduler =
                    FunctionScheduler::new(chain, dispatcher.clone(), settings.clone());
                tokio::spawn(scheduler.run())
            })
            .collect();
        drop(dispatcher);

        let mut schedulers = Vec::with_capacity(handles.len());
        for handle in handles {
            schedulers.push(handle.await?);
        }
        info!("Finished function invocation");

        if let Some(async_collector) = async_collector {
            async_collector
                .collect(config.async_wait_to_collect, &async_queue, &collector.sender())
                .await;
        }

        let expected: u64 = schedulers.iter().map(|s| s.records_emitted).sum();
        collector.deliver_total(expected);
        let (collected, sink) = collector.finish().await?;

        if let Some(handle) = scraper_handle {
            if let Err(e) = handle.finish().await {
                error!(error = %e, "Metrics scraper failed");
            }
        }
        if !timekeeper.is_finished() {
            timekeeper.abort();
        }

        if collected.written < expected {
            return Err(LoaderError::CollectorIncomplete {
                written: collected.written,
                expected,
            });
        }

        let successful = schedulers.iter().map(|s| s.successful).sum();
        let failed: u64 = schedulers.iter().map(|s| s.failed).sum();
        let issued: u64 = schedulers.iter().map(|s| s.issued).sum();
        let failure_rate = if issued == 0 {
            0.0
        } else {
            failed as f64 / issued as f64
        };

        info!(
            issued = issued,
            successful = successful,
            failed = failed,
            failure_rate = format!("{:.2}%", failure_rate * 100.0),
            records_written = collected.written,
            "Trace has finished executing"
        );

        let summary = ExperimentSummary {
            successful,
            failed,
            issued,
            records_written: collected.written,
            failure_rate,
            schedulers,
            latency: collected.latency,
        };
        Ok((summary, sink))
    }
}
