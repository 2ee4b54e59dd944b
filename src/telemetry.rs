//! Background telemetry: periodic platform scraping and the experiment
//! timekeeper.
//!
//! Both tasks join a shared [`Barrier`] once they are running so scheduling
//! only starts after telemetry is in place.

use async_trait::async_trait;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{oneshot, Barrier};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::LoaderConfig;
use crate::errors::LoaderError;
use crate::function::TraceGranularity;
use crate::metrics::{ASYNC_QUEUE_DEPTH, EXPERIMENT_MINUTE, IN_FLIGHT_INVOCATIONS};
use crate::utils::unix_micros_now;

/// Resource usage of the cluster (or node) at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterUsage {
    pub timestamp: i64,
    pub load_average_1m: f64,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
}

/// Number of running instances of one function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentScale {
    pub timestamp: i64,
    pub function: String,
    pub scale: u64,
}

/// Platform-side counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformStats {
    pub timestamp: i64,
    pub in_flight_invocations: i64,
    pub async_queue_depth: i64,
}

/// Source of platform samples. A missing sample is skipped, never fatal.
#[async_trait]
pub trait MetricsScraper: Send + Sync {
    async fn cluster_usage(&self) -> Option<ClusterUsage>;
    async fn deployment_scales(&self) -> Vec<DeploymentScale>;
    async fn platform_stats(&self) -> Option<PlatformStats>;
}

/// Samples the node the loader itself runs on.
///
/// Reports no deployment scales: those need a platform API.
#[derive(Debug, Default)]
pub struct LocalNodeScraper;

#[async_trait]
impl MetricsScraper for LocalNodeScraper {
    async fn cluster_usage(&self) -> Option<ClusterUsage> {
        read_node_usage()
    }

    async fn deployment_scales(&self) -> Vec<DeploymentScale> {
        Vec::new()
    }

    async fn platform_stats(&self) -> Option<PlatformStats> {
        Some(PlatformStats {
            timestamp: unix_micros_now(),
            in_flight_invocations: IN_FLIGHT_INVOCATIONS.get() as i64,
            async_queue_depth: ASYNC_QUEUE_DEPTH.get(),
        })
    }
}

#[cfg(target_os = "linux")]
fn read_node_usage() -> Option<ClusterUsage> {
    use procfs::{Current, LoadAverage, Meminfo};

    let load = match LoadAverage::current() {
        Ok(load) => load,
        Err(e) => {
            debug!(error = %e, "Failed to read /proc/loadavg");
            return None;
        }
    };
    let meminfo = match Meminfo::current() {
        Ok(meminfo) => meminfo,
        Err(e) => {
            debug!(error = %e, "Failed to read /proc/meminfo");
            return None;
        }
    };

    let available = meminfo.mem_available.unwrap_or(meminfo.mem_free);
    Some(ClusterUsage {
        timestamp: unix_micros_now(),
        load_average_1m: load.one as f64,
        memory_used_mib: meminfo.mem_total.saturating_sub(available) / 1024 / 1024,
        memory_total_mib: meminfo.mem_total / 1024 / 1024,
    })
}

#[cfg(not(target_os = "linux"))]
fn read_node_usage() -> Option<ClusterUsage> {
    None
}

/// Files the scraper writes into.
#[derive(Debug, Clone)]
pub struct ScraperOutputs {
    /// JSON lines
    pub cluster_usage: String,
    /// CSV
    pub deployment_scale: String,
    /// CSV
    pub platform_stats: String,
}

impl ScraperOutputs {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            cluster_usage: config.output_filename("cluster_usage"),
            deployment_scale: config.output_filename("deployment_scale"),
            platform_stats: config.output_filename("platform_stats"),
        }
    }
}

struct ScraperWriters {
    cluster_usage: BufWriter<File>,
    deployment_scale: csv::Writer<File>,
    platform_stats: csv::Writer<File>,
}

impl ScraperWriters {
    fn open(outputs: &ScraperOutputs) -> Result<Self, LoaderError> {
        Ok(Self {
            cluster_usage: BufWriter::new(create_file(&outputs.cluster_usage)?),
            deployment_scale: csv::Writer::from_writer(create_file(&outputs.deployment_scale)?),
            platform_stats: csv::Writer::from_writer(create_file(&outputs.platform_stats)?),
        })
    }

    async fn sample(&mut self, scraper: &dyn MetricsScraper) -> Result<(), LoaderError> {
        if let Some(usage) = scraper.cluster_usage().await {
            serde_json::to_writer(&mut self.cluster_usage, &usage)?;
            self.cluster_usage.write_all(b"\n")?;
        }
        for scale in scraper.deployment_scales().await {
            self.deployment_scale.serialize(&scale)?;
        }
        if let Some(stats) = scraper.platform_stats().await {
            self.platform_stats.serialize(&stats)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LoaderError> {
        self.cluster_usage.flush()?;
        self.deployment_scale.flush()?;
        self.platform_stats.flush()?;
        Ok(())
    }
}

fn create_file(path: &str) -> Result<File, LoaderError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(File::create(path)?)
}

/// Handle to a running scraper.
pub struct ScraperHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<u64, LoaderError>>,
}

impl ScraperHandle {
    /// Signals the scraper to flush and stop, and waits for it.
    /// Returns the number of sampling rounds taken.
    pub async fn finish(self) -> Result<u64, LoaderError> {
        // The task may already have stopped on an I/O error
        let _ = self.stop.send(());
        self.task.await?
    }
}

/// Starts the periodic scraper. It samples every `period` until
/// [`ScraperHandle::finish`] is called.
pub fn spawn_metrics_scraper(
    scraper: Arc<dyn MetricsScraper>,
    period: Duration,
    outputs: ScraperOutputs,
    ready: Arc<Barrier>,
) -> ScraperHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let writers = ScraperWriters::open(&outputs);
        // Always join the barrier, even when the outputs could not be opened
        ready.wait().await;
        let mut writers = writers?;

        info!(period_secs = period.as_secs_f64(), "Metrics scraper started");
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rounds = 0u64;

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = interval.tick() => {
                    if let Err(e) = writers.sample(scraper.as_ref()).await {
                        error!(error = %e, "Failed to write telemetry sample");
                    }
                    rounds += 1;
                }
            }
        }

        writers.flush()?;
        info!(rounds = rounds, "Metrics scraper stopped");
        Ok(rounds)
    });

    ScraperHandle {
        stop: stop_tx,
        task,
    }
}

/// Starts the global timekeeper: ticks once per granularity unit, keeps
/// the experiment-minute gauge current and exits after `trace_duration`
/// ticks.
pub fn spawn_global_timekeeper(
    granularity: TraceGranularity,
    trace_duration: usize,
    ready: Arc<Barrier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(granularity.unit());
        // First tick completes immediately
        ticker.tick().await;
        EXPERIMENT_MINUTE.set(0);
        ready.wait().await;

        let mut counter = 0usize;
        loop {
            ticker.tick().await;

            debug!(minute = counter, "End of minute");
            counter += 1;
            EXPERIMENT_MINUTE.set(counter as i64);
            if counter >= trace_duration {
                break;
            }
            debug!(minute = counter, "Start of minute");
        }

        if counter > 0 {
            debug!(minutes = counter, "Timekeeper finished");
        } else {
            warn!("Timekeeper finished without ticking");
        }
    })
}
