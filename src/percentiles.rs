//! Invocation latency summaries using HDR Histogram.
//!
//! The completion coordinator feeds every sunk record's response time into a
//! per-function histogram so the experiment summary can report P50..P99.9
//! without keeping the records in memory.

use hdrhistogram::Histogram;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Longest response time a histogram holds: the platform's 15 minute cap.
const MAX_TRACKED_MICROS: u64 = 900_000_000;

const DEFAULT_MAX_FUNCTIONS: usize = 1000;

/// Percentile statistics for a set of latency measurements.
#[derive(Debug, Clone)]
pub struct PercentileStats {
    pub count: u64,

    /// Minimum value (microseconds)
    pub min: u64,

    /// Maximum value (microseconds)
    pub max: u64,

    /// Mean value (microseconds)
    pub mean: f64,

    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p99_9: u64,
}

impl PercentileStats {
    /// Format statistics as a compact table row.
    pub fn format_table_row(&self, label: &str) -> String {
        format!(
            "{:<30} {:>8} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>10.2}",
            label,
            self.count,
            self.p50 as f64 / 1000.0,
            self.p95 as f64 / 1000.0,
            self.p99 as f64 / 1000.0,
            self.mean / 1000.0,
            self.max as f64 / 1000.0,
        )
    }
}

/// Latency histogram for one function. Not synchronized; owned by the
/// coordinator task or wrapped by [`FunctionLatencyTracker`].
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        // Tracks 1us to 15min with 3 significant digits
        let histogram = Histogram::new_with_bounds(1, MAX_TRACKED_MICROS, 3)
            .expect("Failed to create histogram");
        Self { histogram }
    }

    /// Record a response time in microseconds. Values are clamped into the
    /// tracked range; negative times (clock steps) count as 1us.
    pub fn record_us(&mut self, latency_us: i64) {
        let clamped = (latency_us.max(1) as u64).min(MAX_TRACKED_MICROS);
        if let Err(e) = self.histogram.record(clamped) {
            warn!(
                latency_us = latency_us,
                error = %e,
                "Failed to record latency in histogram"
            );
        }
    }

    pub fn stats(&self) -> Option<PercentileStats> {
        let hist = &self.histogram;
        if hist.is_empty() {
            return None;
        }

        Some(PercentileStats {
            count: hist.len(),
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p90: hist.value_at_quantile(0.90),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            p99_9: hist.value_at_quantile(0.999),
        })
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-function latency tracker with LRU eviction.
///
/// Experiments with very large function sets would otherwise hold one
/// histogram per function; past `max_functions` the least recently recorded
/// function is dropped from the summary.
pub struct FunctionLatencyTracker {
    histograms: Mutex<LruCache<String, LatencyHistogram>>,
    max_functions: usize,
}

impl FunctionLatencyTracker {
    pub fn new_with_limit(max_functions: usize) -> Self {
        let capacity = NonZeroUsize::new(max_functions).unwrap_or(NonZeroUsize::MIN);
        Self {
            histograms: Mutex::new(LruCache::new(capacity)),
            max_functions: capacity.get(),
        }
    }

    pub fn new() -> Self {
        Self::new_with_limit(DEFAULT_MAX_FUNCTIONS)
    }

    /// Record one response time for `function`.
    pub fn record(&self, function: &str, latency_us: i64) {
        let mut histograms = match self.histograms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !histograms.contains(function) {
            if histograms.len() >= self.max_functions {
                debug!(
                    function = function,
                    max_functions = self.max_functions,
                    "Latency tracker full, evicting least recently used function"
                );
            }
            histograms.put(function.to_string(), LatencyHistogram::new());
        }

        if let Some(histogram) = histograms.get_mut(function) {
            histogram.record_us(latency_us);
        }
    }

    pub fn stats(&self, function: &str) -> Option<PercentileStats> {
        let histograms = match self.histograms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // peek() doesn't update LRU order
        histograms.peek(function).and_then(|h| h.stats())
    }

    /// Statistics for every tracked function.
    pub fn all_stats(&self) -> HashMap<String, PercentileStats> {
        let histograms = match self.histograms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        histograms
            .iter()
            .filter_map(|(name, h)| h.stats().map(|s| (name.clone(), s)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.histograms.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FunctionLatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Format per-function statistics as a table, sorted by function name.
pub fn format_percentile_table(
    title: &str,
    stats_map: &HashMap<String, PercentileStats>,
) -> String {
    if stats_map.is_empty() {
        return format!("## {}\n\nNo data available.\n", title);
    }

    let mut output = String::new();
    output.push_str(&format!("\n## {}\n\n", title));
    output.push_str(&format!(
        "{:<30} {:>8} {:>10} {:>10} {:>10} {:>10} {:>10}\n",
        "Function", "Count", "P50 (ms)", "P95 (ms)", "P99 (ms)", "Mean (ms)", "Max (ms)"
    ));
    output.push_str(&"-".repeat(94));
    output.push('\n');

    let mut labels: Vec<_> = stats_map.keys().collect();
    labels.sort();

    for label in labels {
        output.push_str(&stats_map[label].format_table_row(label));
        output.push('\n');
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_basic() {
        let mut histogram = LatencyHistogram::new();
        for i in 1..=5 {
            histogram.record_us(i * 10_000);
        }

        let stats = histogram.stats().expect("Should have stats");
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, 10_000);

        // HDR histogram buckets values; allow for rounding
        let expected_max = 50_000;
        assert!(
            stats.max >= expected_max && stats.max <= expected_max + 100,
            "max should be ~{} but was {}",
            expected_max,
            stats.max
        );
    }

    #[test]
    fn test_histogram_empty() {
        assert!(LatencyHistogram::new().stats().is_none());
    }

    #[test]
    fn test_histogram_clamps_out_of_range() {
        let mut histogram = LatencyHistogram::new();
        histogram.record_us(-5);
        histogram.record_us(i64::MAX);

        let stats = histogram.stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min, 1);
    }

    #[test]
    fn test_function_tracker() {
        let tracker = FunctionLatencyTracker::new();
        tracker.record("f1", 10_000);
        tracker.record("f1", 20_000);
        tracker.record("f2", 30_000);

        assert_eq!(tracker.stats("f1").unwrap().count, 2);
        assert_eq!(tracker.stats("f2").unwrap().count, 1);
        assert!(tracker.stats("missing").is_none());
        assert_eq!(tracker.all_stats().len(), 2);
    }

    #[test]
    fn test_function_tracker_evicts_lru() {
        let tracker = FunctionLatencyTracker::new_with_limit(2);
        tracker.record("a", 1000);
        tracker.record("b", 1000);
        tracker.record("a", 1000);
        tracker.record("c", 1000);

        assert_eq!(tracker.len(), 2);
        assert!(tracker.stats("b").is_none());
        assert_eq!(tracker.stats("a").unwrap().count, 2);
    }

    #[test]
    fn test_format_percentile_table() {
        let tracker = FunctionLatencyTracker::new();
        tracker.record("trace-func-0", 50_000);

        let table = format_percentile_table("Response time", &tracker.all_stats());
        assert!(table.contains("Response time"));
        assert!(table.contains("trace-func-0"));
        assert!(table.contains("P99"));
    }

    #[test]
    fn test_format_percentile_table_empty() {
        let table = format_percentile_table("Empty", &HashMap::new());
        assert!(table.contains("No data available"));
    }
}
