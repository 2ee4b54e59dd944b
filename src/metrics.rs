use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{
    Encoder, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use crate::errors::FailureCategory;
use crate::record::InvocationRecord;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "faas_trace_loader".to_string());

    // === Invocation Metrics ===

    pub static ref INVOCATIONS_ISSUED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("invocations_issued_total", "Total number of scheduled ticks dispatched")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref INVOCATION_OUTCOMES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("invocation_outcomes_total", "Function invocations by outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"]  // outcome: success, failed, async_pending
        ).unwrap();

    pub static ref INVOCATION_FAILURES_BY_CATEGORY: IntCounterVec =
        IntCounterVec::new(
            Opts::new("invocation_failures_total", "Invocation problems by category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"]
        ).unwrap();

    pub static ref IN_FLIGHT_INVOCATIONS: Gauge =
        Gauge::with_opts(
            Opts::new("in_flight_invocations", "Number of dispatched chains not yet finished")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref INVOCATION_RESPONSE_TIME_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "invocation_response_time_seconds",
                "Client-observed invocation response time in seconds."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Collection Metrics ===

    pub static ref ASYNC_QUEUE_DEPTH: IntGauge =
        IntGauge::with_opts(
            Opts::new("async_queue_depth", "Records waiting for their async result")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref RECORDS_WRITTEN_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("records_written_total", "Invocation records handed to the sink")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref EXPERIMENT_MINUTE: IntGauge =
        IntGauge::with_opts(
            Opts::new("experiment_minute", "Trace slots elapsed since the experiment started")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Invocation metrics
    prometheus::default_registry().register(Box::new(INVOCATIONS_ISSUED_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(INVOCATION_OUTCOMES.clone()))?;
    prometheus::default_registry().register(Box::new(INVOCATION_FAILURES_BY_CATEGORY.clone()))?;
    prometheus::default_registry().register(Box::new(IN_FLIGHT_INVOCATIONS.clone()))?;
    prometheus::default_registry().register(Box::new(INVOCATION_RESPONSE_TIME_SECONDS.clone()))?;

    // Collection metrics
    prometheus::default_registry().register(Box::new(ASYNC_QUEUE_DEPTH.clone()))?;
    prometheus::default_registry().register(Box::new(RECORDS_WRITTEN_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(EXPERIMENT_MINUTE.clone()))?;

    init_failure_category_labels();
    Ok(())
}

/// Creates every failure category series at zero so dashboards see all
/// labels before the first failure.
pub fn init_failure_category_labels() {
    for category in FailureCategory::all() {
        INVOCATION_FAILURES_BY_CATEGORY
            .with_label_values(&[category.label()])
            .inc_by(0);
    }
}

/// Updates outcome, category and latency metrics for a record leaving the
/// transport.
pub fn observe_record(record: &InvocationRecord, success: bool) {
    let outcome = if !success {
        "failed"
    } else if record.is_async_pending() {
        "async_pending"
    } else {
        "success"
    };
    INVOCATION_OUTCOMES.with_label_values(&[outcome]).inc();

    if let Some(category) = FailureCategory::from_record(record) {
        INVOCATION_FAILURES_BY_CATEGORY
            .with_label_values(&[category.label()])
            .inc();
    }

    INVOCATION_RESPONSE_TIME_SECONDS.observe(record.response_time_us.max(0) as f64 / 1e6);
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let buffer = encode_registry(&encoder, &registry);

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap_or_else(|_| Response::new(Body::empty()));

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(
        port = port,
        addr = %addr,
        "Metrics server listening"
    );

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

/// Gathers and encodes metrics as a string for final output.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    let buffer = encode_registry(&TextEncoder::new(), registry);
    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!(error = %e, "Error encoding metrics to UTF-8");
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}

fn encode_registry(encoder: &TextEncoder, registry: &Arc<Mutex<Registry>>) -> Vec<u8> {
    let metric_families = match registry.lock() {
        Ok(registry) => registry.gather(),
        Err(poisoned) => poisoned.into_inner().gather(),
    };
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_failed_record() {
        let before = INVOCATION_FAILURES_BY_CATEGORY
            .with_label_values(&["function_timeout"])
            .get();
        let record = InvocationRecord {
            function_timeout: true,
            ..Default::default()
        };
        observe_record(&record, false);
        let after = INVOCATION_FAILURES_BY_CATEGORY
            .with_label_values(&["function_timeout"])
            .get();
        assert!(after > before);
    }

    #[test]
    fn test_failure_labels_exported_before_any_failure() {
        let registry = Registry::new();
        registry
            .register(Box::new(INVOCATION_FAILURES_BY_CATEGORY.clone()))
            .unwrap();
        init_failure_category_labels();

        let output = gather_metrics_string(&Arc::new(Mutex::new(registry)));
        for category in FailureCategory::all() {
            assert!(
                output.contains(&format!("category=\"{}\"", category.label())),
                "missing {} in {}",
                category.label(),
                output
            );
        }
    }

    #[test]
    fn test_gather_from_custom_registry() {
        let registry = Registry::new();
        let counter = IntCounter::new("test_counter_total", "test").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let output = gather_metrics_string(&Arc::new(Mutex::new(registry)));
        assert!(output.contains("test_counter_total 1"));
    }
}
