use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use faas_trace_loader::collector::CsvRecordSink;
use faas_trace_loader::config::LoaderConfig;
use faas_trace_loader::driver::{load_function_definitions, prepare_functions, Driver};
use faas_trace_loader::metrics::{gather_metrics_string, register_metrics, start_metrics_server};
use faas_trace_loader::telemetry::LocalNodeScraper;
use faas_trace_loader::transport::{
    build_client, ClientConfig, HttpInvoker, HttpResultFetcher,
};

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Configuration is read from the YAML file named by CONFIG_FILE, or from");
    eprintln!("the environment variables below.");
    eprintln!();
    eprintln!("Required:");
    eprintln!("  FUNCTIONS_FILE          - JSON array of functions to invoke");
    eprintln!();
    eprintln!("Optional:");
    eprintln!("  PLATFORM                - Dirigent or Dirigent-Dandelion, optionally with -RPS (default: Dirigent)");
    eprintln!("  TRACE_DURATION          - Trace length in granularity units (default: 10)");
    eprintln!("  TRACE_GRANULARITY       - minute or second (default: minute)");
    eprintln!("  WARMUP_DURATION         - Warmup minutes, 0 disables warmup (default: 0)");
    eprintln!("  SPECIFICATION_DIR       - Read iat<i>.json specifications from this directory");
    eprintln!("  IAT_DISTRIBUTION        - exponential, uniform or equidistant (default: exponential)");
    eprintln!("  SEED                    - Seed for specification generation (default: 42)");
    eprintln!("  DAG_MODE                - Invoke all functions as one chain (default: false)");
    eprintln!("  FUNCTION_TIMEOUT        - Per-invocation timeout: 30s, 15m (default: 900s)");
    eprintln!("  OUTPUT_PATH_PREFIX      - Output file prefix (default: data/out/experiment)");
    eprintln!();
    eprintln!("Async platforms:");
    eprintln!("  ASYNC_MODE              - Fetch results later by response handle (default: false)");
    eprintln!("  ASYNC_RESPONSE_URL      - host:port of the result endpoint (required in async mode)");
    eprintln!("  ASYNC_WAIT_TO_COLLECT   - Grace period before collecting (default: 60s)");
    eprintln!("  ASYNC_BATCH_SIZE        - Concurrent fetches per batch (default: 50)");
    eprintln!("  ASYNC_FETCH_TIMEOUT     - Timeout of one fetch (default: 2s)");
    eprintln!();
    eprintln!("Telemetry:");
    eprintln!("  ENABLE_METRICS_SCRAPING - Sample node usage periodically (default: false)");
    eprintln!("  METRICS_SCRAPING_PERIOD - Sampling period (default: 15s)");
    eprintln!("  METRICS_PORT            - Serve Prometheus metrics on this port");
    eprintln!("  METRIC_NAMESPACE        - Prometheus metric namespace (default: faas_trace_loader)");
    eprintln!("  DIVERGENCE_CHECK        - Stop schedulers that diverge from the trace (default: false)");
    eprintln!("  RUST_LOG                - Log filter (default: info)");
    eprintln!("  LOG_FORMAT              - Set to json for JSON logs");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(false))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }
}

fn load_config() -> Result<LoaderConfig, faas_trace_loader::errors::LoaderError> {
    match std::env::var("CONFIG_FILE") {
        Ok(path) => LoaderConfig::from_yaml_file(path),
        Err(_) => LoaderConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    // Register Prometheus metrics
    register_metrics()?;

    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            print_config_help();
            std::process::exit(1);
        }
    };
    let Some(functions_file) = config.functions_file.clone() else {
        eprintln!("Configuration error: no functions file given\n");
        print_config_help();
        std::process::exit(1);
    };

    config.print_summary();

    let definitions = load_function_definitions(&functions_file)?;
    let functions = prepare_functions(definitions, &config)?;
    info!(
        functions = functions.len(),
        file = %functions_file,
        "Loaded functions"
    );

    let registry_arc = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    if let Some(port) = config.metrics_port {
        let registry = registry_arc.clone();
        tokio::spawn(async move {
            start_metrics_server(port, registry).await;
        });
    }

    let client = build_client(&ClientConfig {
        timeout: config.function_timeout,
        ..Default::default()
    })?;
    let invoker = Arc::new(HttpInvoker::new(client, config.async_mode));
    let sink = CsvRecordSink::create(config.output_filename("duration"))?;

    let mut driver = Driver::new(config.clone(), functions, invoker, sink)
        .with_scraper(Arc::new(LocalNodeScraper));
    if let Some(url) = config.async_response_url.as_deref().filter(|_| config.async_mode) {
        let fetch_client = build_client(&ClientConfig::for_fetching(config.async_fetch_timeout))?;
        driver = driver.with_fetcher(Arc::new(HttpResultFetcher::new(fetch_client, url)));
    }

    let summary = match driver.run().await {
        Ok((summary, _sink)) => summary,
        Err(e) => {
            error!(error = %e, "Experiment failed");
            return Err(e.into());
        }
    };
    summary.print();

    if config.metrics_port.is_some() {
        let final_metrics_output = gather_metrics_string(&registry_arc);
        println!("\n--- FINAL METRICS ---\n{}", final_metrics_output);
        println!("--- END OF FINAL METRICS ---\n");
    }

    Ok(())
}
