//! Invocation transport: how one invocation reaches the platform.
//!
//! The scheduler only depends on the [`Invoker`] and [`ResultFetcher`]
//! traits. [`HttpInvoker`] and [`HttpResultFetcher`] are the Dirigent-style
//! HTTP implementations.

use async_trait::async_trait;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, trace};

use crate::errors::{FailureCategory, LoaderError};
use crate::function::{Function, RuntimeSpecification};
use crate::record::InvocationRecord;
use crate::utils::{duration_micros, unix_micros_now};

/// Response header carrying the server-measured end-to-end latency of an
/// async invocation.
pub const DURATION_MICROSECONDS_HEADER: &str = "Duration-Microseconds";

/// Issues one invocation.
///
/// Implementations must return within a bounded time and always produce a
/// record, with timing fields filled up to the point of failure.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        function: &Function,
        spec: &RuntimeSpecification,
    ) -> (bool, InvocationRecord);
}

/// Retrieves the result of an async invocation by its response handle.
///
/// An empty body means the result is not available.
#[async_trait]
pub trait ResultFetcher: Send + Sync {
    async fn fetch_result(&self, handle: &str) -> (Vec<u8>, i64);
}

/// Connection settings for the HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Whole-request timeout
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Maximum idle connections to keep per host
    pub max_idle_per_host: usize,
    /// How long idle connections stay in the pool before cleanup
    pub idle_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            connect_timeout: Duration::from_secs(10),
            max_idle_per_host: 3000,
            idle_timeout: Duration::from_secs(60),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl ClientConfig {
    /// Settings for a client that only fetches async results.
    pub fn for_fetching(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Builds a reqwest client with the given pool and timeout settings.
pub fn build_client(config: &ClientConfig) -> Result<reqwest::Client, LoaderError> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(config.idle_timeout);

    if let Some(keepalive) = config.tcp_keepalive {
        builder = builder.tcp_keepalive(keepalive);
    }

    let client = builder.build()?;
    debug!(
        timeout = ?config.timeout,
        max_idle_per_host = config.max_idle_per_host,
        idle_timeout = ?config.idle_timeout,
        "HTTP client configured"
    );
    Ok(client)
}

/// Invokes functions with plain HTTP GETs against their endpoint.
pub struct HttpInvoker {
    client: reqwest::Client,
    async_mode: bool,
}

impl HttpInvoker {
    pub fn new(client: reqwest::Client, async_mode: bool) -> Self {
        Self { client, async_mode }
    }

    fn build_request(
        &self,
        function: &Function,
        spec: &RuntimeSpecification,
    ) -> reqwest::RequestBuilder {
        let url = format!("http://{}", function.endpoint);
        self.client
            .get(url)
            .header(reqwest::header::HOST, function.name.as_str())
            .header("workload", function.workload.image.as_str())
            .header("function", function.name.as_str())
            .header("requested_cpu", spec.runtime.to_string())
            .header("requested_memory", spec.memory.to_string())
            .header(
                "multiplier",
                function.workload.iteration_multiplier.to_string(),
            )
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    /// A `FAILURE - mem_alloc` body counts as a failure, so a DAG chain stops there.
    async fn invoke(
        &self,
        function: &Function,
        spec: &RuntimeSpecification,
    ) -> (bool, InvocationRecord) {
        trace!(
            function = %function.name,
            runtime_ms = spec.runtime,
            memory_mib = spec.memory,
            "Invoke"
        );

        let mut record = InvocationRecord::for_function(&function.name, spec.runtime);
        let start = Instant::now();
        record.start_time = unix_micros_now();

        let response = match self.build_request(function, spec).send().await {
            Ok(response) => response,
            Err(e) => {
                let category = FailureCategory::from_reqwest_error(&e);
                error!(
                    function = %function.name,
                    endpoint = %function.endpoint,
                    error = %e,
                    error_category = category.label(),
                    "Failed to send an HTTP request to the server"
                );
                record.response_time_us = duration_micros(start.elapsed());
                record.connection_timeout = true;
                return (false, record);
            }
        };

        record.connection_establish_time_us = duration_micros(start.elapsed());
        let status = response.status();

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                error!(
                    function = %function.name,
                    error = %e,
                    "HTTP request failed while reading the body"
                );
                record.response_time_us = duration_micros(start.elapsed());
                record.function_timeout = true;
                return (false, record);
            }
        };
        record.response_time_us = duration_micros(start.elapsed());

        if status != reqwest::StatusCode::OK || body.is_empty() {
            if body.is_empty() {
                error!(
                    function = %function.name,
                    endpoint = %function.endpoint,
                    status_code = status.as_u16(),
                    "HTTP request failed - empty response"
                );
            } else {
                error!(
                    function = %function.name,
                    endpoint = %function.endpoint,
                    status_code = status.as_u16(),
                    body = %String::from_utf8_lossy(&body),
                    "HTTP request failed - non-OK response"
                );
            }
            record.function_timeout = true;
            return (false, record);
        }

        if self.async_mode {
            record.async_response_guid = String::from_utf8_lossy(&body).trim().to_string();
            return (true, record);
        }

        record.merge_response_body(&body);
        if record.memory_allocation_timeout {
            debug!(function = %function.name, "Platform reported a memory allocation failure");
            return (false, record);
        }

        (true, record)
    }
}

/// Fetches async results from the platform's response endpoint.
pub struct HttpResultFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpResultFetcher {
    /// `endpoint` is a `host:port` pair, as in the experiment config.
    pub fn new(client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            client,
            url: format!("http://{}", endpoint),
        }
    }
}

#[async_trait]
impl ResultFetcher for HttpResultFetcher {
    async fn fetch_result(&self, handle: &str) -> (Vec<u8>, i64) {
        let response = match self
            .client
            .get(&self.url)
            .body(handle.to_string())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(guid = handle, error = %e, "Failed to retrieve async response");
                return (Vec::new(), 0);
            }
        };

        let e2e = match response.headers().get(DURATION_MICROSECONDS_HEADER) {
            Some(value) => match value.to_str().ok().and_then(|v| v.trim().parse().ok()) {
                Some(micros) => micros,
                None => {
                    error!(guid = handle, "Failed to parse end-to-end latency header");
                    0
                }
            },
            None => 0,
        };

        match response.bytes().await {
            Ok(body) => (body.to_vec(), e2e),
            Err(e) => {
                error!(guid = handle, error = %e, "Failed to read async response body");
                (Vec::new(), e2e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_defaults() {
        assert!(build_client(&ClientConfig::default()).is_ok());
    }

    #[test]
    fn test_fetching_config_keeps_pool_defaults() {
        let config = ClientConfig::for_fetching(Duration::from_secs(2));
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.max_idle_per_host, 3000);
    }
}
