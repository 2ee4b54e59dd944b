//! Per-invocation outcome records.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::function::ExperimentPhase;

/// Prefix of a platform body reporting that the sandbox could not get memory.
pub const MEMORY_ALLOCATION_FAILURE_PREFIX: &str = "FAILURE - mem_alloc";

/// Outcome of one invocation attempt.
///
/// Created by the transport, tagged by the dispatcher with phase and
/// identifier, and for async platforms completed by the async collector
/// before it reaches the sink. All durations are in microseconds; the column
/// order below is the order written to the output file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub phase: i32,
    pub function: String,
    pub instance: String,
    pub invocation_id: String,
    /// Unix timestamp of the request, in microseconds
    pub start_time: i64,
    pub requested_duration_us: u32,
    pub response_time_us: i64,
    pub actual_duration_us: u32,
    pub actual_memory_usage_mib: u32,
    pub connection_establish_time_us: i64,
    pub async_response_guid: String,
    pub time_to_submit_us: i64,
    pub user_code_execution_us: i64,
    pub time_to_get_response_us: i64,
    pub memory_allocation_timeout: bool,
    pub connection_timeout: bool,
    pub function_timeout: bool,
    pub deserialization_warning: bool,
}

impl InvocationRecord {
    /// A fresh record for `function` asking for `requested_runtime_ms`.
    pub fn for_function(function: &str, requested_runtime_ms: u32) -> Self {
        Self {
            function: function.to_string(),
            requested_duration_us: requested_runtime_ms.saturating_mul(1000),
            ..Default::default()
        }
    }

    pub fn set_phase(&mut self, phase: ExperimentPhase) {
        self.phase = phase.as_i32();
    }

    pub fn is_async_pending(&self) -> bool {
        !self.async_response_guid.is_empty()
    }

    /// True when any failure flag is set. A deserialization warning alone
    /// is not a failure.
    pub fn failed(&self) -> bool {
        self.connection_timeout || self.function_timeout || self.memory_allocation_timeout
    }

    /// Merge a platform response body into the record.
    ///
    /// A memory allocation failure marker sets its flag; a JSON body fills
    /// instance and actual duration; anything else raises the
    /// deserialization warning but leaves the record usable.
    pub fn merge_response_body(&mut self, body: &[u8]) {
        if body.starts_with(MEMORY_ALLOCATION_FAILURE_PREFIX.as_bytes()) {
            self.memory_allocation_timeout = true;
            return;
        }

        match serde_json::from_slice::<FunctionResponse>(body) {
            Ok(response) => {
                self.instance = response.function;
                self.actual_duration_us = response.execution_time.max(0) as u32;
            }
            Err(e) => {
                warn!(
                    function = %self.function,
                    error = %e,
                    "Failed to deserialize function response"
                );
                self.deserialization_warning = true;
            }
        }
    }
}

/// JSON body returned by the function runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FunctionResponse {
    pub status: String,
    pub function: String,
    pub machine_name: String,
    /// Execution time reported by the sandbox, in microseconds
    pub execution_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_function_converts_runtime() {
        let record = InvocationRecord::for_function("f", 250);
        assert_eq!(record.function, "f");
        assert_eq!(record.requested_duration_us, 250_000);
        assert!(!record.failed());
    }

    #[test]
    fn test_merge_json_body() {
        let mut record = InvocationRecord::default();
        record.merge_response_body(
            br#"{"Status":"OK","Function":"f-instance-1","MachineName":"w1","ExecutionTime":1200}"#,
        );
        assert_eq!(record.instance, "f-instance-1");
        assert_eq!(record.actual_duration_us, 1200);
        assert!(!record.deserialization_warning);
    }

    #[test]
    fn test_merge_memory_failure() {
        let mut record = InvocationRecord::default();
        record.merge_response_body(b"FAILURE - mem_alloc could not reserve 512MiB");
        assert!(record.memory_allocation_timeout);
        assert!(record.failed());
    }

    #[test]
    fn test_merge_garbage_sets_warning_only() {
        let mut record = InvocationRecord::default();
        record.merge_response_body(b"<html>oops</html>");
        assert!(record.deserialization_warning);
        assert!(!record.failed());
    }

    #[test]
    fn test_phase_tag() {
        let mut record = InvocationRecord::default();
        record.set_phase(ExperimentPhase::Warmup);
        assert_eq!(record.phase, 1);
        record.set_phase(ExperimentPhase::Execution);
        assert_eq!(record.phase, 2);
    }
}
