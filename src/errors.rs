//! Error types for the loader.
//!
//! Two very different kinds of failure exist. Fatal conditions that stop an
//! experiment before or while it is set up are reported as [`LoaderError`].
//! Per-invocation problems never abort scheduling: they are carried as flags
//! on the [`InvocationRecord`](crate::record::InvocationRecord) and classified
//! with [`FailureCategory`] for reporting.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::record::InvocationRecord;

/// Fatal errors: the experiment cannot proceed meaningfully.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Unsupported platform: '{0}'")]
    UnsupportedPlatform(String),

    #[error("Unsupported trace granularity: '{0}'. Use 'minute' or 'second'")]
    UnsupportedGranularity(String),

    #[error("Unsupported IAT distribution: '{0}'. Use 'exponential', 'uniform' or 'equidistant'")]
    UnsupportedDistribution(String),

    #[error("Malformed specification file {path:?}: {source}")]
    MalformedSpecification {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Record collector stopped after {written} of {expected} records")]
    CollectorIncomplete { written: u64, expected: u64 },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Outcome categories of a single invocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// The request could not be built, sent or established.
    ConnectionTimeout,

    /// Sent, but no valid response: non-200, empty body, or an async
    /// result that never resolved.
    FunctionTimeout,

    /// The platform reported resource exhaustion.
    MemoryAllocationTimeout,

    /// Non-fatal: the response body did not parse.
    DeserializationWarning,
}

impl FailureCategory {
    /// Classify a finalized record. Returns the most severe flag that is set,
    /// or `None` for a clean record.
    pub fn from_record(record: &InvocationRecord) -> Option<Self> {
        if record.connection_timeout {
            Some(FailureCategory::ConnectionTimeout)
        } else if record.function_timeout {
            Some(FailureCategory::FunctionTimeout)
        } else if record.memory_allocation_timeout {
            Some(FailureCategory::MemoryAllocationTimeout)
        } else if record.deserialization_warning {
            Some(FailureCategory::DeserializationWarning)
        } else {
            None
        }
    }

    /// Categorize a reqwest error raised while talking to the platform.
    ///
    /// Anything that happened before a response arrived counts as a
    /// connection timeout; errors reading or decoding the body mean the
    /// function did not produce a valid response.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_connect() || error.is_request() || error.is_builder() {
            FailureCategory::ConnectionTimeout
        } else if error.is_body() || error.is_decode() || error.is_status() {
            FailureCategory::FunctionTimeout
        } else if error.is_timeout() {
            // A timeout without a response on a sent request
            FailureCategory::FunctionTimeout
        } else {
            let error_msg = error.to_string().to_lowercase();
            if error_msg.contains("dns")
                || error_msg.contains("resolve")
                || error_msg.contains("connect")
            {
                FailureCategory::ConnectionTimeout
            } else {
                FailureCategory::FunctionTimeout
            }
        }
    }

    /// Get the Prometheus label for this category.
    pub fn label(&self) -> &'static str {
        match self {
            FailureCategory::ConnectionTimeout => "connection_timeout",
            FailureCategory::FunctionTimeout => "function_timeout",
            FailureCategory::MemoryAllocationTimeout => "memory_allocation_timeout",
            FailureCategory::DeserializationWarning => "deserialization_warning",
        }
    }

    /// Get a human-readable description of this category.
    pub fn description(&self) -> &'static str {
        match self {
            FailureCategory::ConnectionTimeout => "Connection could not be established",
            FailureCategory::FunctionTimeout => "No valid response from the function",
            FailureCategory::MemoryAllocationTimeout => "Platform memory allocation failure",
            FailureCategory::DeserializationWarning => "Response body did not parse",
        }
    }

    /// True for categories that mark the invocation itself as failed.
    pub fn is_failure(&self) -> bool {
        !matches!(self, FailureCategory::DeserializationWarning)
    }

    /// Get all categories in a consistent order.
    pub fn all() -> Vec<FailureCategory> {
        vec![
            FailureCategory::ConnectionTimeout,
            FailureCategory::FunctionTimeout,
            FailureCategory::MemoryAllocationTimeout,
            FailureCategory::DeserializationWarning,
        ]
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_record_has_no_category() {
        let record = InvocationRecord::default();
        assert_eq!(FailureCategory::from_record(&record), None);
    }

    #[test]
    fn test_connection_timeout_takes_precedence() {
        let record = InvocationRecord {
            connection_timeout: true,
            function_timeout: true,
            ..Default::default()
        };
        assert_eq!(
            FailureCategory::from_record(&record),
            Some(FailureCategory::ConnectionTimeout)
        );
    }

    #[test]
    fn test_memory_allocation_flag() {
        let record = InvocationRecord {
            memory_allocation_timeout: true,
            ..Default::default()
        };
        assert_eq!(
            FailureCategory::from_record(&record),
            Some(FailureCategory::MemoryAllocationTimeout)
        );
    }

    #[test]
    fn test_deserialization_warning_is_not_failure() {
        assert!(!FailureCategory::DeserializationWarning.is_failure());
        assert!(FailureCategory::FunctionTimeout.is_failure());
    }

    #[test]
    fn test_labels() {
        assert_eq!(FailureCategory::ConnectionTimeout.label(), "connection_timeout");
        assert_eq!(FailureCategory::FunctionTimeout.label(), "function_timeout");
        assert_eq!(
            FailureCategory::MemoryAllocationTimeout.label(),
            "memory_allocation_timeout"
        );
        assert_eq!(
            FailureCategory::DeserializationWarning.label(),
            "deserialization_warning"
        );
    }

    #[test]
    fn test_all_categories() {
        let categories = FailureCategory::all();
        assert_eq!(categories.len(), 4);
        assert!(categories.contains(&FailureCategory::FunctionTimeout));
    }

    #[test]
    fn test_loader_error_display() {
        let err = LoaderError::UnsupportedPlatform("Knative".to_string());
        assert!(err.to_string().contains("Knative"));

        let err = LoaderError::CollectorIncomplete {
            written: 3,
            expected: 5,
        };
        assert!(err.to_string().contains("3 of 5"));
    }
}
