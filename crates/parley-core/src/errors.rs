use serde::{Deserialize, Serialize};

/// Expected failure modes of the Ask path.
///
/// These are returned by value so callers can map them to transport-specific
/// status codes; the orchestrator never raises them across its boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskErrorKind {
    ConfigurationError,
    SchemaError,
    NoData,
    ApiError,
    SqlValidationError,
    TimeoutError,
    SqlExecutionError,
    ServerError,
}

impl AskErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AskErrorKind::ConfigurationError => "configuration_error",
            AskErrorKind::SchemaError => "schema_error",
            AskErrorKind::NoData => "no_data",
            AskErrorKind::ApiError => "api_error",
            AskErrorKind::SqlValidationError => "sql_validation_error",
            AskErrorKind::TimeoutError => "timeout_error",
            AskErrorKind::SqlExecutionError => "sql_execution_error",
            AskErrorKind::ServerError => "server_error",
        }
    }
}

impl std::fmt::Display for AskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
