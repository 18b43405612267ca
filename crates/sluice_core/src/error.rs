//! Error types for the Sluice core.
//!
//! Every entry point returns [`SluiceError`]. Variants follow the failure
//! taxonomy of the subsystem: caller mistakes, denials, missing records,
//! vault malfunction, tunnel connectivity and engine-reported failures.

use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the crate.
pub type SluiceResult<T> = Result<T, SluiceError>;

/// Main error type for the Sluice core.
#[derive(Debug, Error)]
pub enum SluiceError {
    /// Malformed input, unknown enumerant or missing required field.
    #[error("Validation error: {message}")]
    Validation {
        /// Human-readable error message.
        message: String,
    },

    /// Role or grant does not permit the action.
    ///
    /// The message never says whether the target resource exists.
    #[error("Not authorized: {message}")]
    NotAuthorized {
        /// Human-readable error message.
        message: String,
    },

    /// No matching connection, credential set or saved query.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of record that was looked up.
        resource: &'static str,
        /// Identifier that did not resolve.
        id: String,
    },

    /// Encryption subsystem malfunction. Always fatal for the operation.
    #[error("Vault error: {message}")]
    Vault {
        /// Human-readable error message.
        message: String,
    },

    /// SSH server rejected the supplied credentials or key material.
    #[error("SSH authentication error: {message}")]
    TunnelAuth {
        /// Human-readable error message.
        message: String,
    },

    /// SSH host unreachable or handshake failed.
    #[error("SSH network error after {attempts} attempt(s): {message}")]
    TunnelNetwork {
        /// Human-readable error message.
        message: String,
        /// Number of dial attempts made before giving up.
        attempts: u32,
    },

    /// Tunnel used after it was torn down.
    #[error("SSH tunnel is closed")]
    TunnelClosed,

    /// Query execution error reported by the database engine.
    #[error("{message}")]
    QueryExecution {
        /// Engine error message.
        message: String,
        /// Additional detail from the engine.
        detail: Option<String>,
        /// Engine hint.
        hint: Option<String>,
        /// Position in query (1-indexed).
        position: Option<usize>,
        /// Engine error code (e.g., SQLSTATE "42P01").
        code: Option<String>,
    },

    /// Driver connection failed or was lost mid-query.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query was cancelled by its caller.
    #[error("Query cancelled")]
    QueryCancelled {
        /// ID of the cancelled query.
        query_id: Uuid,
    },

    /// Local SQLite storage error.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl SluiceError {
    // ========== Constructors ==========

    /// Create a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Create a new authorization denial.
    pub fn not_authorized(message: impl Into<String>) -> Self {
        Self::NotAuthorized { message: message.into() }
    }

    /// Create a new not-found error.
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound { resource, id: id.to_string() }
    }

    /// Create a new vault error.
    pub fn vault(message: impl Into<String>) -> Self {
        Self::Vault { message: message.into() }
    }

    /// Create a new tunnel authentication error.
    pub fn tunnel_auth(message: impl Into<String>) -> Self {
        Self::TunnelAuth { message: message.into() }
    }

    /// Create a new tunnel network error for a single attempt.
    pub fn tunnel_network(message: impl Into<String>) -> Self {
        Self::TunnelNetwork { message: message.into(), attempts: 1 }
    }

    /// Create a new query execution error with full engine details.
    pub fn query(
        message: impl Into<String>,
        detail: Option<String>,
        hint: Option<String>,
        position: Option<usize>,
        code: Option<String>,
    ) -> Self {
        Self::QueryExecution { message: message.into(), detail, hint, position, code }
    }

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a query cancelled error.
    pub fn query_cancelled(query_id: Uuid) -> Self {
        Self::QueryCancelled { query_id }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Check if this error represents a cancelled query.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::QueryCancelled { .. })
    }

    /// Check if the driver connection was lost (eligible for a single read retry).
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Check if this is a tunnel network failure (eligible for dial backoff).
    pub fn is_tunnel_network(&self) -> bool {
        matches!(self, Self::TunnelNetwork { .. })
    }

    /// Check if this error is a denial.
    pub fn is_not_authorized(&self) -> bool {
        matches!(self, Self::NotAuthorized { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "Validation",
            Self::NotAuthorized { .. } => "Authorization",
            Self::NotFound { .. } => "NotFound",
            Self::Vault { .. } => "Vault",
            Self::TunnelAuth { .. } | Self::TunnelNetwork { .. } | Self::TunnelClosed => "Tunnel",
            Self::QueryExecution { .. } | Self::QueryCancelled { .. } => "Query",
            Self::Connection { .. } => "Connection",
            Self::Storage { .. } => "Storage",
            Self::Config { .. } => "Config",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the caller.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Validation { .. } => Some("Correct the highlighted field and retry"),
            Self::NotAuthorized { .. } => Some("Ask a project admin for access"),
            Self::NotFound { .. } => None,
            Self::Vault { .. } => Some("Check the configured encryption key"),
            Self::TunnelAuth { .. } => Some("Check the SSH user, password and key"),
            Self::TunnelNetwork { .. } => Some("Verify the SSH server is running and reachable"),
            Self::TunnelClosed => Some("Reconnect to open a new tunnel"),
            Self::QueryExecution { hint, .. } => hint.as_deref(),
            Self::Connection { .. } => Some("Check that the database server is running"),
            Self::QueryCancelled { .. } => None,
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Config { .. } => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get engine error code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::QueryExecution { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Convert to caller-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::QueryExecution { detail, code, position, .. } => {
                let mut parts = Vec::new();
                if let Some(code) = code {
                    parts.push(format!("Code: {code}"));
                }
                if let Some(pos) = position {
                    parts.push(format!("Position: {pos}"));
                }
                if let Some(detail) = detail {
                    parts.push(format!("Detail: {detail}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            Self::TunnelNetwork { attempts, .. } => Some(format!("{attempts} dial attempt(s)")),
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// Caller-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Query Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for "Show Details" expansion.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to SluiceError.
impl From<tokio_postgres::Error> for SluiceError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let detail = db_err.detail().map(String::from);
            let hint = db_err.hint().map(String::from);
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos as usize),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });
            let code_str = db_err.code().code();

            // Connection exceptions (08xxx) and admin shutdown (57P01) count as connectivity loss
            if code_str.starts_with("08") || code_str == "57P01" {
                return SluiceError::Connection { message, source: Some(Box::new(err)) };
            }
            let code = Some(code_str.to_string());
            return SluiceError::QueryExecution { message, detail, hint, position, code };
        }

        if err.is_closed() {
            return SluiceError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        if caused_by_io(&err) {
            return SluiceError::Connection { message: err.to_string(), source: Some(Box::new(err)) };
        }

        // Decoding and protocol failures on a live connection.
        SluiceError::QueryExecution {
            message: err.to_string(),
            detail: None,
            hint: None,
            position: None,
            code: None,
        }
    }
}

fn caused_by_io(err: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        source = cause.source();
    }
    false
}

/// Convert from rusqlite::Error to SluiceError.
impl From<rusqlite::Error> for SluiceError {
    fn from(err: rusqlite::Error) -> Self {
        SluiceError::Storage {
            message: err.to_string(),
            hint: Some("The local database may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from std::io::Error to SluiceError.
impl From<std::io::Error> for SluiceError {
    fn from(err: std::io::Error) -> Self {
        SluiceError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from serde_json::Error to SluiceError.
impl From<serde_json::Error> for SluiceError {
    fn from(err: serde_json::Error) -> Self {
        SluiceError::Storage {
            message: format!("JSON error: {err}"),
            hint: Some("Data may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from figment::Error to SluiceError.
impl From<figment::Error> for SluiceError {
    fn from(err: figment::Error) -> Self {
        SluiceError::Config { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_group_tunnel_failures() {
        assert_eq!(SluiceError::tunnel_auth("bad key").category(), "Tunnel");
        assert_eq!(SluiceError::tunnel_network("refused").category(), "Tunnel");
        assert_eq!(SluiceError::TunnelClosed.category(), "Tunnel");
    }

    #[test]
    fn test_query_error_info_carries_engine_details() {
        let err = SluiceError::query(
            "relation \"missing\" does not exist",
            None,
            None,
            Some(15),
            Some("42P01".to_string()),
        );
        let info = err.to_error_info();
        assert_eq!(info.error_type, "Query Error");
        let detail = info.technical_detail.unwrap();
        assert!(detail.contains("Code: 42P01"));
        assert!(detail.contains("Position: 15"));
        assert_eq!(err.pg_code(), Some("42P01"));
    }

    #[test]
    fn test_not_found_message_names_resource() {
        let err = SluiceError::not_found("Saved query", "abc");
        assert_eq!(err.to_string(), "Saved query not found: abc");
    }

    #[test]
    fn test_retry_classification() {
        assert!(SluiceError::connection("reset").is_connection_lost());
        assert!(!SluiceError::query("syntax", None, None, None, None).is_connection_lost());
        assert!(SluiceError::tunnel_network("refused").is_tunnel_network());
        assert!(!SluiceError::tunnel_auth("denied").is_tunnel_network());
    }

    #[test]
    fn test_driver_error_without_io_is_not_connection_loss() {
        let err = "port=not-a-port".parse::<tokio_postgres::Config>().unwrap_err();
        let err = SluiceError::from(err);
        assert!(!err.is_connection_lost());
        assert!(matches!(err, SluiceError::QueryExecution { code: None, .. }));
    }

    #[tokio::test]
    async fn test_refused_connect_is_connection_loss() {
        let port = crate::services::tunnel::tests::closed_port().await;
        let err = tokio_postgres::connect(
            &format!("host=127.0.0.1 port={port} user=sluice connect_timeout=2"),
            tokio_postgres::NoTls,
        )
        .await
        .err()
        .unwrap();
        assert!(SluiceError::from(err).is_connection_lost());
    }
}
