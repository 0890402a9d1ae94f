/// Unified error handling for the semaforo control plane
///
/// This module provides the error type system covering dispatch errors that
/// surface to clients as typed JSON bodies, federation errors that drive role
/// transitions instead of bubbling to clients, store errors, and
/// configuration errors.
use std::fmt;
use std::io;
use std::net::AddrParseError;

use http::StatusCode;
use thiserror::Error;

/// Main error type for semaforo operations
#[derive(Debug, Error)]
pub enum SemaforoError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Request dispatch errors (surface to clients as typed JSON)
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Federation coordination errors
    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),

    /// Store access errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Health check errors
    #[error("Health check failed: {message}")]
    HealthCheck { message: String },

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParse(#[from] AddrParseError),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Errors raised while dispatching a request against a published endpoint.
///
/// Every variant maps to a stable wire code and an HTTP status; the
/// dispatcher renders them as `{"code": ..., "message": ...}` bodies.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no endpoint published under slug '{slug}'")]
    EndpointNotFound { slug: String },

    #[error("endpoint '{slug}' is disabled")]
    EndpointDisabled { slug: String },

    #[error("endpoint '{slug}' has no cluster attached")]
    NoCluster { slug: String },

    #[error("cluster '{cluster_id}' has no backends")]
    NoBackends { cluster_id: String },

    #[error("cluster '{cluster_id}' has no healthy backends")]
    NoHealthyBackends { cluster_id: String },

    #[error("backend request timed out: {target}")]
    BackendTimeout { target: String },

    #[error("backend request failed: {message}")]
    BackendError { message: String },

    #[error("endpoint '{slug}' does not accept websocket connections")]
    WebsocketNotSupported { slug: String },

    #[error("too many federation hops ({hops})")]
    TooManyHops { hops: u32 },
}

impl ProxyError {
    /// Stable wire code carried in the JSON error body
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::EndpointNotFound { .. } => "ENDPOINT_NOT_FOUND",
            ProxyError::EndpointDisabled { .. } => "ENDPOINT_DISABLED",
            ProxyError::NoCluster { .. } => "NO_CLUSTER",
            ProxyError::NoBackends { .. } => "NO_BACKENDS",
            ProxyError::NoHealthyBackends { .. } => "NO_HEALTHY_BACKENDS",
            ProxyError::BackendTimeout { .. } => "BACKEND_TIMEOUT",
            ProxyError::BackendError { .. } => "BACKEND_ERROR",
            ProxyError::WebsocketNotSupported { .. } => "WEBSOCKET_NOT_SUPPORTED",
            ProxyError::TooManyHops { .. } => "TOO_MANY_HOPS",
        }
    }

    /// HTTP status the error surfaces with
    pub fn http_status(&self) -> StatusCode {
        match self {
            ProxyError::EndpointNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::EndpointDisabled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::NoCluster { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::NoBackends { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::NoHealthyBackends { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BackendError { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::WebsocketNotSupported { .. } => StatusCode::BAD_REQUEST,
            ProxyError::TooManyHops { .. } => StatusCode::LOOP_DETECTED,
        }
    }

    pub fn endpoint_not_found<S: Into<String>>(slug: S) -> Self {
        ProxyError::EndpointNotFound { slug: slug.into() }
    }

    pub fn backend<S: Into<String>>(message: S) -> Self {
        ProxyError::BackendError {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(target: S) -> Self {
        ProxyError::BackendTimeout {
            target: target.into(),
        }
    }
}

/// Federation coordination errors
///
/// These are recorded (sync logs, partner status) and drive role transitions;
/// they never surface to proxied clients directly.
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("federation is not configured for this node")]
    NotConfigured,

    #[error("operation requires role {required}, node is {actual}")]
    RoleViolation { required: String, actual: String },

    #[error("peer {node} unreachable: {message}")]
    Unreachable { node: String, message: String },

    #[error("peer {node} rejected the call: {message}")]
    Rejected { node: String, message: String },

    #[error("federation secret mismatch")]
    InvalidSecret,

    #[error("sync with partner {partner_id} failed: {message}")]
    SyncFailed { partner_id: String, message: String },

    #[error("promotion protocol error: {message}")]
    Promotion { message: String },
}

impl FederationError {
    pub fn unreachable<S: Into<String>>(node: S, message: S) -> Self {
        FederationError::Unreachable {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn role_violation<S: Into<String>>(required: S, actual: S) -> Self {
        FederationError::RoleViolation {
            required: required.into(),
            actual: actual.into(),
        }
    }

    pub fn promotion<S: Into<String>>(message: S) -> Self {
        FederationError::Promotion {
            message: message.into(),
        }
    }
}

/// Store access errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found<S: Into<String>>(entity: &'static str, key: S) -> Self {
        StoreError::NotFound {
            entity,
            key: key.into(),
        }
    }
}

/// Result type alias for semaforo operations
pub type SemaforoResult<T> = Result<T, SemaforoError>;

/// Convenience methods for creating specific error types
impl SemaforoError {
    /// Create a health check error
    pub fn health_check<S: Into<String>>(message: S) -> Self {
        SemaforoError::HealthCheck {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        SemaforoError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        SemaforoError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            SemaforoError::Network(_) => true,
            SemaforoError::HealthCheck { .. } => true,
            SemaforoError::Timeout { .. } => true,
            SemaforoError::Proxy(ProxyError::BackendTimeout { .. }) => true,
            SemaforoError::Proxy(ProxyError::BackendError { .. }) => true,
            SemaforoError::Federation(FederationError::Unreachable { .. }) => true,
            SemaforoError::Federation(FederationError::SyncFailed { .. }) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SemaforoError::Config(_) => ErrorSeverity::Critical,
            SemaforoError::Internal { .. } => ErrorSeverity::Critical,
            SemaforoError::Network(_) => ErrorSeverity::Warning,
            SemaforoError::HealthCheck { .. } => ErrorSeverity::Info,
            SemaforoError::Timeout { .. } => ErrorSeverity::Warning,
            SemaforoError::Proxy(_) => ErrorSeverity::Warning,
            SemaforoError::Federation(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_codes() {
        let error = ProxyError::endpoint_not_found("api-main");
        assert_eq!(error.code(), "ENDPOINT_NOT_FOUND");
        assert_eq!(error.http_status(), StatusCode::NOT_FOUND);

        let error = ProxyError::NoHealthyBackends {
            cluster_id: "c1".to_string(),
        };
        assert_eq!(error.code(), "NO_HEALTHY_BACKENDS");
        assert_eq!(error.http_status(), StatusCode::SERVICE_UNAVAILABLE);

        let error = ProxyError::timeout("http://10.0.0.1:8080/users");
        assert_eq!(error.code(), "BACKEND_TIMEOUT");
        assert_eq!(error.http_status(), StatusCode::GATEWAY_TIMEOUT);

        let error = ProxyError::TooManyHops { hops: 4 };
        assert_eq!(error.code(), "TOO_MANY_HOPS");
        assert_eq!(error.http_status().as_u16(), 508);
        assert!(error.to_string().contains("too many federation hops"));
    }

    #[test]
    fn test_error_severity() {
        let config_error = SemaforoError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let network_error =
            SemaforoError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert_eq!(network_error.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_error_recoverability() {
        let timeout = SemaforoError::from(ProxyError::timeout("http://h:80"));
        assert!(timeout.is_recoverable());

        let unreachable =
            SemaforoError::from(FederationError::unreachable("node-b", "connection refused"));
        assert!(unreachable.is_recoverable());

        let config_error = SemaforoError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(!config_error.is_recoverable());
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::not_found("endpoint", "api-main");
        assert_eq!(err.to_string(), "endpoint not found: api-main");
    }
}
