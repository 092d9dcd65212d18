//! Error handling for the Confluence sync core.
//!
//! This module provides:
//! - A single error type carrying a machine-readable [`ErrorCode`]
//! - HTTP status mapping for the operator API
//! - Retryability classification consumed by the retry helper
//! - Severity-driven logging and error metrics
//!
//! # Usage
//!
//! ```rust,ignore
//! use confluence_core::error::{ConfluenceError, ErrorCode, ErrorContext, Result};
//!
//! fn load_cursor() -> Result<u64> {
//!     std::fs::read_to_string("cursor")
//!         .with_error_code(ErrorCode::InternalError)?
//!         .trim()
//!         .parse::<u64>()
//!         .context("cursor file is corrupt")
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for sync core operations.
pub type Result<T> = std::result::Result<T, ConfluenceError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and are what the CLI and external monitors match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Event Errors (1000-1099)
    EventStoreAppendFailed,
    EventNotFound,
    EventPublishFailed,
    InvalidEvent,

    // Resilience Errors (1100-1199)
    CircuitOpen,
    RateLimited,
    RetriesExhausted,

    // Conflict Errors (1200-1299)
    ConflictUnresolvable,

    // Saga Errors (1300-1399)
    SagaDefinitionNotFound,
    SagaNotFound,
    SagaExecutionFailed,
    SagaStepFailed,
    SagaStepTimeout,
    SagaCancelled,
    CompensationFailed,
    InvalidStateTransition,

    // Routing Errors (1400-1499)
    RouteNotFound,
    NoImplementation,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Collaborator Errors (3000-3099)
    CollaboratorUnavailable,
    CollaboratorRejected,
    NetworkError,
    Timeout,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::EventStoreAppendFailed => 1000,
            Self::EventNotFound => 1001,
            Self::EventPublishFailed => 1002,
            Self::InvalidEvent => 1003,

            Self::CircuitOpen => 1100,
            Self::RateLimited => 1101,
            Self::RetriesExhausted => 1102,

            Self::ConflictUnresolvable => 1200,

            Self::SagaDefinitionNotFound => 1300,
            Self::SagaNotFound => 1301,
            Self::SagaExecutionFailed => 1302,
            Self::SagaStepFailed => 1303,
            Self::SagaStepTimeout => 1304,
            Self::SagaCancelled => 1305,
            Self::CompensationFailed => 1306,
            Self::InvalidStateTransition => 1307,

            Self::RouteNotFound => 1400,
            Self::NoImplementation => 1401,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::CollaboratorUnavailable => 3000,
            Self::CollaboratorRejected => 3001,
            Self::NetworkError => 3002,
            Self::Timeout => 3003,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Not Found (404)
            Self::EventNotFound
            | Self::SagaDefinitionNotFound
            | Self::SagaNotFound
            | Self::RouteNotFound
            | Self::RecordNotFound => StatusCode::NOT_FOUND,

            // Conflict (409)
            Self::DuplicateRecord
            | Self::InvalidStateTransition
            | Self::ConflictUnresolvable
            | Self::SagaCancelled => StatusCode::CONFLICT,

            // Unprocessable Entity (422)
            Self::InvalidEvent
            | Self::ValidationError
            | Self::InvalidInput
            | Self::CollaboratorRejected => StatusCode::UNPROCESSABLE_ENTITY,

            // Too Many Requests (429)
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,

            // Timeout (504)
            Self::Timeout | Self::SagaStepTimeout => StatusCode::GATEWAY_TIMEOUT,

            // Service Unavailable (503)
            Self::CircuitOpen
            | Self::DatabaseConnectionFailed
            | Self::CollaboratorUnavailable
            | Self::RetriesExhausted => StatusCode::SERVICE_UNAVAILABLE,

            // Bad Gateway (502)
            Self::NetworkError => StatusCode::BAD_GATEWAY,

            // Not Implemented (501)
            Self::NoImplementation => StatusCode::NOT_IMPLEMENTED,

            // Internal Server Error (500)
            Self::EventStoreAppendFailed
            | Self::EventPublishFailed
            | Self::SagaExecutionFailed
            | Self::SagaStepFailed
            | Self::CompensationFailed
            | Self::DatabaseError
            | Self::DatabaseQueryFailed
            | Self::SerializationError
            | Self::DeserializationError
            | Self::InvalidJson
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transient infrastructure errors that the adapter layer may retry.
    ///
    /// Circuit-open and rate-limit rejections are deliberately absent: they are
    /// surfaced to the caller immediately.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::EventStoreAppendFailed
                | Self::EventPublishFailed
                | Self::CollaboratorUnavailable
                | Self::NetworkError
                | Self::Timeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "event",
            1100..=1199 => "resilience",
            1200..=1299 => "conflict",
            1300..=1399 => "saga",
            1400..=1499 => "routing",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            3000..=3099 => "collaborator",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown saga type)
    Low,
    /// Operational pushback (rate limits, open circuits, timeouts)
    Medium,
    /// Failed cross-system work
    High,
    /// Inconsistency that needs a human
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::InvalidEvent
            | ErrorCode::EventNotFound
            | ErrorCode::SagaDefinitionNotFound
            | ErrorCode::SagaNotFound
            | ErrorCode::RouteNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::InvalidStateTransition
            | ErrorCode::SagaCancelled => Self::Low,

            ErrorCode::CircuitOpen
            | ErrorCode::RateLimited
            | ErrorCode::Timeout
            | ErrorCode::SagaStepTimeout
            | ErrorCode::ConflictUnresolvable
            | ErrorCode::CollaboratorRejected
            | ErrorCode::NoImplementation => Self::Medium,

            ErrorCode::EventPublishFailed
            | ErrorCode::RetriesExhausted
            | ErrorCode::SagaExecutionFailed
            | ErrorCode::SagaStepFailed
            | ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::CollaboratorUnavailable
            | ErrorCode::NetworkError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::EventStoreAppendFailed
            | ErrorCode::CompensationFailed
            | ErrorCode::DatabaseConnectionFailed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (saga, event, route, dependency)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Seconds the caller should wait before trying again
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the sync core.
#[derive(Error, Debug)]
pub struct ConfluenceError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-facing message (safe to expose over the API)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ConfluenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ConfluenceError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details, keeping any context already attached.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        let mut details = details;
        for (k, v) in self.details.context.drain() {
            details.context.entry(k).or_insert(v);
        }
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// True when a circuit breaker short-circuited the call.
    pub fn is_circuit_open(&self) -> bool {
        self.code == ErrorCode::CircuitOpen
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Seconds to wait before retrying, if the error carries one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.details.retry_after_secs
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    alert = true,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "confluence_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error body returned by the operator API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&ConfluenceError> for ErrorResponse {
    fn from(error: &ConfluenceError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.context.is_empty()
                    && error.details.entity_id.is_none()
                    && error.details.retry_after_secs.is_none()
                {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for ConfluenceError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let retry_after = self.details.retry_after_secs;
        let body = ErrorResponse::from(&self);

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap the error as an internal error with a message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error under a specific code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| ConfluenceError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| ConfluenceError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ConfluenceError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| ConfluenceError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for ConfluenceError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "The requested record was not found"),
            sqlx::Error::Database(db_err) => {
                if let Some(constraint) = db_err.constraint() {
                    if constraint.contains("unique") || constraint.contains("pkey") {
                        return Self::with_internal(
                            ErrorCode::DuplicateRecord,
                            "A record with this identifier already exists",
                            format!("Constraint violation: {}", constraint),
                        )
                        .with_source(error);
                    }
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for ConfluenceError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<reqwest::Error> for ConfluenceError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (ErrorCode::Timeout, "Collaborator request timed out")
        } else if error.is_connect() {
            (ErrorCode::NetworkError, "Failed to connect to collaborator")
        } else if let Some(status) = error.status() {
            match status.as_u16() {
                429 => (ErrorCode::CollaboratorUnavailable, "Collaborator is shedding load"),
                400..=499 => (ErrorCode::CollaboratorRejected, "Collaborator rejected the request"),
                _ => (
                    ErrorCode::CollaboratorUnavailable,
                    "Collaborator is temporarily unavailable",
                ),
            }
        } else if error.is_decode() {
            (ErrorCode::DeserializationError, "Collaborator returned an unreadable body")
        } else {
            (ErrorCode::NetworkError, "Network error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for ConfluenceError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::Timeout, "Operation timed out", error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for ConfluenceError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::RecordNotFound, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::Timeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::NetworkError, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for ConfluenceError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ConfluenceError>() {
            Ok(inner) => inner,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for ConfluenceError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => {
                (ErrorCode::MissingConfiguration, "Required configuration not found")
            }
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                (ErrorCode::InvalidConfiguration, "Configuration file is invalid")
            }
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl ConfluenceError {
    // ─────────────────────────────────────────────────────────────────────────
    // Event Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// The store could not persist an event after all retries.
    pub fn append_failed(event_id: impl fmt::Display, attempts: u32) -> Self {
        Self::new(
            ErrorCode::EventStoreAppendFailed,
            format!("Failed to append event {} after {} attempts", event_id, attempts),
        )
        .with_details(ErrorDetails::new().with_entity("event", event_id.to_string()))
        .with_context("attempts", attempts)
    }

    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidEvent, format!("Invalid event: {}", reason.into()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Resilience Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// A breaker rejected the call without attempting it.
    pub fn circuit_open(dependency: impl Into<String>, retry_after_secs: u64) -> Self {
        let dependency = dependency.into();
        Self::new(
            ErrorCode::CircuitOpen,
            format!("Circuit open for {}", dependency),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("dependency", &dependency)
                .with_retry_after(retry_after_secs),
        )
    }

    /// A limiter denied admission.
    pub fn rate_limited(identifier: impl Into<String>, limit: u64, retry_after_secs: u64) -> Self {
        let identifier = identifier.into();
        Self::new(
            ErrorCode::RateLimited,
            format!(
                "Rate limit of {} exceeded for {}: retry after {}s",
                limit, identifier, retry_after_secs
            ),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("rate_limit_key", &identifier)
                .with_retry_after(retry_after_secs),
        )
        .with_context("limit", limit)
    }

    pub fn retries_exhausted(operation: impl Into<String>, attempts: u32, last: ConfluenceError) -> Self {
        let operation = operation.into();
        Self::new(
            ErrorCode::RetriesExhausted,
            format!("{} failed after {} attempts", operation, attempts),
        )
        .with_context("attempts", attempts)
        .with_context("last_error_code", last.code().to_string())
        .with_source(last)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Saga Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn saga_definition_not_found(saga_type: impl Into<String>) -> Self {
        let saga_type = saga_type.into();
        Self::new(
            ErrorCode::SagaDefinitionNotFound,
            format!("No saga registered for type {}", saga_type),
        )
        .with_details(ErrorDetails::new().with_entity("saga_type", &saga_type))
    }

    pub fn saga_not_found(saga_id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::SagaNotFound, format!("Saga not found: {}", saga_id))
            .with_details(ErrorDetails::new().with_entity("saga", saga_id.to_string()))
    }

    /// Terminal saga failure, wrapping the action error that triggered compensation.
    pub fn saga_execution_failed(
        saga_id: uuid::Uuid,
        failed_step: impl Into<String>,
        cause: ConfluenceError,
    ) -> Self {
        let failed_step = failed_step.into();
        Self::new(
            ErrorCode::SagaExecutionFailed,
            format!("Saga {} failed at step {}", saga_id, failed_step),
        )
        .with_details(ErrorDetails::new().with_entity("saga", saga_id.to_string()))
        .with_context("failed_step", &failed_step)
        .with_context("cause_code", cause.code().to_string())
        .with_source(cause)
    }

    pub fn saga_step_failed(step: impl Into<String>, reason: impl Into<String>) -> Self {
        let step = step.into();
        Self::new(
            ErrorCode::SagaStepFailed,
            format!("Saga step {} failed: {}", step, reason.into()),
        )
        .with_context("step", &step)
    }

    pub fn saga_step_timeout(step: impl Into<String>, timeout: std::time::Duration) -> Self {
        let step = step.into();
        Self::new(
            ErrorCode::SagaStepTimeout,
            format!("Saga step {} exceeded {:?}", step, timeout),
        )
        .with_context("step", &step)
        .with_context("timeout_ms", timeout.as_millis() as u64)
    }

    pub fn invalid_state_transition(from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid state transition: {:?} -> {:?}", from, to),
        )
        .with_context("from_state", format!("{:?}", from))
        .with_context("to_state", format!("{:?}", to))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Routing and Collaborator Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn route_not_found(route: impl Into<String>) -> Self {
        let route = route.into();
        Self::new(ErrorCode::RouteNotFound, format!("Unknown route: {}", route))
            .with_details(ErrorDetails::new().with_entity("route", &route))
    }

    pub fn no_implementation(route: impl Into<String>, side: impl fmt::Display) -> Self {
        let route = route.into();
        Self::new(
            ErrorCode::NoImplementation,
            format!("Route {} has no {} implementation", route, side),
        )
        .with_details(ErrorDetails::new().with_entity("route", &route))
    }

    pub fn collaborator_unavailable(system: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::CollaboratorUnavailable,
            format!("{} is unavailable: {}", system, reason.into()),
        )
        .with_context("system", system.to_string())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
