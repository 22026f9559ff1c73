/// Error Handling Module
///
/// One taxonomy for the whole service:
/// 1. Domain errors (`ValidationError`, `StoreError`)
/// 2. `AppError`, the control-flow error every operation returns
/// 3. HTTP mapping with a stable machine-readable `code`
/// 4. Request context: one request id shared by the response and its log line

use actix_web::{error::ResponseError, http::StatusCode, HttpMessage, HttpRequest, HttpResponse};
use serde::Serialize;

use crate::middleware::{RequestId, REQUEST_ID_HEADER};

/// ============================================================================
/// 1. DOMAIN-SPECIFIC ERROR TYPES
/// ============================================================================

/// Malformed user input
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} is empty")]
    EmptyField(&'static str),
    #[error("{0} is too short (minimum {1} characters)")]
    TooShort(&'static str, usize),
    #[error("{0} is too long (maximum {1} characters)")]
    TooLong(&'static str, usize),
    #[error("{0} has invalid format")]
    InvalidFormat(&'static str),
    #[error("{0} contains suspicious content")]
    SuspiciousContent(&'static str),
}

/// Failures raised by a credential store or refresh token ledger
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint rejected the write; carries the offending field
    #[error("duplicate {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                let constraint = db.constraint().unwrap_or_default();
                let field = if constraint.contains("email") {
                    "email"
                } else if constraint.contains("username") {
                    "username"
                } else {
                    constraint
                };
                StoreError::Conflict(field.to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// ============================================================================
/// 2. UNIFIED APPLICATION ERROR TYPE
/// ============================================================================

/// Central error type returned by every session operation
///
/// Every failure caused by a user-supplied secret collapses into
/// `AuthRequired`, whatever the underlying reason.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0} is already registered")]
    Conflict(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("account is temporarily locked")]
    AccountLocked,
    #[error(transparent)]
    Store(StoreError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(field) => AppError::Conflict(field),
            other => AppError::Store(other),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Stable code for client-side handling
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Conflict(_) => "CONFLICT",
            AppError::AuthRequired => "AUTH_REQUIRED",
            AppError::AccountLocked => "ACCOUNT_LOCKED",
            AppError::Store(StoreError::Unavailable(_)) => "SERVICE_UNAVAILABLE",
            AppError::Store(_) | AppError::Config(_) | AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::AuthRequired => StatusCode::UNAUTHORIZED,
            AppError::AccountLocked => StatusCode::LOCKED,
            AppError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Store(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

// ============================================================================
// 3. HTTP RESPONSE MAPPING
// ============================================================================

/// Error body returned to HTTP clients
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Unique error ID for correlating with server logs
    pub error_id: String,
    pub message: String,
    pub code: String,
    pub status: u16,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_id: String, message: String, code: String, status: u16) -> Self {
        Self {
            error_id,
            message,
            code,
            status,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Trait for converting errors to HTTP responses with proper logging
pub trait ErrorHandler {
    fn error_response(&self, request_id: &str) -> (StatusCode, ErrorResponse);
    fn log_error(&self, context: &ErrorContext);
}

impl ErrorHandler for AppError {
    fn error_response(&self, request_id: &str) -> (StatusCode, ErrorResponse) {
        let status = self.status_code();
        // Internal details stay in the logs
        let message = match self {
            AppError::Validation(e) => e.to_string(),
            AppError::Conflict(_) | AppError::AuthRequired | AppError::AccountLocked => {
                self.to_string()
            }
            AppError::Store(StoreError::Unavailable(_)) => {
                "Service temporarily unavailable".to_string()
            }
            AppError::Store(_) | AppError::Config(_) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
        };

        let error_response = ErrorResponse::new(
            request_id.to_string(),
            message,
            self.code().to_string(),
            status.as_u16(),
        );

        (status, error_response)
    }

    fn log_error(&self, context: &ErrorContext) {
        let request_id = context.request_id.as_str();
        let operation = context.operation;
        let user_id = context.user_id.as_deref();

        match self {
            AppError::Validation(e) => {
                tracing::warn!(request_id, operation, user_id, error = %e, "Validation error");
            }
            AppError::Conflict(_) => {
                tracing::warn!(request_id, operation, user_id, error = %self, "Duplicate registration attempt");
            }
            AppError::AuthRequired | AppError::AccountLocked => {
                tracing::warn!(request_id, operation, user_id, code = self.code(), "Authentication rejected");
            }
            AppError::Store(e) => {
                tracing::error!(request_id, operation, user_id, error = %e, "Store error");
            }
            AppError::Config(msg) | AppError::Internal(msg) => {
                tracing::error!(request_id, operation, user_id, error = %msg, "Internal error");
            }
        }
    }
}

// ============================================================================
// 4. ERROR CONTEXT ENRICHMENT
// ============================================================================

/// Request-scoped context attached to the failure of a single operation
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub request_id: String,
    pub user_id: Option<String>,
    pub operation: &'static str,
}

impl ErrorContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            operation,
        }
    }

    /// Context reusing the `RequestId` assigned by `RequestLogger`
    pub fn for_request(req: &HttpRequest, operation: &'static str) -> Self {
        let request_id = req.extensions().get::<RequestId>().map(|id| id.0.clone());
        match request_id {
            Some(request_id) => Self {
                request_id,
                ..Self::new(operation)
            },
            None => Self::new(operation),
        }
    }

    pub fn with_user_id(mut self, user_id: impl ToString) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn fail(&self, error: AppError) -> RequestError {
        RequestError {
            context: self.clone(),
            error,
        }
    }
}

/// An `AppError` bound to the request it ended.
///
/// Logged exactly once, when actix renders the response; the body's
/// `errorId` and the `x-request-id` header carry the logged request id.
#[derive(Debug, thiserror::Error)]
#[error("{} failed: {}", .context.operation, .error)]
pub struct RequestError {
    pub context: ErrorContext,
    #[source]
    pub error: AppError,
}

impl ResponseError for RequestError {
    fn status_code(&self) -> StatusCode {
        self.error.status_code()
    }

    fn error_response(&self) -> HttpResponse {
        self.error.log_error(&self.context);

        let (status, error_response) = self.error.error_response(&self.context.request_id);

        HttpResponse::build(status)
            .insert_header((REQUEST_ID_HEADER, self.context.request_id.as_str()))
            .json(error_response)
    }
}
