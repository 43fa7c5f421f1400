//! Error taxonomy. Each component boundary gets a precise `thiserror` enum;
//! everything upstream of that boundary composes into `anyhow::Error`.

use thiserror::Error;

/// Errors raised by the bridge client.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("network error during {operation}: {cause}")]
    Network { operation: String, cause: String },

    #[error("timeout during {operation} after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("bridge rejected {operation} (4xx, status {status}): {cause}")]
    Http4xx {
        operation: String,
        status: u16,
        cause: String,
    },

    #[error("bridge server error on {operation} (5xx, status {status}): {cause}")]
    Http5xx {
        operation: String,
        status: u16,
        cause: String,
    },

    #[error("validation failed for {operation}: {cause}")]
    Validation { operation: String, cause: String },

    #[error("protocol violation during {operation}: {cause}")]
    Protocol { operation: String, cause: String },
}

impl BridgeError {
    /// `kind` discriminant naming the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Network { .. } => "network",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::Http4xx { .. } => "http_4xx",
            BridgeError::Http5xx { .. } => "http_5xx",
            BridgeError::Validation { .. } => "validation",
            BridgeError::Protocol { .. } => "protocol",
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            BridgeError::Network { operation, .. }
            | BridgeError::Timeout { operation, .. }
            | BridgeError::Http4xx { operation, .. }
            | BridgeError::Http5xx { operation, .. }
            | BridgeError::Validation { operation, .. }
            | BridgeError::Protocol { operation, .. } => operation,
        }
    }

    /// network | timeout | http_5xx are retryable; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Network { .. } | BridgeError::Timeout { .. } | BridgeError::Http5xx { .. }
        )
    }
}

/// Errors raised by the user store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("user not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the registration engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("name cannot be empty")]
    Empty,
    #[error("name cannot be all digits")]
    AllDigits,
    #[error("name must be between {min} and {max} characters")]
    Length { min: usize, max: usize },
    #[error("name contains invalid characters")]
    InvalidChars,
    #[error("name cannot be a phone number")]
    IsPhoneNumber,
    #[error("name contains a forbidden word")]
    ForbiddenWord,
    #[error("registration has expired")]
    Expired,
}

/// Errors raised by the configuration service.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {cause}")]
    Read { path: String, cause: String },

    #[error("failed to parse config file {path}: {cause}")]
    Parse { path: String, cause: String },

    #[error("invalid config path: {0}")]
    InvalidPath(String),

    #[error("config validation failed: {0}")]
    Invalid(String),
}

/// Top-level processing error surfaced by the processor. Not every variant
/// is fatal to the pipeline — see `processor.rs` for propagation policy.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("structural validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("rate limited")]
    RateLimited,

    #[error("permission denied")]
    PermissionDenied,

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("processing timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("internal error: {0}")]
    Internal(String),
}
