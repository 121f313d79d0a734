//! Security error model.

use thiserror::Error;

/// Result type used across the security layer.
pub type SecurityResult<T> = Result<T, SecurityError>;

/// Generic message shown for every authentication failure.
///
/// Wrong password, inactive account and unknown user all produce this text so
/// that a caller cannot enumerate accounts.
pub const AUTH_FAILED_MESSAGE: &str = "Invalid login. Please try again.";

/// Message shown when an activation link does not resolve.
pub const REGISTRATION_NOT_FOUND_MESSAGE: &str = "Registration not found.";

/// Message shown when the authorization evaluator refuses.
pub const ACCESS_DENIED_MESSAGE: &str = "Access is Denied";

/// Security-level error.
///
/// The first seven variants are the abstract kinds callers branch on; the
/// remaining three cover bad input, cipher failures and bad configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// The authorization evaluator refused the operation.
    #[error("{}", ACCESS_DENIED_MESSAGE)]
    AccessDenied,

    /// Credentials did not resolve to an active user.
    #[error("{}", AUTH_FAILED_MESSAGE)]
    AuthFailed,

    /// Uniqueness violation (username, email, registration hash, names).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Referential integrity violation.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// A requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// LDAP / OAuth / OpenID / mail subsystem failure.
    #[error("provider error: {0}")]
    Provider(String),

    /// Any other persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Encryption / decryption failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SecurityError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable machine-readable kind, used by transports for error codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AccessDenied => "access_denied",
            Self::AuthFailed => "auth_failed",
            Self::Conflict(_) => "conflict",
            Self::Integrity(_) => "integrity",
            Self::NotFound(_) => "not_found",
            Self::Provider(_) => "provider_error",
            Self::Storage(_) => "storage",
            Self::Validation(_) => "validation",
            Self::Crypto(_) => "crypto",
            Self::Config(_) => "config",
        }
    }
}
