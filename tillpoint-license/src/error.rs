//! Error types for the licensing engine.

use thiserror::Error;

/// Licensing-specific errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// No activation record exists on this machine.
    #[error("no active license on this machine")]
    NoActiveLicense,

    /// Network failure or timeout talking to the license server.
    /// Recoverable through the offline grace period.
    #[error("network error: {0}")]
    Network(String),

    /// The server explicitly revoked this license. Never recoverable
    /// through the grace period; the activation is torn down immediately.
    #[error("license has been revoked{}", reason_suffix(.0))]
    Revoked(Option<String>),

    /// The server rejected the key or device.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Local persistence failure. Fatal to the calling operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(": {r}"),
        None => String::new(),
    }
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
