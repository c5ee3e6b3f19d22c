//! Error types for the Turnstile admission engine.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
///
/// Per-request store failures never surface through this type; they are
/// resolved by the admission middleware according to the policy's
/// fail-open flag. This type covers startup and wiring failures.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid policy, tier table or service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors raised while wiring up a backend
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
