//! Centralized error types for callq.
//!
//! Uses `thiserror` for the error definitions and exposes a stable error code
//! per variant for callers that report errors programmatically.

use crate::quality::QualityTier;

/// Core error type used across the callq crates.
#[derive(Debug, thiserror::Error)]
pub enum CallqError {
    // === Validation errors ===
    #[error("No threshold for quality {tier}")]
    MissingThreshold { tier: QualityTier },

    #[error("Unknown quality tier: {0}")]
    UnknownTier(String),

    // === Lifecycle errors ===
    #[error("Quality controller has been destroyed")]
    Destroyed,

    // === Infrastructure errors ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CallqError {
    /// Error code string for programmatic handling.
    pub fn error_code(&self) -> &str {
        match self {
            Self::MissingThreshold { .. } | Self::UnknownTier(_) => "VALIDATION_ERROR",
            Self::Destroyed => "DESTROYED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// Whether the error rejects caller-supplied input.
    pub fn is_validation(&self) -> bool {
        self.error_code() == "VALIDATION_ERROR"
    }
}

/// Convenience type alias for Results using CallqError.
pub type CallqResult<T> = Result<T, CallqError>;
