//! # callq-common
//!
//! Shared vocabulary for the callq crates:
//! - Quality tiers and the constraints each tier maps to
//! - Threshold tables (peer counts that trigger throttling)
//! - Error types
//! - Configuration loading

pub mod config;
pub mod error;
pub mod quality;

pub use error::{CallqError, CallqResult};
pub use quality::{QualityTier, ThresholdTable, VideoConstraints};
