//! Throttler configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > callq.toml > defaults
//!
//! The loaded value is owned by whoever loads it and handed to each quality
//! controller; nothing here is process-global.

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError};
use serde::Deserialize;
use std::time::Duration;

use crate::error::CallqResult;
use crate::quality::ThresholdTable;

/// Default time high quality is kept after the local participant stops speaking.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5_000;

/// Load the throttler configuration.
///
/// Environment variables use the `CALLQ_` prefix and `__` between nested
/// keys, e.g. `CALLQ_GRACE_PERIOD_MS=3000` or
/// `CALLQ_AVAILABLE_VIDEOS_THRESHOLD__3=5`. Threshold entries are keyed by
/// tier number (`3` is MEDIUM), the same form as on the wire; an entry keyed
/// by name collides with the default for that tier and fails to load.
pub fn load() -> CallqResult<ThrottleConfig> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = with_defaults(config::Config::builder())?
        // Optional config file
        .add_source(config::File::with_name("callq").required(false))
        .add_source(
            config::Environment::with_prefix("CALLQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    from_config(cfg)
}

/// Register the built-in defaults on a config builder.
///
/// Threshold defaults live under the tier number, e.g.
/// `available_videos_threshold.3`.
pub fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let mut builder = builder.set_default("grace_period_ms", DEFAULT_GRACE_PERIOD_MS as i64)?;

    let tables = [
        ("available_videos_threshold", ThresholdTable::default_available_videos()),
        ("available_audios_threshold", ThresholdTable::default_available_audios()),
    ];
    for (key, table) in tables {
        for tier in crate::quality::QualityTier::ALL {
            if let Some(count) = table.get(tier) {
                let path = format!("{key}.{}", tier.as_u8());
                builder = builder.set_default(path, count as i64)?;
            }
        }
    }

    Ok(builder)
}

/// Deserialize and validate a built config.
pub fn from_config(cfg: config::Config) -> CallqResult<ThrottleConfig> {
    let throttle: ThrottleConfig = cfg.try_deserialize()?;
    throttle.available_videos_threshold.validate()?;
    throttle.available_audios_threshold.validate()?;
    Ok(throttle)
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Milliseconds high quality is kept after speaking stops.
    pub grace_period_ms: u64,
    pub available_videos_threshold: ThresholdTable,
    pub available_audios_threshold: ThresholdTable,
}

impl ThrottleConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            available_videos_threshold: ThresholdTable::default_available_videos(),
            available_audios_threshold: ThresholdTable::default_available_audios(),
        }
    }
}
