//! Tracing subscriber setup
//!
//! The library only emits `tracing` events; hosts that don't install their own
//! subscriber can call [`init`] once at startup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Filter used when the configured one doesn't parse
const FALLBACK_FILTER: &str = "info";

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, e.g. `info` or `parlor_client::voice=debug`
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit one JSON object per line instead of human readable text
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    FALLBACK_FILTER.to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// Install a global fmt subscriber
///
/// Returns `false` if a global subscriber was already installed, in which case
/// the existing one is left untouched.
pub fn init(settings: &LoggingSettings) -> bool {
    let filter =
        EnvFilter::try_new(&settings.level).unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER));

    if settings.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    }
}
