//! Named retry configurations.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::RetryConfig;
use crate::error::Error;

/// Preset retry configurations, selectable by name in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPreset {
    /// Few quick attempts, for interactive use
    Fast,
    /// Balanced
    #[default]
    Default,
    /// Many attempts over two minutes, for snapshot capture on busy clusters
    Patient,
}

impl RetryPreset {
    /// All presets, in increasing patience
    pub const ALL: [RetryPreset; 3] = [RetryPreset::Fast, RetryPreset::Default, RetryPreset::Patient];

    /// The configuration this preset stands for
    pub fn config(self) -> RetryConfig {
        let (max_attempts, base_ms, max_delay_ms, deadline_ms) = match self {
            RetryPreset::Fast => (3, 50, 1_000, 5_000),
            RetryPreset::Default => (5, 200, 5_000, 30_000),
            RetryPreset::Patient => (10, 500, 15_000, 120_000),
        };
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(max_delay_ms),
            deadline: Some(Duration::from_millis(deadline_ms)),
            jitter: 0.2,
        }
    }

    /// Name used in configuration
    pub fn as_str(self) -> &'static str {
        match self {
            RetryPreset::Fast => "fast",
            RetryPreset::Default => "default",
            RetryPreset::Patient => "patient",
        }
    }
}

impl From<RetryPreset> for RetryConfig {
    fn from(preset: RetryPreset) -> Self {
        preset.config()
    }
}

impl fmt::Display for RetryPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RetryPreset::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                Error::config(format!(
                    "unknown retry preset '{}': expected fast, default or patient",
                    s
                ))
            })
    }
}
