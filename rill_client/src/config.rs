//! Client configuration.

use core::num;

use rill_utils::SmootherConfig;
use serde::Deserialize;

/// Maximum time to wait for a reply before a request fails with a timeout.
pub const DEFAULT_REPLY_TIMEOUT_USEC: u64 = 30_000_000;

/// Period of automatic timing refreshes.
pub const DEFAULT_AUTO_TIMING_INTERVAL_USEC: u64 = 333_000;

/// Tunables of a [`Context`](crate::Context) and the streams it owns.
///
/// Every field has a default, so a configuration file only needs to name
/// the values it changes:
///
/// ```toml
/// default_sink = "speakers"
/// reply_timeout_usec = 5000000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Device playback streams bind to when none is named.
    pub default_sink: Option<String>,
    /// Device record streams bind to when none is named.
    pub default_source: Option<String>,
    pub reply_timeout_usec: u64,
    pub auto_timing_interval_usec: u64,
    pub smoother_adjust_usec: u64,
    pub smoother_history_usec: u64,
    pub smoother_min_history: usize,
    /// Largest memory block handed to the transport.
    pub block_size_max: num::NonZeroUsize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let smoother = SmootherConfig::default();

        Self {
            default_sink: None,
            default_source: None,
            reply_timeout_usec: DEFAULT_REPLY_TIMEOUT_USEC,
            auto_timing_interval_usec: DEFAULT_AUTO_TIMING_INTERVAL_USEC,
            smoother_adjust_usec: smoother.adjust_usec,
            smoother_history_usec: smoother.history_usec,
            smoother_min_history: smoother.min_history,
            block_size_max: rill_utils::HeapPool::DEFAULT_BLOCK_SIZE_MAX,
        }
    }
}

impl ClientConfig {
    /// Parses a configuration from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    #[inline]
    pub fn smoother(&self, monotonic: bool) -> SmootherConfig {
        SmootherConfig {
            adjust_usec: self.smoother_adjust_usec,
            history_usec: self.smoother_history_usec,
            min_history: self.smoother_min_history,
            monotonic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            default_source = "mic"
            auto_timing_interval_usec = 100000
            "#,
        )
        .unwrap();

        assert_eq!(config.default_source.as_deref(), Some("mic"));
        assert_eq!(config.auto_timing_interval_usec, 100_000);
        assert_eq!(config.reply_timeout_usec, DEFAULT_REPLY_TIMEOUT_USEC);
        assert_eq!(config.default_sink, None);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(ClientConfig::from_toml_str("block_size_max = 0").is_err());
    }
}
