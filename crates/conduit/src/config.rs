//! Execution context configuration
//!
//! Loaded from the `[context]` table of a TOML file, or built in code.
//! Every field is optional and falls back to its default.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Default delay between non-blocking wait attempts on a process whose
/// monitor closed before the kernel made it waitable.
pub const DEFAULT_WAIT_RETRY_DELAY_MS: u64 = 1000;

/// Default number of bytes requested per demand-driven read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;

/// Tunables for an execution [`Context`](crate::Context).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// Delay between stale-wait retries, in milliseconds (default: 1000)
    pub wait_retry_delay_ms: u64,
    /// Give up waiting after this many retries (default: unbounded)
    pub max_wait_retries: Option<u32>,
    /// Bytes requested per channel read (default: 8192)
    pub read_chunk_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            wait_retry_delay_ms: DEFAULT_WAIT_RETRY_DELAY_MS,
            max_wait_retries: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl ContextConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading context config at {}", path.display()))?;
        Self::from_toml_str(&text).context("parsing context config")
    }

    /// The stale-wait retry delay as a `Duration`.
    pub fn wait_retry_delay(&self) -> Duration {
        Duration::from_millis(self.wait_retry_delay_ms)
    }

    /// Read size, never zero.
    pub(crate) fn chunk_size(&self) -> usize {
        self.read_chunk_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContextConfig::from_toml_str("").unwrap();
        assert_eq!(config, ContextConfig::default());
        assert_eq!(config.wait_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.max_wait_retries, None);
    }

    #[test]
    fn test_partial_override() {
        let config = ContextConfig::from_toml_str(
            r#"
            wait_retry_delay_ms = 50
            max_wait_retries = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.wait_retry_delay_ms, 50);
        assert_eq!(config.max_wait_retries, Some(3));
        assert_eq!(config.read_chunk_size, DEFAULT_READ_CHUNK_SIZE);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(ContextConfig::from_toml_str("retry = 1").is_err());
    }

    #[test]
    fn test_zero_chunk_size_clamped() {
        let config = ContextConfig {
            read_chunk_size: 0,
            ..Default::default()
        };
        assert_eq!(config.chunk_size(), 1);
    }
}
