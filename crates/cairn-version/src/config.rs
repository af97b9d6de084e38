use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hex characters available from one BLAKE3 digest.
const DIGEST_HEX_LEN: usize = 64;

/// Version storage tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    /// Directory levels between a storage root and a history or activity.
    pub fanout_depth: usize,
    /// Hex characters of the id hash used per directory level.
    pub fanout_width: usize,
    /// Bound on waiting for the write lock. `None` waits forever.
    pub lock_timeout_ms: Option<u64>,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            fanout_depth: 3,
            fanout_width: 2,
            lock_timeout_ms: None,
        }
    }
}

impl VersioningConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Depth and width clamped so the directory names fit in one digest.
    pub(crate) fn fanout(&self) -> (usize, usize) {
        let width = self.fanout_width.clamp(1, DIGEST_HEX_LEN);
        let depth = self.fanout_depth.min(DIGEST_HEX_LEN / width);
        (depth, width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = VersioningConfig::default();
        assert_eq!(config.fanout(), (3, 2));
        assert_eq!(config.lock_timeout(), None);
    }

    #[test]
    fn from_toml() {
        let config: VersioningConfig =
            toml::from_str("fanout_depth = 2\nlock_timeout_ms = 250").unwrap();
        assert_eq!(config.fanout(), (2, 2));
        assert_eq!(config.lock_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn oversized_fanout_is_clamped() {
        let config = VersioningConfig {
            fanout_depth: 40,
            fanout_width: 8,
            lock_timeout_ms: None,
        };
        assert_eq!(config.fanout(), (8, 8));
    }
}
