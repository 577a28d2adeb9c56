//! Daemon tunables from the environment
//!
//! - UVAR_SYNC_EVERY (updates between saves, default 16)
//! - UVAR_EXIT_WHEN_IDLE (exit once the last client leaves, default true)
//! - UVAR_POLL_MS (longest single wait in the main loop, default 1000)

use std::env;
use std::time::Duration;

const DEFAULT_SYNC_EVERY: usize = 16;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Daemon behaviour knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Persist after this many applied updates
    pub sync_every: usize,
    /// Exit when no clients remain, after at least one has connected
    pub exit_when_idle: bool,
    /// Upper bound on one wait for activity; also how quickly a shutdown
    /// request is noticed
    pub poll_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sync_every: DEFAULT_SYNC_EVERY,
            exit_when_idle: true,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unparsable values keep
    /// their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("UVAR_SYNC_EVERY") {
            if let Ok(n) = val.trim().parse::<usize>() {
                config.sync_every = n.max(1);
            }
        }

        if let Some(val) = lookup("UVAR_EXIT_WHEN_IDLE") {
            config.exit_when_idle = !matches!(val.to_lowercase().as_str(), "0" | "false" | "no" | "off");
        }

        if let Some(val) = lookup("UVAR_POLL_MS") {
            if let Ok(ms) = val.trim().parse::<u64>() {
                config.poll_timeout = Duration::from_millis(ms.clamp(10, 60_000));
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::from_lookup(|_| None);
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.sync_every, 16);
        assert!(config.exit_when_idle);
    }

    #[test]
    fn test_overrides() {
        let config = DaemonConfig::from_lookup(lookup_in(&[
            ("UVAR_SYNC_EVERY", "4"),
            ("UVAR_EXIT_WHEN_IDLE", "off"),
            ("UVAR_POLL_MS", "50"),
        ]));
        assert_eq!(config.sync_every, 4);
        assert!(!config.exit_when_idle);
        assert_eq!(config.poll_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = DaemonConfig::from_lookup(lookup_in(&[
            ("UVAR_SYNC_EVERY", "lots"),
            ("UVAR_POLL_MS", "0"),
        ]));
        assert_eq!(config.sync_every, 16);
        assert_eq!(config.poll_timeout, Duration::from_millis(10));

        let config = DaemonConfig::from_lookup(lookup_in(&[("UVAR_SYNC_EVERY", "0")]));
        assert_eq!(config.sync_every, 1);
    }
}
