//! Engine configuration loaded from environment variables.
//!
//! The matchmaking timings are empirical. They are all overridable so that
//! hosts can tune them without a rebuild.

use std::time::Duration;

use crate::constants::*;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a primary dial may stay unconfirmed before it is abandoned.
    /// Env: `PAIRCHAT_ATTEMPT_TIMEOUT_MS`
    /// Default: 5 s
    pub attempt_timeout: Duration,

    /// Matchmaker poll interval.
    /// Env: `PAIRCHAT_POLL_INTERVAL_MS`
    /// Default: 1 s
    pub poll_interval: Duration,

    /// Lower bound of the pre-dial jitter.
    /// Env: `PAIRCHAT_JITTER_MIN_MS`
    /// Default: 50 ms
    pub jitter_min: Duration,

    /// Upper bound of the pre-dial jitter (inclusive).
    /// Env: `PAIRCHAT_JITTER_MAX_MS`
    /// Default: 250 ms
    pub jitter_max: Duration,

    /// Period of the cooldown-set sweep.
    /// Env: `PAIRCHAT_COOLDOWN_CLEAR_MS`
    /// Default: 10 s
    pub cooldown_clear: Duration,

    /// Offline relay poll interval.
    /// Env: `PAIRCHAT_RELAY_POLL_MS`
    /// Default: 15 s
    pub relay_poll_interval: Duration,

    /// Lifetime of messages sent while vanish mode is on.
    /// Env: `PAIRCHAT_VANISH_MS`
    /// Default: 5 s
    pub vanish_after: Duration,

    /// Minimum spacing between friend lastSeen refreshes.
    /// Env: `PAIRCHAT_LAST_SEEN_DEBOUNCE_MS`
    /// Default: 60 s
    pub last_seen_debounce: Duration,

    /// Size of the recent-peers log.
    /// Env: `PAIRCHAT_RECENT_PEERS_LIMIT`
    /// Default: 50
    pub recent_peers_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(DEFAULT_ATTEMPT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            jitter_min: Duration::from_millis(DEFAULT_JITTER_MIN_MS),
            jitter_max: Duration::from_millis(DEFAULT_JITTER_MAX_MS),
            cooldown_clear: Duration::from_millis(DEFAULT_COOLDOWN_CLEAR_MS),
            relay_poll_interval: Duration::from_millis(DEFAULT_RELAY_POLL_MS),
            vanish_after: Duration::from_millis(DEFAULT_VANISH_MS),
            last_seen_debounce: Duration::from_millis(DEFAULT_LAST_SEEN_DEBOUNCE_MS),
            recent_peers_limit: DEFAULT_RECENT_PEERS_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let millis = |key: &str, slot: &mut Duration| {
            if let Some(val) = lookup(key) {
                match val.trim().parse::<u64>() {
                    Ok(ms) => *slot = Duration::from_millis(ms),
                    Err(_) => {
                        tracing::warn!(key, value = %val, "Invalid duration, using default");
                    }
                }
            }
        };

        millis("PAIRCHAT_ATTEMPT_TIMEOUT_MS", &mut config.attempt_timeout);
        millis("PAIRCHAT_POLL_INTERVAL_MS", &mut config.poll_interval);
        millis("PAIRCHAT_JITTER_MIN_MS", &mut config.jitter_min);
        millis("PAIRCHAT_JITTER_MAX_MS", &mut config.jitter_max);
        millis("PAIRCHAT_COOLDOWN_CLEAR_MS", &mut config.cooldown_clear);
        millis("PAIRCHAT_RELAY_POLL_MS", &mut config.relay_poll_interval);
        millis("PAIRCHAT_VANISH_MS", &mut config.vanish_after);
        millis("PAIRCHAT_LAST_SEEN_DEBOUNCE_MS", &mut config.last_seen_debounce);

        if let Some(val) = lookup("PAIRCHAT_RECENT_PEERS_LIMIT") {
            match val.trim().parse::<usize>() {
                Ok(n) => config.recent_peers_limit = n,
                Err(_) => {
                    tracing::warn!(
                        key = "PAIRCHAT_RECENT_PEERS_LIMIT",
                        value = %val,
                        "Invalid limit, using default"
                    );
                }
            }
        }

        if config.jitter_max < config.jitter_min {
            tracing::warn!(
                min = ?config.jitter_min,
                max = ?config.jitter_max,
                "Jitter bounds inverted, swapping"
            );
            std::mem::swap(&mut config.jitter_min, &mut config.jitter_max);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.jitter_min, Duration::from_millis(50));
        assert_eq!(config.jitter_max, Duration::from_millis(250));
        assert_eq!(config.recent_peers_limit, 50);
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("PAIRCHAT_ATTEMPT_TIMEOUT_MS", "1200"),
            ("PAIRCHAT_POLL_INTERVAL_MS", "fast"),
            ("PAIRCHAT_RECENT_PEERS_LIMIT", "10"),
        ]));
        assert_eq!(config.attempt_timeout, Duration::from_millis(1200));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.recent_peers_limit, 10);
    }

    #[test]
    fn test_invalid_recent_limit_keeps_default() {
        let config = EngineConfig::from_lookup(lookup(&[("PAIRCHAT_RECENT_PEERS_LIMIT", "lots")]));
        assert_eq!(config.recent_peers_limit, 50);
    }

    #[test]
    fn test_inverted_jitter_is_swapped() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("PAIRCHAT_JITTER_MIN_MS", "300"),
            ("PAIRCHAT_JITTER_MAX_MS", "100"),
        ]));
        assert_eq!(config.jitter_min, Duration::from_millis(100));
        assert_eq!(config.jitter_max, Duration::from_millis(300));
    }
}
