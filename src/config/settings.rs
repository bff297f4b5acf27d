// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Runtime settings, resolved from environment variables with defaults.
//!
//! Recognized variables:
//!
//! | variable | default | meaning |
//! |---|---|---|
//! | `MAX_ACTIVE_APIS` | 50 | worker cache capacity |
//! | `API_INACTIVE_TTL_HOURS` | 2 | idle threshold for reaping |
//! | `WORKER_CLEANUP_INTERVAL_MINUTES` | 30 | reaper tick |
//! | `WORKER_STATS_INTERVAL_MINUTES` | 60 | stats log tick |
//! | `DISPATCH_TIMEOUT_SECONDS` | unset | per-request execution timeout |
//! | `TABLEFLOW_BIND_ADDR` | `0.0.0.0:8001` | listen address |

use std::str::FromStr;
use std::time::Duration;

use super::consts::{
    DEFAULT_BIND_ADDR, DEFAULT_CLEANUP_INTERVAL_MINUTES, DEFAULT_INACTIVE_TTL_HOURS,
    DEFAULT_MAX_ACTIVE_WORKERS, DEFAULT_STATS_INTERVAL_MINUTES,
};
use crate::worker::WorkerSettings;

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub max_active_workers: usize,
    pub inactive_ttl: Duration,
    pub cleanup_interval: Duration,
    pub stats_interval: Duration,
    pub dispatch_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_active_workers: DEFAULT_MAX_ACTIVE_WORKERS,
            inactive_ttl: Duration::from_secs(DEFAULT_INACTIVE_TTL_HOURS * 3600),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_MINUTES * 60),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_MINUTES * 60),
            dispatch_timeout: None,
        }
    }
}

impl Settings {
    /// Resolve settings from the process environment.
    pub fn from_env() -> Settings {
        Settings::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings from an arbitrary lookup; unparseable values fall
    /// back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Settings {
        let defaults = Settings::default();
        Settings {
            bind_addr: lookup("TABLEFLOW_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_active_workers: parsed(
                &lookup,
                "MAX_ACTIVE_APIS",
                DEFAULT_MAX_ACTIVE_WORKERS,
            ),
            inactive_ttl: Duration::from_secs(
                parsed(&lookup, "API_INACTIVE_TTL_HOURS", DEFAULT_INACTIVE_TTL_HOURS) * 3600,
            ),
            cleanup_interval: Duration::from_secs(
                parsed(
                    &lookup,
                    "WORKER_CLEANUP_INTERVAL_MINUTES",
                    DEFAULT_CLEANUP_INTERVAL_MINUTES,
                ) * 60,
            ),
            stats_interval: Duration::from_secs(
                parsed(
                    &lookup,
                    "WORKER_STATS_INTERVAL_MINUTES",
                    DEFAULT_STATS_INTERVAL_MINUTES,
                ) * 60,
            ),
            dispatch_timeout: lookup("DISPATCH_TIMEOUT_SECONDS")
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(Duration::from_secs),
        }
    }

    /// The worker manager's view of these settings.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            max_active_workers: self.max_active_workers,
            inactive_ttl: self.inactive_ttl,
            cleanup_interval: self.cleanup_interval,
            stats_interval: self.stats_interval,
        }
    }
}

fn parsed<T: FromStr + Copy>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparseable setting, using default");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.max_active_workers, 50);
        assert_eq!(settings.inactive_ttl, Duration::from_secs(2 * 3600));
        assert_eq!(settings.cleanup_interval, Duration::from_secs(30 * 60));
        assert_eq!(settings.stats_interval, Duration::from_secs(60 * 60));
        assert!(settings.dispatch_timeout.is_none());
    }

    #[test]
    fn lookup_overrides_and_bad_values_fall_back() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MAX_ACTIVE_APIS", "3"),
            ("API_INACTIVE_TTL_HOURS", "1"),
            ("WORKER_CLEANUP_INTERVAL_MINUTES", "not-a-number"),
            ("DISPATCH_TIMEOUT_SECONDS", "15"),
        ]);
        let settings = Settings::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(settings.max_active_workers, 3);
        assert_eq!(settings.inactive_ttl, Duration::from_secs(3600));
        assert_eq!(settings.cleanup_interval, Duration::from_secs(30 * 60));
        assert_eq!(settings.dispatch_timeout, Some(Duration::from_secs(15)));
    }
}
