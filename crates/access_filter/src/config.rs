//! Runtime settings for the access filter.
//!
//! These are fixed for the life of an [`AccessFilter`](crate::AccessFilter);
//! the reloadable part of the configuration is the rule document,
//! [`RuleConfig`](crate::RuleConfig).

use crate::guard::GuardConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_lookup_timeout_ms() -> u64 {
    50
}

fn default_max_pending_lookups() -> usize {
    256
}

fn default_event_buffer() -> usize {
    1024
}

/// Access filter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Whether decisions are cached at all
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Maximum number of cached decisions
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    /// Lifetime of a cached decision in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Budget for one geolocation lookup in milliseconds (0 runs it inline, unbounded)
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    /// Bounded lookups allowed in flight at once, stalled ones included
    #[serde(default = "default_max_pending_lookups")]
    pub max_pending_lookups: usize,
    /// Clear cached decisions whenever a new rule set is installed
    #[serde(default)]
    pub flush_on_reload: bool,
    /// Capacity of the decision event queue
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Connection flood protection
    #[serde(default)]
    pub guard: GuardConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            cache_enabled: default_cache_enabled(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            max_pending_lookups: default_max_pending_lookups(),
            flush_on_reload: false,
            event_buffer: default_event_buffer(),
            guard: GuardConfig::default(),
        }
    }
}

impl FilterConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// `None` when lookups are not time-bounded.
    pub fn lookup_timeout(&self) -> Option<Duration> {
        (self.lookup_timeout_ms > 0).then(|| Duration::from_millis(self.lookup_timeout_ms))
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_enabled && self.cache_capacity == 0 {
            return Err("filter.cache_capacity must be greater than 0 when the cache is enabled".to_string());
        }

        if self.lookup_timeout_ms > 0 && self.max_pending_lookups == 0 {
            return Err("filter.max_pending_lookups must be greater than 0 when lookups are time-bounded".to_string());
        }

        if self.event_buffer == 0 {
            return Err("filter.event_buffer must be greater than 0".to_string());
        }

        let guard = &self.guard;
        if guard.enabled {
            if guard.max_connections_per_second == 0 {
                return Err("filter.guard.max_connections_per_second must be greater than 0".to_string());
            }
            if guard.max_attempts_per_ip == 0 {
                return Err("filter.guard.max_attempts_per_ip must be greater than 0".to_string());
            }
            if guard.perm_block_threshold == 0 {
                return Err("filter.guard.perm_block_threshold must be greater than 0".to_string());
            }
        }

        Ok(())
    }
}
