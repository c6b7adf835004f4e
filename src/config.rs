//! Runtime configuration.
//!
//! Stable config names match spec 6 exactly. Loaded from environment
//! variables with `dotenv`-sourced overrides, the same layering the teacher
//! uses in `models::Config::from_env`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scraper_cb_threshold: u32,
    pub scraper_cb_cooldown_ms: u64,
    pub volatile_poll_interval_ms: u64,
    pub max_parallel_per_pool: usize,
    pub default_max_events_per_hour: u32,
    pub database_path: String,
    pub health_flush_interval_ms: u64,
    pub scheduler_tick_ms: u64,
    pub lease_sweep_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scraper_cb_threshold: 3,
            scraper_cb_cooldown_ms: 900_000,
            volatile_poll_interval_ms: 45_000,
            max_parallel_per_pool: 6,
            default_max_events_per_hour: 20,
            database_path: "./ingestord.db".to_string(),
            health_flush_interval_ms: 5_000,
            scheduler_tick_ms: 1_000,
            lease_sweep_interval_ms: 30_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();
        let mut c = Config::default();

        if let Ok(v) = std::env::var("SCRAPER_CB_THRESHOLD") {
            c.scraper_cb_threshold = v.parse().unwrap_or(c.scraper_cb_threshold);
        }
        if let Ok(v) = std::env::var("SCRAPER_CB_COOLDOWN_MS") {
            c.scraper_cb_cooldown_ms = v.parse().unwrap_or(c.scraper_cb_cooldown_ms);
        }
        if let Ok(v) = std::env::var("VOLATILE_POLL_INTERVAL_MS") {
            c.volatile_poll_interval_ms = v.parse().unwrap_or(c.volatile_poll_interval_ms);
        }
        if let Ok(v) = std::env::var("MAX_PARALLEL_PER_POOL") {
            c.max_parallel_per_pool = v.parse().unwrap_or(c.max_parallel_per_pool);
        }
        if let Ok(v) = std::env::var("DEFAULT_MAX_EVENTS_PER_HOUR") {
            c.default_max_events_per_hour = v.parse().unwrap_or(c.default_max_events_per_hour);
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            c.database_path = v;
        }
        if let Ok(v) = std::env::var("HEALTH_FLUSH_INTERVAL_MS") {
            c.health_flush_interval_ms = v.parse().unwrap_or(c.health_flush_interval_ms);
        }
        if let Ok(v) = std::env::var("SCHEDULER_TICK_MS") {
            c.scheduler_tick_ms = v.parse().unwrap_or(c.scheduler_tick_ms);
        }
        if let Ok(v) = std::env::var("LEASE_SWEEP_INTERVAL_MS") {
            c.lease_sweep_interval_ms = v.parse().unwrap_or(c.lease_sweep_interval_ms);
        }

        c
    }

    pub fn cb_cooldown(&self) -> Duration {
        Duration::from_millis(self.scraper_cb_cooldown_ms)
    }

    pub fn health_flush_interval(&self) -> Duration {
        Duration::from_millis(self.health_flush_interval_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn lease_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lease_sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.scraper_cb_threshold, 3);
        assert_eq!(c.scraper_cb_cooldown_ms, 900_000);
        assert_eq!(c.max_parallel_per_pool, 6);
        assert_eq!(c.default_max_events_per_hour, 20);
    }
}
