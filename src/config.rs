//! Runtime configuration.
//!
//! Loaded from `<config dir>/island-realtime/config.json` when present, then
//! overridden by `ISLAND_*` environment variables. Every field has a default,
//! so an empty or missing file yields a working configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "island-realtime";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Seconds between clock-driven due-task sweeps.
    pub sweep_interval_secs: u64,
    /// Milliseconds between battle timer checks.
    pub battle_tick_millis: u64,
    pub progression: ProgressionConfig,
    pub battle: BattleConfig,
    pub retry: RetryPolicy,
    /// Outbound events buffered per connected identity before the oldest
    /// ones are dropped.
    pub outbox_capacity: usize,
    /// Inbound actions accepted per identity per second.
    pub actions_per_second: u32,
    /// Whether the gateway requires a session token and binds each channel
    /// to the player the token was issued to. Without it the channel trusts
    /// the `player_id` a client names, which is only fit for local use.
    pub require_session: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 2,
            battle_tick_millis: 1000,
            progression: ProgressionConfig::default(),
            battle: BattleConfig::default(),
            retry: RetryPolicy::default(),
            outbox_capacity: 256,
            actions_per_second: 20,
            require_session: true,
        }
    }
}

/// Rates and curves of the idle economy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressionConfig {
    pub mana_regen_per_sec: i64,
    /// Seconds a level 1 mine without gems needs per crystal.
    pub mine_period_secs: i64,
    /// Crystals a mine can hold per level before it stops producing.
    pub mine_capacity_per_level: i64,
    pub mine_task_secs: i64,
    pub mine_task_yield_per_level: i64,
    /// XP granted per reached level when a build or upgrade completes.
    pub xp_per_level: i64,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            mana_regen_per_sec: 1,
            mine_period_secs: 60,
            mine_capacity_per_level: 500,
            mine_task_secs: 300,
            mine_task_yield_per_level: 50,
            xp_per_level: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BattleConfig {
    pub players_per_battle: usize,
    pub grace_secs: i64,
    pub match_duration_secs: i64,
    pub altar_hp: i64,
    pub max_damage_per_action: i64,
    pub win_xp: i64,
    pub win_crystals: i64,
    pub loss_xp: i64,
    pub draw_xp: i64,
}

impl BattleConfig {
    pub fn grace(&self) -> Duration {
        Duration::seconds(self.grace_secs)
    }

    pub fn match_duration(&self) -> Duration {
        Duration::seconds(self.match_duration_secs)
    }
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            players_per_battle: 2,
            grace_secs: 30,
            match_duration_secs: 10 * 60,
            altar_hp: 1000,
            max_damage_per_action: 250,
            win_xp: 100,
            win_crystals: 250,
            loss_xp: 10,
            draw_xp: 25,
        }
    }
}

/// Bounded exponential backoff for commits that hit a transient store failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_millis: i64,
    pub max_millis: i64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before the retry that follows the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let millis = self.base_millis.saturating_mul(1_i64 << exp);
        Duration::milliseconds(millis.min(self.max_millis))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_millis: 1000,
            max_millis: 60_000,
            max_attempts: 5,
        }
    }
}

impl CoreConfig {
    /// Load configuration from `path`, or from the user's config directory when
    /// no path is given. Falls back to defaults if the file doesn't exist or
    /// fails to parse, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = match Self::try_load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config, using defaults: {:#}", e);
                Self::default()
            }
        };
        config.apply_env();
        config
    }

    fn try_load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => get_config_path()?,
        };
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config = serde_json::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_parse("ISLAND_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = v;
        }
        if let Some(v) = env_parse("ISLAND_BATTLE_GRACE_SECS") {
            self.battle.grace_secs = v;
        }
        if let Some(v) = env_parse("ISLAND_MATCH_DURATION_SECS") {
            self.battle.match_duration_secs = v;
        }
        if let Some(v) = env_parse("ISLAND_OUTBOX_CAPACITY") {
            self.outbox_capacity = v;
        }
        if let Some(v) = env_parse("ISLAND_REQUIRE_SESSION") {
            self.require_session = v;
        }
    }

    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn battle_tick(&self) -> StdDuration {
        StdDuration::from_millis(self.battle_tick_millis.max(10))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn get_config_path() -> Result<PathBuf> {
    let mut path =
        config_dir().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    path.push(APP_NAME);
    path.push(CONFIG_FILE);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_millis: 1000,
            max_millis: 5000,
            max_attempts: 5,
        };
        assert_eq!(policy.backoff(1), Duration::seconds(1));
        assert_eq!(policy.backoff(2), Duration::seconds(2));
        assert_eq!(policy.backoff(3), Duration::seconds(4));
        assert_eq!(policy.backoff(4), Duration::seconds(5));
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "battle": { "grace_secs": 5 } }"#).unwrap();

        let config = CoreConfig::try_load(Some(&path)).unwrap();
        assert_eq!(config.battle.grace_secs, 5);
        assert_eq!(config.battle.players_per_battle, 2);
        assert_eq!(config.sweep_interval_secs, 2);
        assert!(config.require_session);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::try_load(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config, CoreConfig::default());
    }
}
