//! Gameplay tuning shared by every peer in a room.
//!
//! Values come from an optional TOML file and fall back to defaults for any
//! missing key. Everything is clamped to a sane range after loading.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Length of a fragment's damage window after launch.
    pub damage_window_secs: f32,
    /// Share of max health a fragment takes from a combatant, in percent.
    pub damage_percent: u32,
    pub whole_lifetime_secs: f32,
    pub half_lifetime_secs: f32,
    pub quarter_lifetime_secs: f32,
    pub fragment_speed: f32,

    /// Humans plus bots the master keeps in the room.
    pub bot_capacity: usize,
    /// Hand each new bot to the least-loaded human peer.
    pub distribute_bots: bool,
    pub spawn_attempts: u32,
    pub spawn_backoff_secs: f32,
    pub spawn_clearance: f32,

    pub join_attempts: u32,
    pub join_backoff_secs: f32,

    pub body_refill_interval_secs: f32,
    pub target_bodies: usize,
    pub body_radius: f32,

    pub player_max_health: u32,
    pub bot_max_health: u32,
    pub drone_max_health: u32,
    pub combatant_radius: f32,

    pub world_width: f32,
    pub world_height: f32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            damage_window_secs: 2.0,
            damage_percent: 20,
            whole_lifetime_secs: 120.0,
            half_lifetime_secs: 8.0,
            quarter_lifetime_secs: 6.0,
            fragment_speed: 90.0,
            bot_capacity: 10,
            distribute_bots: false,
            spawn_attempts: 10,
            spawn_backoff_secs: 0.25,
            spawn_clearance: 120.0,
            join_attempts: 5,
            join_backoff_secs: 1.0,
            body_refill_interval_secs: 15.0,
            target_bodies: 3,
            body_radius: 64.0,
            player_max_health: 100,
            bot_max_health: 100,
            drone_max_health: 30,
            combatant_radius: 16.0,
            world_width: 2000.0,
            world_height: 2000.0,
        }
    }
}

impl GameConfig {
    /// Loads the config at `path`, or the defaults when no file exists.
    pub fn load(path: Option<&Path>) -> Result<GameConfig, ConfigError> {
        let Some(path) = path else {
            return Ok(GameConfig::default());
        };
        if !path.is_file() {
            return Ok(GameConfig::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<GameConfig, ConfigError> {
        let parsed: GameConfig = toml::from_str(text)?;
        Ok(parsed.clamped())
    }

    fn clamped(mut self) -> Self {
        self.damage_window_secs = self.damage_window_secs.clamp(0.1, 30.0);
        self.damage_percent = self.damage_percent.clamp(1, 100);
        self.whole_lifetime_secs = self.whole_lifetime_secs.max(1.0);
        self.half_lifetime_secs = self.half_lifetime_secs.max(0.5);
        self.quarter_lifetime_secs = self.quarter_lifetime_secs.max(0.5);
        self.spawn_attempts = self.spawn_attempts.clamp(1, 100);
        self.spawn_backoff_secs = self.spawn_backoff_secs.max(0.0);
        self.spawn_clearance = self.spawn_clearance.max(0.0);
        self.join_attempts = self.join_attempts.clamp(1, 50);
        self.join_backoff_secs = self.join_backoff_secs.max(0.0);
        self.body_refill_interval_secs = self.body_refill_interval_secs.max(1.0);
        self.player_max_health = self.player_max_health.max(1);
        self.bot_max_health = self.bot_max_health.max(1);
        self.drone_max_health = self.drone_max_health.max(1);
        self.world_width = self.world_width.max(100.0);
        self.world_height = self.world_height.max(100.0);
        self
    }

    pub fn damage_window(&self) -> Duration {
        Duration::from_secs_f32(self.damage_window_secs)
    }

    pub fn whole_lifetime(&self) -> Duration {
        Duration::from_secs_f32(self.whole_lifetime_secs)
    }

    pub fn half_lifetime(&self) -> Duration {
        Duration::from_secs_f32(self.half_lifetime_secs)
    }

    pub fn quarter_lifetime(&self) -> Duration {
        Duration::from_secs_f32(self.quarter_lifetime_secs)
    }

    pub fn spawn_backoff(&self) -> Duration {
        Duration::from_secs_f32(self.spawn_backoff_secs)
    }

    pub fn join_backoff(&self) -> Duration {
        Duration::from_secs_f32(self.join_backoff_secs)
    }

    pub fn body_refill_interval(&self) -> Duration {
        Duration::from_secs_f32(self.body_refill_interval_secs)
    }
}
