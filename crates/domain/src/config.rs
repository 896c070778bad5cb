//! Engine configuration. Every field has a serde default so a partial
//! (or empty) TOML table deserializes to a working config.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub state: StateConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline applied to synchronous tool dispatches that do not carry
    /// their own timeout.
    #[serde(default = "d_120000")]
    pub sync_tool_timeout_ms: u64,
    /// Hard cap on moves per turn; exceeding it fails the turn.
    #[serde(default = "d_25")]
    pub max_moves_per_turn: u32,
    /// Mailbox depth per conversation actor.
    #[serde(default = "d_64")]
    pub mailbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_tool_timeout_ms: 120_000,
            max_moves_per_turn: 25,
            mailbox_capacity: 64,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Applied to dispatches whose tool definition carries no retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_1")]
    pub max_attempts: u32,
    #[serde(default = "d_30000")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 30_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State / journal location
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateConfig {
    /// Directory for per-conversation journals. `None` keeps state in
    /// memory only (tests, embedded use).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn d_120000() -> u64 {
    120_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_25() -> u32 {
    25
}
fn d_64() -> usize {
    64
}
fn d_1() -> u32 {
    1
}
