//! Broker configuration.
//!
//! Built from the `serve` command-line arguments (see
//! [`server::Args`](crate::server::Args)) and shared by the registry, the
//! sessions it spawns and the connection handlers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::history::HISTORY_CAPACITY;
use crate::rate_limit::{DEFAULT_CAPACITY, DEFAULT_REFILL_PER_SEC};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 30;
/// Sessions without viewers are reclaimed after this long without output.
pub const DEFAULT_IDLE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);
/// A viewer that sends nothing (not even a pong) for this long is dropped.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(60);

/// How a session reacts when its process exits.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Stay exited until deleted.
    Never,
    /// Respawn after `initial * 2^attempts`, capped at `max`.
    Backoff { initial: Duration, max: Duration },
}

impl RestartPolicy {
    /// Backoff used by the shared session: 500 ms doubling up to 30 s.
    pub fn backoff() -> Self {
        RestartPolicy::Backoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }

    /// Delay before the next respawn after `attempts` consecutive failures.
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        match *self {
            RestartPolicy::Never => None,
            RestartPolicy::Backoff { initial, max } => {
                let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
                Some(initial.saturating_mul(factor).min(max))
            }
        }
    }
}

/// What to run inside each pseudo-terminal and how.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShellConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory; `$HOME` when unset.
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell(),
            args: Vec::new(),
            cwd: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Token bucket settings applied to every connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_per_sec: DEFAULT_REFILL_PER_SEC,
        }
    }
}

/// WebSocket keep-alive settings.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub peer_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub shell: ShellConfig,
    pub rate_limit: RateLimitConfig,
    pub heartbeat: HeartbeatConfig,
    pub history_capacity: usize,
    pub idle_retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            shell: ShellConfig::default(),
            rate_limit: RateLimitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            history_capacity: HISTORY_CAPACITY,
            idle_retention: DEFAULT_IDLE_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Determines the user's preferred shell from `$SHELL`, falling back to
/// `/bin/bash`.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}
