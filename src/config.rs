//! Configuration loading from environment variables.
//!
//! Uses the following environment variables (all optional):
//! - `CAIRN_VISIBILITY_MARGIN_SECS`: Extra visibility headroom added to the
//!   resolved task timeout when tasks are claimed (default: 2)
//! - `CAIRN_READ_BATCH_SIZE`: Messages to request per queue read (default:
//!   num_cpus * 2)
//! - `CAIRN_POLL_INTERVAL_MS`: Queue poll interval (default: 100)
//! - `CAIRN_MAX_POLL_SECONDS`: Queue poll time budget (default: 5)

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::model::{Flow, Step};

/// Flow-level defaults applied by `create_flow` when no value is given.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const DEFAULT_BASE_DELAY: i32 = 1;
pub const DEFAULT_TIMEOUT: i32 = 60;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Extra seconds added on top of the resolved task timeout when
    /// extending message visibility at claim time.
    pub visibility_margin_secs: i64,

    /// Messages to request per queue read.
    pub read_batch_size: usize,

    /// Queue poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Queue poll time budget in seconds.
    pub max_poll_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            visibility_margin_secs: 2,
            read_batch_size: num_cpus::get().max(1) * 2,
            poll_interval_ms: 100,
            max_poll_seconds: 5,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` if present. Unset variables fall back to defaults;
    /// set-but-unparsable variables are an error.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        Ok(Self {
            visibility_margin_secs: env_or(
                "CAIRN_VISIBILITY_MARGIN_SECS",
                defaults.visibility_margin_secs,
            )?,
            read_batch_size: env_or("CAIRN_READ_BATCH_SIZE", defaults.read_batch_size)?,
            poll_interval_ms: env_or("CAIRN_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            max_poll_seconds: env_or("CAIRN_MAX_POLL_SECONDS", defaults.max_poll_seconds)?,
        })
    }

    /// Create a test configuration with a tight poll budget.
    pub fn test_config() -> Self {
        Self {
            visibility_margin_secs: 2,
            read_batch_size: 10,
            poll_interval_ms: 10,
            max_poll_seconds: 1,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

// ============================================================================
// Layered per-step configuration
// ============================================================================

/// Effective runtime settings for one step: step-level overrides merged over
/// flow-level defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub max_attempts: i32,
    pub base_delay: i32,
    pub timeout: i32,
    pub start_delay: i32,
}

impl EffectiveConfig {
    pub fn resolve(step: &Step, flow: &Flow) -> Self {
        Self {
            max_attempts: step.opt_max_attempts.unwrap_or(flow.opt_max_attempts),
            base_delay: step.opt_base_delay.unwrap_or(flow.opt_base_delay),
            timeout: step.opt_timeout.unwrap_or(flow.opt_timeout),
            start_delay: step.opt_start_delay.unwrap_or(0),
        }
    }
}
