//! RUNSTR core configuration
//!
//! Every section has working defaults; a TOML file only needs the keys it
//! overrides.

use crate::error::{CoreError, Result};
use crate::groups::NoRecordPolicy;
use nostr_client::{ExponentialBackoff, Jitter};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub relays: RelayConfig,
    pub fetch: FetchConfig,
    pub feed: FeedConfig,
    pub scheduler: SchedulerConfig,
    pub membership: MembershipConfig,
}

impl CoreConfig {
    /// Parse configuration from TOML text. An empty document yields defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }
}

/// Relay set and connection waiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Relays used when a request carries no hints
    pub urls: Vec<String>,
    /// Longest a caller waits for newly added relays to connect
    pub ensure_grace_ms: u64,
    /// Relays required before `wait_for_connected` succeeds
    pub min_connected: usize,
    pub wait_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            urls: nostr_client::DEFAULT_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ensure_grace_ms: 50,
            min_connected: 1,
            wait_timeout_ms: 8_000,
        }
    }
}

impl RelayConfig {
    pub fn ensure_grace(&self) -> Duration {
        Duration::from_millis(self.ensure_grace_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Dual-path fetch budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchConfig {
    /// Budget for the pooled path before falling back
    pub pooled_budget_ms: u64,
    /// Default end-to-end budget of a fetch
    pub overall_timeout_ms: u64,
    /// Per-relay budget of the raw path
    pub raw_relay_timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            pooled_budget_ms: 4_000,
            overall_timeout_ms: 8_000,
            raw_relay_timeout_ms: 5_000,
        }
    }
}

impl FetchConfig {
    pub fn pooled_budget(&self) -> Duration {
        Duration::from_millis(self.pooled_budget_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    pub fn raw_relay_timeout(&self) -> Duration {
        Duration::from_millis(self.raw_relay_timeout_ms)
    }
}

/// Feed cache, loader and background refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedConfig {
    pub cache_ttl_secs: u64,
    /// How far back the initial load looks
    pub window_days: u64,
    pub hashtag: String,
    pub initial_limit: usize,
    pub refresh_interval_secs: u64,
    /// Background rounds closer than this to the last fetch are skipped
    pub min_refresh_interval_secs: u64,
    pub background_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 600,
            window_days: 7,
            hashtag: "runstr".to_string(),
            initial_limit: 21,
            refresh_interval_secs: 60,
            min_refresh_interval_secs: 30,
            background_limit: 10,
        }
    }
}

impl FeedConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_days * 24 * 60 * 60)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_secs)
    }
}

/// Admission polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Randomize each delay in `[0, capped]`
    pub jitter: bool,
    /// Give up after this many polls, 0 = keep polling
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
            jitter: false,
            max_attempts: 20,
        }
    }
}

impl SchedulerConfig {
    /// Backoff used while waiting for scheduler admission.
    pub fn backoff(&self) -> ExponentialBackoff {
        let jitter = if self.jitter { Jitter::Full } else { Jitter::None };
        ExponentialBackoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.max_attempts,
        )
        .with_jitter(jitter)
    }
}

/// Group membership and messaging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MembershipConfig {
    /// Answer when no add/remove record exists for a member
    pub no_record_policy: NoRecordPolicy,
    pub message_kinds: Vec<u16>,
    pub message_limit: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            no_record_policy: NoRecordPolicy::default(),
            message_kinds: vec![nostr::KIND_GROUP_CHAT_MESSAGE, nostr::KIND_GROUP_ADMINS],
            message_limit: 50,
        }
    }
}
