use crate::action::ActionType;
use crate::error::{Result, TickdError};
use crate::{io, paths};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// SQLite file; safe for several daemon processes sharing one path.
    #[default]
    Sqlite,
    /// redb file; one process at a time, any number of daemons within it.
    Redb,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Database file. Relative paths resolve against the project root;
    /// defaults to `.tickd/tickd.db` or `.tickd/tickd.redb`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolve_path(&self, root: &Path) -> PathBuf {
        match &self.path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => root.join(p),
            None => paths::default_db_path(root, self.backend),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Delay before a failed action becomes claimable again.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Eligible on the very next claim.
    #[default]
    Immediate,
    Fixed {
        delay_ms: u64,
    },
    /// `base_ms * 2^(attempts - 1)`, capped at `max_ms`.
    Exponential {
        base_ms: u64,
        max_ms: u64,
    },
}

impl RetryPolicy {
    /// Delay after the `attempts`-th failed attempt (1-based).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match self {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            RetryPolicy::Exponential { base_ms, max_ms } => {
                let shift = attempts.saturating_sub(1).min(32);
                let factor = 1u64 << shift;
                Duration::from_millis(base_ms.saturating_mul(factor).min(*max_ms))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WebhookTarget
// ---------------------------------------------------------------------------

/// Real-mode endpoint for one action type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    /// Stable identity of this daemon instance. Generated per process when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_tick_ceiling_ms")]
    pub tick_ceiling_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// RUNNING rows untouched for this long are treated as orphaned.
    #[serde(default = "default_orphan_after_ms")]
    pub orphan_after_ms: u64,
    /// Length of the tick and log lists in status output.
    #[serde(default = "default_status_recent")]
    pub status_recent: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub webhooks: BTreeMap<ActionType, WebhookTarget>,
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    3
}

fn default_tick_ceiling_ms() -> u64 {
    20_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_orphan_after_ms() -> u64 {
    300_000
}

fn default_status_recent() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            owner_id: None,
            tick_interval_ms: default_tick_interval_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            batch_size: default_batch_size(),
            tick_ceiling_ms: default_tick_ceiling_ms(),
            max_attempts: default_max_attempts(),
            retry: RetryPolicy::default(),
            orphan_after_ms: default_orphan_after_ms(),
            status_recent: default_status_recent(),
            webhooks: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load `.tickd/config.yaml`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let config: Config = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&path, data.as_bytes())
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TickdError::Config("batch_size must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(TickdError::Config("max_attempts must be at least 1".into()));
        }
        if self.tick_interval_ms == 0 || self.lease_ttl_ms == 0 || self.tick_ceiling_ms == 0 {
            return Err(TickdError::Config(
                "tick_interval_ms, lease_ttl_ms and tick_ceiling_ms must be non-zero".into(),
            ));
        }
        if self.lease_ttl_ms <= self.tick_interval_ms {
            return Err(TickdError::Config(format!(
                "lease_ttl_ms ({}) must exceed tick_interval_ms ({}) or the lease lapses between ticks",
                self.lease_ttl_ms, self.tick_interval_ms
            )));
        }
        // A tick may renew only between actions, so one action can hold the
        // lease for up to the whole ceiling without renewing.
        if self.lease_ttl_ms <= self.tick_ceiling_ms {
            return Err(TickdError::Config(format!(
                "lease_ttl_ms ({}) must exceed tick_ceiling_ms ({}) or the lease can lapse mid-action",
                self.lease_ttl_ms, self.tick_ceiling_ms
            )));
        }
        if self.orphan_after_ms <= self.tick_ceiling_ms {
            return Err(TickdError::Config(format!(
                "orphan_after_ms ({}) must exceed tick_ceiling_ms ({})",
                self.orphan_after_ms, self.tick_ceiling_ms
            )));
        }
        if let Some(owner) = &self.owner_id {
            if owner.trim().is_empty() {
                return Err(TickdError::Config("owner_id must not be blank".into()));
            }
        }
        Ok(())
    }

    /// The configured owner id, or a fresh `<host>-<pid>-<suffix>` identity.
    pub fn resolved_owner_id(&self) -> String {
        if let Some(owner) = &self.owner_id {
            return owner.clone();
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "tickd".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{host}-{}-{}", std::process::id(), &suffix[..8])
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn tick_ceiling(&self) -> Duration {
        Duration::from_millis(self.tick_ceiling_ms)
    }

    pub fn orphan_after(&self) -> Duration {
        Duration::from_millis(self.orphan_after_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.tick_ceiling_ms, 20_000);
        assert_eq!(config.retry, RetryPolicy::Immediate);
        assert_eq!(config.store.backend, Backend::Sqlite);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".tickd")).unwrap();
        std::fs::write(
            dir.path().join(".tickd/config.yaml"),
            "batch_size: 5\nretry:\n  policy: fixed\n  delay_ms: 250\nwebhooks:\n  POST_SOCIAL:\n    url: http://localhost:9/hook\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry, RetryPolicy::Fixed { delay_ms: 250 });
        let hook = &config.webhooks[&ActionType::PostSocial];
        assert_eq!(hook.timeout_ms, 10_000);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            owner_id: Some("daemon-1".into()),
            store: StoreConfig {
                backend: Backend::Redb,
                path: None,
            },
            ..Config::default()
        };
        config.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.owner_id.as_deref(), Some("daemon-1"));
        assert_eq!(loaded.store.backend, Backend::Redb);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let zero_batch = Config {
            batch_size: 0,
            ..Config::default()
        };
        assert!(zero_batch.validate().is_err());

        let short_ttl = Config {
            lease_ttl_ms: 500,
            tick_interval_ms: 1_000,
            ..Config::default()
        };
        assert!(short_ttl.validate().is_err());

        let eager_orphans = Config {
            orphan_after_ms: 1_000,
            ..Config::default()
        };
        assert!(eager_orphans.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn lease_must_outlive_the_tick_ceiling() {
        let defaults = Config::default();
        assert!(defaults.lease_ttl_ms > defaults.tick_ceiling_ms);

        let lapsing = Config {
            lease_ttl_ms: 10_000,
            tick_ceiling_ms: 20_000,
            ..Config::default()
        };
        let err = lapsing.validate().unwrap_err().to_string();
        assert!(err.contains("tick_ceiling_ms"), "{err}");

        let equal = Config {
            lease_ttl_ms: 20_000,
            tick_ceiling_ms: 20_000,
            ..Config::default()
        };
        assert!(equal.validate().is_err());
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::Exponential {
            base_ms: 100,
            max_ms: 1_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1_000));
        assert_eq!(RetryPolicy::Immediate.delay_for(7), Duration::ZERO);
    }

    #[test]
    fn store_path_resolution() {
        let root = Path::new("/srv/app");
        let default = StoreConfig::default();
        assert_eq!(
            default.resolve_path(root),
            PathBuf::from("/srv/app/.tickd/tickd.db")
        );
        let relative = StoreConfig {
            backend: Backend::Sqlite,
            path: Some(PathBuf::from("data/q.db")),
        };
        assert_eq!(relative.resolve_path(root), PathBuf::from("/srv/app/data/q.db"));
    }
}
