use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::fs;
use tracing::warn;

use crate::backend::TcpSettings;
use crate::router::{RetryPolicy, SessionPolicy};
use crate::topology::{ConnectionDefaults, EndpointSpec, ReplicaSelection, SentinelOptions};

pub const DEFAULT_SERVICE: &str = "mymaster";

fn default_service() -> String {
    DEFAULT_SERVICE.to_string()
}

fn default_sentinel_timeout() -> u64 {
    100
}

fn default_retry_wait() -> u64 {
    1_000
}

fn default_retry_limit() -> u32 {
    20
}

fn default_connect_timeout() -> u64 {
    1_000
}

/// Options of one replication set, read from TOML.
///
/// Durations are milliseconds. Setting `master` or `slaves` selects the
/// manual topology and `sentinels` is then ignored.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub sentinels: Vec<EndpointSpec>,
    #[serde(default = "default_sentinel_timeout")]
    pub sentinel_timeout: u64,
    #[serde(default = "default_retry_wait")]
    pub retry_wait: u64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default)]
    pub update_sentinels: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<EndpointSpec>,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Option::is_none"
    )]
    pub slaves: Option<Vec<EndpointSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<i64>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_write_timeout: Option<u64>,
    #[serde(default)]
    pub replica_selection: ReplicaSelection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_idle_reset: Option<u64>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            sentinels: Vec::new(),
            sentinel_timeout: default_sentinel_timeout(),
            retry_wait: default_retry_wait(),
            retry_limit: default_retry_limit(),
            update_sentinels: false,
            master: None,
            slaves: None,
            username: None,
            password: None,
            database: None,
            connect_timeout: default_connect_timeout(),
            read_write_timeout: None,
            replica_selection: ReplicaSelection::default(),
            session_idle_reset: None,
        }
    }
}

impl ReplicationConfig {
    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: ReplicationConfig = toml::from_str(raw).context("failed to parse config")?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    /// Ensure configuration correctness.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.sentinel_timeout == 0 {
            bail!("sentinel_timeout must be > 0");
        }
        if self.connect_timeout == 0 {
            bail!("connect_timeout must be > 0");
        }
        if self.read_write_timeout == Some(0) {
            bail!("read_write_timeout must be > 0 when set");
        }
        if self.session_idle_reset == Some(0) {
            bail!("session_idle_reset must be > 0 when set");
        }

        if self.is_manual() {
            let no_slaves = self.slaves.as_ref().map_or(true, Vec::is_empty);
            if self.master.is_none() && no_slaves {
                bail!("manual topology needs a master or at least one slave");
            }
            if !self.sentinels.is_empty() {
                warn!(
                    sentinels = self.sentinels.len(),
                    "master/slaves configured, sentinels are ignored"
                );
            }
        } else {
            if self.sentinels.is_empty() {
                bail!("configuration must declare sentinels or a manual master/slaves topology");
            }
            if self.service.trim().is_empty() {
                bail!("sentinel service name cannot be empty");
            }
        }
        Ok(())
    }

    /// Whether master/replica addresses come from configuration instead of Sentinel.
    pub fn is_manual(&self) -> bool {
        self.master.is_some() || self.slaves.is_some()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_limit, Duration::from_millis(self.retry_wait))
    }

    pub fn session_policy(&self) -> SessionPolicy {
        match self.session_idle_reset {
            Some(ms) => SessionPolicy::IdleReset(Duration::from_millis(ms)),
            None => SessionPolicy::Explicit,
        }
    }

    pub fn tcp_settings(&self) -> TcpSettings {
        TcpSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout),
            io_timeout: self.read_write_timeout.map(Duration::from_millis),
        }
    }

    pub fn connection_defaults(&self) -> ConnectionDefaults {
        ConnectionDefaults {
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database,
        }
    }

    pub fn sentinel_options(&self) -> SentinelOptions {
        SentinelOptions {
            service: self.service.clone(),
            timeout: Duration::from_millis(self.sentinel_timeout),
            update_sentinels: self.update_sentinels,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Option<Vec<EndpointSpec>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Some(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(spec) => vec![spec],
        OneOrMany::Many(specs) => specs,
    }))
}
