// src/config.rs

//! Dispatcher configuration: subnet host lists, pool bounds, timeouts, and
//! failover tuning. All constants are threaded through these structs rather
//! than living in process-wide statics, so every dispatcher instance can be
//! tuned independently (and tests can shrink the timeouts).

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;
use tokio::fs;

/// One fabric-management host endpoint (an FE) a connection can target.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HostInfo {
    pub host: String,
    pub port: u16,

    /// Secure the session with TLS. The TLS engine comes from the injected
    /// [`crate::secure::TlsProvisioner`].
    #[serde(default)]
    pub secure: bool,
}

impl HostInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
        }
    }

    /// The `host:port` form used for connecting and logging.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Static description of one subnet: an ordered list of candidate hosts.
/// The first entry is tried first; failover walks the rest in order.
#[derive(Debug, Clone, Deserialize)]
pub struct SubnetConfig {
    pub name: String,
    pub hosts: Vec<HostInfo>,

    /// Index of the host currently considered active. Updated by failover.
    #[serde(default)]
    pub active_host: usize,
}

impl SubnetConfig {
    pub fn active(&self) -> Option<&HostInfo> {
        self.hosts.get(self.active_host)
    }
}

/// Tuning for the per-subnet dispatcher and its connection pool.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Watchdog timeout for a non-blocking connect.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Default expiry applied to commands queued without an explicit one.
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,

    /// Minimum pooled connections per subnet, regardless of session count.
    #[serde(default = "default_pool_min")]
    pub pool_min: usize,

    /// Hard cap on pooled connections per subnet.
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,

    /// Connections targeted per active session before clamping.
    #[serde(default = "default_conns_per_session")]
    pub conns_per_session: usize,

    /// Bound on concurrently executing connection handlers.
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,

    #[serde(default)]
    pub failover: FailoverConfig,
}

/// Tuning for the failover manager.
#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    /// Wall-clock deadline for the whole failover, independent of per-host
    /// retry budgets.
    #[serde(with = "humantime_serde", default = "default_failover_deadline")]
    pub deadline: Duration,

    /// Poll timeout on the failover event queue, so the deadline is checked
    /// even when no probe events arrive.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Delay before a failed stage is retried.
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// Max attempts for the initial TCP connect stage.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Max attempts for the SM-list verification stage.
    #[serde(default = "default_sm_retries")]
    pub sm_list_retries: u32,

    /// Max attempts for the PM verification stage.
    #[serde(default = "default_pm_retries")]
    pub pm_retries: u32,

    /// Number of simultaneous connections the winning host must sustain.
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_pool_min() -> usize {
    3
}

fn default_pool_max() -> usize {
    10
}

fn default_conns_per_session() -> usize {
    3
}

fn default_worker_limit() -> usize {
    8
}

fn default_failover_deadline() -> Duration {
    Duration::from_secs(300)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_retries() -> u32 {
    3
}

fn default_sm_retries() -> u32 {
    2
}

fn default_pm_retries() -> u32 {
    2
}

fn default_min_connections() -> usize {
    3
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            conns_per_session: default_conns_per_session(),
            worker_limit: default_worker_limit(),
            failover: FailoverConfig::default(),
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            deadline: default_failover_deadline(),
            poll_interval: default_poll_interval(),
            retry_delay: default_retry_delay(),
            connect_retries: default_connect_retries(),
            sm_list_retries: default_sm_retries(),
            pm_retries: default_pm_retries(),
            min_connections: default_min_connections(),
        }
    }
}

impl DispatcherConfig {
    pub async fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: DispatcherConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the dispatcher cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.pool_min == 0 || self.pool_max < self.pool_min {
            anyhow::bail!(
                "pool bounds invalid: min={} max={}",
                self.pool_min,
                self.pool_max
            );
        }
        if self.worker_limit == 0 {
            anyhow::bail!("worker_limit must be at least 1");
        }
        if self.failover.min_connections == 0 {
            anyhow::bail!("failover.min_connections must be at least 1");
        }
        Ok(())
    }
}
