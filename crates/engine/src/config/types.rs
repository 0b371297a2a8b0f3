use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

/// Configuration for a calculation node engine.
///
/// Parsed from `calcnode.toml` with support for environment variable overrides.
/// Every section is optional and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Job dispatch, retry and timeout policy.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// In-process calculation nodes.
    #[serde(default)]
    pub local: LocalConfig,

    /// Per-item execution watchdog.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Listener for remote calculation nodes.
    #[serde(default)]
    pub remote: RemoteConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// Node id recorded on results of jobs that never ran.
pub const DEFAULT_JOB_FAILURE_NODE_ID: &str = "NOT EXECUTED";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum wall time of one job attempt in milliseconds. `0` disables the timeout.
    #[serde(default)]
    pub max_job_execution_time_ms: u64,

    /// How long a liveness query to an invoker may take before the job is
    /// considered dead.
    #[serde(default = "default_query_ms")]
    pub max_job_execution_time_query_ms: u64,

    /// Attempts a job gets before its items are isolated or failed.
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,

    #[serde(default = "default_job_failure_node_id")]
    pub job_failure_node_id: String,
}

fn default_query_ms() -> u64 {
    5_000
}

fn default_max_job_attempts() -> u32 {
    2
}

fn default_job_failure_node_id() -> String {
    DEFAULT_JOB_FAILURE_NODE_ID.into()
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_job_execution_time_ms: 0,
            max_job_execution_time_query_ms: default_query_ms(),
            max_job_attempts: default_max_job_attempts(),
            job_failure_node_id: default_job_failure_node_id(),
        }
    }
}

impl DispatcherConfig {
    pub fn max_job_execution_time(&self) -> Option<Duration> {
        (self.max_job_execution_time_ms > 0)
            .then(|| Duration::from_millis(self.max_job_execution_time_ms))
    }

    pub fn max_job_execution_time_query(&self) -> Duration {
        Duration::from_millis(self.max_job_execution_time_query_ms)
    }
}

/// Local node pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Number of calculation nodes. `0` means one per available core.
    #[serde(default)]
    pub node_count: usize,

    /// Node ids are `<prefix>-<n>`.
    #[serde(default = "default_node_id_prefix")]
    pub node_id_prefix: String,
}

fn default_node_id_prefix() -> String {
    "local".into()
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            node_count: 0,
            node_id_prefix: default_node_id_prefix(),
        }
    }
}

impl LocalConfig {
    pub fn resolved_node_count(&self) -> usize {
        if self.node_count > 0 {
            return self.node_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Longest a single job item may run before it is interrupted. `0` disables.
    #[serde(default)]
    pub max_job_item_execution_time_ms: u64,

    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    1_000
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_job_item_execution_time_ms: 0,
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl WatchdogConfig {
    pub fn max_job_item_execution_time(&self) -> Option<Duration> {
        (self.max_job_item_execution_time_ms > 0)
            .then(|| Duration::from_millis(self.max_job_item_execution_time_ms))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// ROUTER endpoint remote nodes connect to (`tcp://` or `ipc://`).
    #[serde(default = "default_remote_endpoint")]
    pub endpoint: String,
}

fn default_remote_endpoint() -> String {
    "tcp://127.0.0.1:5590".into()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: default_remote_endpoint(),
        }
    }
}
