use std::path::Path;

use calcnode_wire::Transport;

use crate::error::EngineError;

use super::types::{EngineConfig, RemoteConfig};

impl EngineConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, EngineError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `CALCNODE_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `CALCNODE_DISPATCHER_MAX_JOB_ATTEMPTS` -> `dispatcher.max_job_attempts`
    /// - `CALCNODE_LOCAL_NODE_COUNT` -> `local.node_count`
    /// - `CALCNODE_REMOTE_ENDPOINT` -> `remote.endpoint`
    ///
    /// Values that do not parse are ignored.
    pub(crate) fn apply_env_overrides(&mut self) {
        override_parsed(
            "CALCNODE_DISPATCHER_MAX_JOB_EXECUTION_TIME_MS",
            &mut self.dispatcher.max_job_execution_time_ms,
        );
        override_parsed(
            "CALCNODE_DISPATCHER_MAX_JOB_EXECUTION_TIME_QUERY_MS",
            &mut self.dispatcher.max_job_execution_time_query_ms,
        );
        override_parsed(
            "CALCNODE_DISPATCHER_MAX_JOB_ATTEMPTS",
            &mut self.dispatcher.max_job_attempts,
        );
        if let Ok(v) = std::env::var("CALCNODE_DISPATCHER_JOB_FAILURE_NODE_ID") {
            self.dispatcher.job_failure_node_id = v;
        }
        override_parsed("CALCNODE_LOCAL_NODE_COUNT", &mut self.local.node_count);
        if let Ok(v) = std::env::var("CALCNODE_LOCAL_NODE_ID_PREFIX") {
            self.local.node_id_prefix = v;
        }
        override_parsed(
            "CALCNODE_WATCHDOG_MAX_JOB_ITEM_EXECUTION_TIME_MS",
            &mut self.watchdog.max_job_item_execution_time_ms,
        );
        override_parsed(
            "CALCNODE_WATCHDOG_CHECK_INTERVAL_MS",
            &mut self.watchdog.check_interval_ms,
        );
        if let Ok(v) = std::env::var("CALCNODE_REMOTE_ENDPOINT") {
            self.remote.endpoint = v;
        }
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(v) = std::env::var(var) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}

impl RemoteConfig {
    /// Resolve the listener endpoint to a [`Transport`].
    pub fn transport(&self) -> Result<Transport, EngineError> {
        Ok(Transport::parse(&self.endpoint)?)
    }
}
