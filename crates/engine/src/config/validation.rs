use super::types::EngineConfig;
use crate::error::EngineError;

impl EngineConfig {
    /// Validate the config: attempt counts, intervals and the remote endpoint.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.validate_dispatcher()?;
        self.validate_watchdog()?;
        self.validate_remote_endpoint()?;
        Ok(())
    }

    fn validate_dispatcher(&self) -> Result<(), EngineError> {
        if self.dispatcher.max_job_attempts == 0 {
            return Err(EngineError::Config(
                "dispatcher.max_job_attempts must be at least 1".into(),
            ));
        }
        if self.dispatcher.job_failure_node_id.trim().is_empty() {
            return Err(EngineError::Config(
                "dispatcher.job_failure_node_id must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn validate_watchdog(&self) -> Result<(), EngineError> {
        if self.watchdog.check_interval_ms == 0 {
            return Err(EngineError::Config(
                "watchdog.check_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Ensure the remote endpoint uses a supported scheme.
    fn validate_remote_endpoint(&self) -> Result<(), EngineError> {
        self.remote.transport().map_err(|_| {
            EngineError::Config(format!(
                "invalid remote.endpoint '{}', expected 'tcp://host:port' or 'ipc://path'",
                self.remote.endpoint
            ))
        })?;
        Ok(())
    }
}
