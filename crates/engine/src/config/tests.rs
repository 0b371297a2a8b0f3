use std::time::Duration;

use calcnode_wire::Transport;

use super::types::{EngineConfig, DEFAULT_JOB_FAILURE_NODE_ID};
use crate::error::EngineError;

#[test]
fn empty_toml_uses_defaults() {
    let cfg = EngineConfig::from_toml("").unwrap();
    assert_eq!(cfg.dispatcher.max_job_attempts, 2);
    assert_eq!(cfg.dispatcher.max_job_execution_time(), None);
    assert_eq!(
        cfg.dispatcher.max_job_execution_time_query(),
        Duration::from_secs(5)
    );
    assert_eq!(cfg.dispatcher.job_failure_node_id, DEFAULT_JOB_FAILURE_NODE_ID);
    assert_eq!(cfg.local.node_id_prefix, "local");
    assert_eq!(cfg.watchdog.max_job_item_execution_time(), None);
    assert_eq!(cfg.remote.transport().unwrap(), Transport::tcp("127.0.0.1", 5590));
}

#[test]
fn parse_full_toml() {
    let toml = r#"
[dispatcher]
max_job_execution_time_ms = 30000
max_job_execution_time_query_ms = 250
max_job_attempts = 3
job_failure_node_id = "FAILED"

[local]
node_count = 4
node_id_prefix = "grid"

[watchdog]
max_job_item_execution_time_ms = 10000
check_interval_ms = 500

[remote]
endpoint = "ipc:///tmp/calcnode/dispatch.sock"
"#;
    let cfg = EngineConfig::from_toml(toml).unwrap();
    assert_eq!(
        cfg.dispatcher.max_job_execution_time(),
        Some(Duration::from_secs(30))
    );
    assert_eq!(
        cfg.dispatcher.max_job_execution_time_query(),
        Duration::from_millis(250)
    );
    assert_eq!(cfg.dispatcher.max_job_attempts, 3);
    assert_eq!(cfg.dispatcher.job_failure_node_id, "FAILED");
    assert_eq!(cfg.local.resolved_node_count(), 4);
    assert_eq!(cfg.local.node_id_prefix, "grid");
    assert_eq!(
        cfg.watchdog.max_job_item_execution_time(),
        Some(Duration::from_secs(10))
    );
    assert_eq!(cfg.watchdog.check_interval(), Duration::from_millis(500));
    assert_eq!(
        cfg.remote.transport().unwrap(),
        Transport::Ipc("/tmp/calcnode/dispatch.sock".into())
    );
}

#[test]
fn zero_node_count_resolves_to_cores() {
    let cfg = EngineConfig::default();
    assert!(cfg.local.resolved_node_count() >= 1);
}

#[test]
fn zero_attempts_rejected() {
    let toml = "[dispatcher]\nmax_job_attempts = 0\n";
    let err = EngineConfig::from_toml(toml).unwrap_err();
    assert!(matches!(err, EngineError::Config(ref msg) if msg.contains("max_job_attempts")));
}

#[test]
fn blank_failure_node_id_rejected() {
    let toml = "[dispatcher]\njob_failure_node_id = \"  \"\n";
    assert!(EngineConfig::from_toml(toml).is_err());
}

#[test]
fn zero_check_interval_rejected() {
    let toml = "[watchdog]\ncheck_interval_ms = 0\n";
    assert!(EngineConfig::from_toml(toml).is_err());
}

#[test]
fn invalid_endpoint_rejected() {
    let toml = "[remote]\nendpoint = \"udp://127.0.0.1:5590\"\n";
    let err = EngineConfig::from_toml(toml).unwrap_err();
    assert!(matches!(err, EngineError::Config(ref msg) if msg.contains("udp://")));
}

#[test]
fn malformed_toml_is_parse_error() {
    let err = EngineConfig::from_toml("[dispatcher\n").unwrap_err();
    assert!(matches!(err, EngineError::ConfigParse(_)));
}

#[test]
fn missing_file_is_io_error() {
    let err = EngineConfig::from_file("/nonexistent/calcnode.toml").unwrap_err();
    assert!(matches!(err, EngineError::ConfigIo(_)));
}

#[test]
fn env_override_max_job_attempts() {
    // SAFETY: test-only, nextest runs each test in its own process
    unsafe {
        std::env::set_var("CALCNODE_DISPATCHER_MAX_JOB_ATTEMPTS", "5");
    }
    let cfg = EngineConfig::from_toml("[dispatcher]\nmax_job_attempts = 2\n").unwrap();
    assert_eq!(cfg.dispatcher.max_job_attempts, 5);
    unsafe {
        std::env::remove_var("CALCNODE_DISPATCHER_MAX_JOB_ATTEMPTS");
    }
}

#[test]
fn env_override_remote_endpoint() {
    // SAFETY: test-only, nextest runs each test in its own process
    unsafe {
        std::env::set_var("CALCNODE_REMOTE_ENDPOINT", "tcp://10.0.0.5:7000");
    }
    let cfg = EngineConfig::from_toml("").unwrap();
    assert_eq!(cfg.remote.endpoint, "tcp://10.0.0.5:7000");
    unsafe {
        std::env::remove_var("CALCNODE_REMOTE_ENDPOINT");
    }
}

#[test]
fn unparsable_env_override_ignored() {
    // SAFETY: test-only, nextest runs each test in its own process
    unsafe {
        std::env::set_var("CALCNODE_LOCAL_NODE_COUNT", "many");
    }
    let cfg = EngineConfig::from_toml("[local]\nnode_count = 3\n").unwrap();
    assert_eq!(cfg.local.node_count, 3);
    unsafe {
        std::env::remove_var("CALCNODE_LOCAL_NODE_COUNT");
    }
}
