//! Engine configuration loaded from TOML with `CALCNODE_*` environment overrides.
//!
//! Split into focused submodules:
//! - `types`: config structs and their defaults
//! - `loading`: parsing and environment overrides
//! - `validation`: consistency checks run after loading

mod loading;
mod types;
mod validation;
#[cfg(test)]
mod tests;

pub use types::{
    DispatcherConfig, EngineConfig, LocalConfig, RemoteConfig, WatchdogConfig,
    DEFAULT_JOB_FAILURE_NODE_ID,
};
