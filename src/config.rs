//! Throttle policy configuration and snapshot management.
//!
//! Policies are loaded from YAML and handed to callers as immutable,
//! versioned snapshots. Operations receive a snapshot explicitly; there is
//! no process-wide mutable policy state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// A complete throttle policy: one rule per purpose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Snapshot version. Assigned by [`PolicyHandle::install`]; a value in
    /// the YAML source is overwritten on install.
    #[serde(default)]
    pub version: u64,

    /// Map of purpose name to its throttle rule.
    #[serde(default)]
    pub purposes: HashMap<String, PurposeRule>,
}

/// Throttle rule for a single purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurposeRule {
    /// Maximum usages an actor may record within one calendar day.
    pub daily_limit: u64,

    /// Minimum spacing between two usages, in seconds.
    pub cooldown_secs: u64,

    /// Optional name/description for this rule
    #[serde(default)]
    pub name: Option<String>,
}

impl PurposeRule {
    /// The cooldown interval as a duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl ThrottleConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle policy configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse throttle policy: {}", e)))
    }

    /// Get the rule for a specific purpose.
    pub fn rule(&self, purpose: &str) -> Option<&PurposeRule> {
        self.purposes.get(purpose)
    }
}

/// Copy-on-read holder for the active policy snapshot.
///
/// `load` returns a cheap `Arc` clone that stays consistent for the duration
/// of an operation even if another task installs a newer policy meanwhile.
/// Each install bumps the snapshot version.
#[derive(Debug)]
pub struct PolicyHandle {
    current: parking_lot::RwLock<Arc<ThrottleConfig>>,
}

impl PolicyHandle {
    /// Create a handle around an initial policy. The initial snapshot is
    /// version 1.
    pub fn new(mut initial: ThrottleConfig) -> Self {
        initial.version = 1;
        Self {
            current: parking_lot::RwLock::new(Arc::new(initial)),
        }
    }

    /// Get the active snapshot.
    pub fn load(&self) -> Arc<ThrottleConfig> {
        self.current.read().clone()
    }

    /// Replace the active snapshot, bumping the version. Returns the new
    /// version.
    pub fn install(&self, mut config: ThrottleConfig) -> u64 {
        let mut current = self.current.write();
        config.version = current.version + 1;
        let version = config.version;
        *current = Arc::new(config);
        info!(version = version, "Installed throttle policy snapshot");
        version
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(ThrottleConfig::new())
    }
}
