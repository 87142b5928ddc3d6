//! Shell configuration.

use serde::{Deserialize, Serialize};

use notesync_sync::{BusConfig, CoordinatorConfig};

use crate::error::Result;

/// Configuration for a [`SyncShell`](crate::SyncShell).
///
/// Every field has a default, so a host only needs to spell out what it
/// changes:
///
/// ```rust
/// use notesync::ShellConfig;
///
/// let config = ShellConfig::from_json(r#"{"coordinator": {"poll_interval_ms": 5000}}"#).unwrap();
/// assert_eq!(config.coordinator.poll_interval_ms, 5000);
/// assert_eq!(config.bus.channel_name, "notesync");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub coordinator: CoordinatorConfig,
    pub bus: BusConfig,
    /// Start background polling when a coordinator is attached.
    pub auto_poll: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            bus: BusConfig::default(),
            auto_poll: true,
        }
    }
}

impl ShellConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
