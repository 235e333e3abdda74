//! ICE timing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timers for one ICE agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// Time allowed for a single candidate-pair check
    pub check_timeout_ms: u64,
    /// How long `disconnected` may last before the agent declares `failed`
    pub disconnected_timeout_ms: u64,
    /// Spacing of re-checks on the selected pair while disconnected
    pub recovery_interval_ms: u64,
    /// Time allowed for one server-reflexive query during gathering
    pub gather_timeout_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            check_timeout_ms: 2500,
            disconnected_timeout_ms: 5000,
            recovery_interval_ms: 500,
            gather_timeout_ms: 3000,
        }
    }
}

impl IceConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn disconnected_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnected_timeout_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms.max(1))
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }
}
