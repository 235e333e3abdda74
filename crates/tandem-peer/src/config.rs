//! Factory configuration

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use tandem_ice::IceConfig;

/// Settings shared by every connection a factory creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Worker threads of the internal runtime (at least 2)
    pub worker_threads: usize,
    /// Name prefix of the internal threads
    pub thread_name: String,
    /// Interfaces to gather host candidates on. Empty means discover them.
    pub interfaces: Vec<IpAddr>,
    pub ice: IceConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            thread_name: "tandem-worker".to_string(),
            interfaces: Vec::new(),
            ice: IceConfig::default(),
        }
    }
}
