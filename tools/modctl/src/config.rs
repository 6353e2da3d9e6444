//! modctl configuration
//!
//! Loaded from defaults, an optional YAML file and `MODCTL_*` environment
//! variables, e.g. `MODCTL_MASTER__TARGET=udp:10.0.0.7`.

use std::path::Path;

use modstack::{MasterConfig, SlaveConfig};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "MODCTL_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModctlConfig {
    /// Settings for the master subcommands
    #[serde(default)]
    pub master: MasterConfig,

    /// Settings for `serve`
    #[serde(default)]
    pub slave: SlaveConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ModctlConfig {
    fn default() -> Self {
        Self {
            master: MasterConfig::default(),
            slave: SlaveConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl ModctlConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, common::ConfigLoadError> {
        common::load_config(path, ENV_PREFIX)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
