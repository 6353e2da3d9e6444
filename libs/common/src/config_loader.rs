//! Layered configuration loading
//!
//! Priority, lowest to highest:
//! 1. `T::default()`
//! 2. YAML file (optional)
//! 3. Environment variables with the given prefix; `__` separates nested
//!    keys, e.g. `MODCTL_SERIAL__BAUD_RATE=19200`

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigLoadError {
    fn from(err: figment::Error) -> Self {
        ConfigLoadError::Invalid(Box::new(err))
    }
}

/// Provider stack for `T` without extracting it
pub fn figment_for<T>(path: Option<&Path>, env_prefix: &str) -> Result<Figment, ConfigLoadError>
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.to_path_buf()));
        }
        info!("Loading configuration from {}", path.display());
        figment = figment.merge(Yaml::file(path));
    }

    debug!("Environment overrides use prefix {}", env_prefix);
    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load `T` from defaults, an optional YAML file and prefixed environment variables
///
/// An explicitly given file that does not exist is an error.
pub fn load_config<T>(path: Option<&Path>, env_prefix: &str) -> Result<T, ConfigLoadError>
where
    T: Serialize + DeserializeOwned + Default,
{
    Ok(figment_for::<T>(path, env_prefix)?.extract()?)
}
