//! Shared helpers for the modstack binaries
//!
//! - logging initialisation with the bracketed level format
//! - graceful shutdown on Ctrl+C / SIGTERM
//! - layered configuration loading (defaults, YAML file, environment)

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::{load_config, ConfigLoadError};
pub use logging::init_logging;
pub use shutdown::{shutdown_token, wait_for_shutdown};
