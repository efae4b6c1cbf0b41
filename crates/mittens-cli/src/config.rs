//! Tap configuration file lookup.
//!
//! Resolution order (highest priority first):
//! 1. Explicit `--config` flag or `MITTENS_CONFIG` environment variable
//! 2. `~/.mittens/config.json`, if it exists
//! 3. Built-in defaults

use std::path::{Path, PathBuf};

use mittens_tap::TapConfig;
use tracing::debug;

use crate::Result;

const CONFIG_DIR_NAME: &str = ".mittens";
const CONFIG_FILE_NAME: &str = "config.json";

/// Path to `~/.mittens/config.json`, when a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Config file to load, if any. An explicit path is returned even if it does
/// not exist so the read error is reported.
pub fn resolve_config_path(explicit: Option<&Path>, default: Option<PathBuf>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default.filter(|p| p.exists()),
    }
}

/// Load the tap configuration following the resolution order above.
pub fn load_tap_config(explicit: Option<&Path>) -> Result<TapConfig> {
    match resolve_config_path(explicit, default_config_path()) {
        Some(path) => {
            debug!(path = %path.display(), "Loading tap config");
            Ok(TapConfig::load(&path)?)
        }
        None => Ok(TapConfig::default()),
    }
}
