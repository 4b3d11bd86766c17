//! Configuration file and state file resolution
//!
//! Settings file lookup follows this priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Platform config directory (`~/.config/segue/settings.toml` on Linux)
//! 4. None (built-in defaults apply)

use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the settings file
pub const CONFIG_ENV_VAR: &str = "SEGUE_CONFIG";

const APP_DIR: &str = "segue";
const SETTINGS_FILE: &str = "settings.toml";
const STATE_FILE: &str = "player.state";

/// Resolve the settings file path, or None when no file applies
pub fn resolve_settings_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory, only if it exists
    let user_config = dirs::config_dir().map(|d| d.join(APP_DIR).join(SETTINGS_FILE));
    match user_config {
        Some(path) if path.exists() => Some(path),
        Some(path) => {
            debug!("No settings file at {}", path.display());
            None
        }
        None => None,
    }
}

/// Default location of the persisted player state
pub fn default_state_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR).join(STATE_FILE))
        .unwrap_or_else(|| PathBuf::from("./segue_data").join(STATE_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_argument_wins() {
        let path = resolve_settings_path(Some(Path::new("/tmp/x.toml")), "SEGUE_TEST_UNSET_VAR");
        assert_eq!(path, Some(PathBuf::from("/tmp/x.toml")));
    }

    #[test]
    fn test_state_path_names_file() {
        let path = default_state_path();
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(STATE_FILE));
    }
}
