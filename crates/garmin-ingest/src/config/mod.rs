mod credentials;
mod settings;

pub use credentials::FileTokenStore;
pub use settings::{
    parse_date, BackendConfig, ColdArchiveConfig, ColdArchiveMode, IngestConfig, PacingConfig,
    ProtocolGeneration, RetryConfig, WatermarkPolicy, CONFIG_FILE_NAME,
};

use crate::error::{IngestError, Result};
use std::path::{Path, PathBuf};

/// Default configuration directory name
const CONFIG_DIR_NAME: &str = "garmin";

/// Get the configuration directory path
/// Returns ~/.config/garmin on Unix, ~/Library/Application Support/garmin on macOS
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join(CONFIG_DIR_NAME))
        .ok_or_else(|| IngestError::config("Could not determine config directory"))
}

/// Get the data directory path holding per-profile tokens
/// Returns ~/.local/share/garmin on Unix, ~/Library/Application Support/garmin on macOS
pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|p| p.join(CONFIG_DIR_NAME))
        .ok_or_else(|| IngestError::config("Could not determine data directory"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
