//! Configuration and report paths
//!
//! Uses the directories crate for platform-appropriate locations:
//! - Linux: `~/.config/acceptor/`
//! - macOS: `~/Library/Application Support/acceptor/`
//! - Windows: `%APPDATA%\acceptor\`

use std::path::{Path, PathBuf};

/// Name used for the configuration directory
const APP_NAME: &str = "acceptor";

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Name of a test inferred from its definition file
///
/// The path relative to the suite root with the extension stripped, using
/// `/` as separator on every platform (`db/integration.yaml` -> `db/integration`).
pub fn test_name_from_path(suite_root: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(suite_root).unwrap_or(file);
    let stem = relative.with_extension("");
    stem.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a file looks like a test definition
pub fn is_test_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
