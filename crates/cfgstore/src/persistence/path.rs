//! Path helpers for configuration file locations.
//!
//! Responsibilities:
//! - Derive the plain and encrypted candidate paths for a configuration name.
//! - Validate configuration names so they map to a single file stem.
//! - Resolve the platform-standard working directory via `directories`.
//!
//! Does NOT handle:
//! - File I/O operations.
//! - Migration logic.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::constants::{ENCRYPTED_EXTENSION, PLAIN_EXTENSION, TEMP_SUFFIX};
use crate::error::{Result, StoreError};

/// The two candidate locations of a configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    /// `<dir>/<name>.bucfg`
    pub plain: PathBuf,
    /// `<dir>/<name>.bccfg`
    pub encrypted: PathBuf,
}

impl ConfigPaths {
    /// Derives both candidate paths for `name` inside `dir`.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            plain: dir.join(format!("{name}.{PLAIN_EXTENSION}")),
            encrypted: dir.join(format!("{name}.{ENCRYPTED_EXTENSION}")),
        }
    }

    /// Returns the path used for the given encryption state.
    pub fn for_state(&self, encrypted: bool) -> &Path {
        if encrypted {
            &self.encrypted
        } else {
            &self.plain
        }
    }
}

/// Checks that a configuration name is non-blank and usable as a file stem.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation(
            "configuration name cannot be blank".to_string(),
        ));
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) || name.contains('\0') {
        return Err(StoreError::Validation(format!(
            "configuration name '{name}' is not a valid file name"
        )));
    }
    Ok(())
}

/// Returns the sibling path a file is written to before being renamed into place.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Returns the platform-standard configuration directory for `app_name`.
///
/// - Linux: `~/.config/<app_name>`
/// - macOS: `~/Library/Application Support/<app_name>`
/// - Windows: `%AppData%\<app_name>\config`
pub fn default_working_dir(app_name: &str) -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("", "", app_name).ok_or_else(|| {
        StoreError::ConfigDirUnavailable(format!("no home directory found for '{app_name}'"))
    })?;

    Ok(proj_dirs.config_dir().to_path_buf())
}
