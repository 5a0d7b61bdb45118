//! Data directory resolution.
//!
//! Defaults to `~/.nwshare/`; `--conf <dir>` overrides it. The path is
//! resolved once by the binary and handed to the stores explicitly.

use anyhow::{Result, anyhow};
use std::path::{Path, PathBuf};

const DEFAULT_DIR_NAME: &str = ".nwshare";

/// Resolve the data directory, making a relative override absolute.
pub fn resolve(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) if p.is_absolute() => Ok(p.to_path_buf()),
        Some(p) => Ok(std::env::current_dir()?.join(p)),
        None => dirs::home_dir()
            .map(|home| home.join(DEFAULT_DIR_NAME))
            .ok_or_else(|| anyhow!("No home directory found")),
    }
}

/// Directory holding received blobs and their index.
pub fn store_dir(root: &Path) -> PathBuf {
    root.join("files")
}

/// Recent-peer registry file.
pub fn peers_file(root: &Path) -> PathBuf {
    root.join("peers.json")
}

/// Settings file read at startup.
pub fn settings_file(root: &Path) -> PathBuf {
    root.join("settings.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_override_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve(Some(dir.path())).unwrap(), dir.path());
    }

    #[test]
    fn relative_override_is_made_absolute() {
        let resolved = resolve(Some(Path::new("relative-data"))).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("relative-data"));
    }
}
