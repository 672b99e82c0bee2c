//! Storage configuration and path management for ovo.
//!
//! All file paths ovo touches are decided here:
//!
//! - Production code uses `StorageConfig::resolve()`, which honors
//!   `OVO_DATA_DIR` and otherwise lands in the per-user data directory
//!   (`~/Library/Application Support/ovo`, `~/.local/share/ovo`, ...).
//! - Tests use `StorageConfig::with_root(temp_dir)` for isolation.
//!
//! Every concern gets its own file. A missing file is a valid initial state.

use std::env;
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "OVO_DATA_DIR";
const APP_DIR_NAME: &str = "ovo";

/// Central configuration for all ovo storage paths.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    /// Resolves the data directory from the environment, falling back to the
    /// platform data dir, then to `./.ovo` when no home directory exists.
    pub fn resolve() -> Self {
        if let Some(root) = env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Self::with_root(PathBuf::from(root));
        }
        let root = dirs::data_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(".ovo"));
        Self { root }
    }

    /// Creates a StorageConfig with a custom root directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to projects.json (the project registry).
    pub fn projects_file(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    /// Path to logs/ (bridge log files).
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs_err::create_dir_all(&self.root)?;
        fs_err::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_with_root_sets_custom_path() {
        let config = StorageConfig::with_root(PathBuf::from("/tmp/test-ovo"));
        assert_eq!(config.root(), Path::new("/tmp/test-ovo"));
    }

    #[test]
    fn test_projects_file_path() {
        let config = StorageConfig::with_root(PathBuf::from("/tmp/ovo"));
        assert_eq!(
            config.projects_file(),
            PathBuf::from("/tmp/ovo/projects.json")
        );
    }

    #[test]
    fn test_logs_dir_path() {
        let config = StorageConfig::with_root(PathBuf::from("/tmp/ovo"));
        assert_eq!(config.logs_dir(), PathBuf::from("/tmp/ovo/logs"));
    }

    #[test]
    fn test_ensure_dirs_creates_structure() {
        let temp = TempDir::new().unwrap();
        let config = StorageConfig::with_root(temp.path().join("nested"));

        config.ensure_dirs().unwrap();

        assert!(config.root().is_dir());
        assert!(config.logs_dir().is_dir());
    }
}
