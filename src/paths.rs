//! XDG Base Directory Specification compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. encap-specific env var (ENCAP_CONFIG_DIR, ENCAP_STATE_DIR)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved directory paths for the application.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// State directory: shell history
    pub state_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "ENCAP_CONFIG_DIR", || {
            strategy.config_dir().join("encap")
        });

        let state_dir = env_or(&env_fn, "ENCAP_STATE_DIR", || {
            // state_dir() is None on platforms without XDG_STATE_HOME.
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("encap")
        });

        Ok(Self {
            config_dir,
            state_dir,
        })
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Shell history: state_dir/history.txt
    pub fn history_file(&self) -> PathBuf {
        self.state_dir.join("history.txt")
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.state_dir] {
            create_dir_with_mode(dir)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join("encap"),
                state_dir: home.join(".local").join("state").join("encap"),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute()) // XDG spec: ignore relative paths
        .unwrap_or_else(default)
}

/// Create a directory with mode 0700 per XDG spec.
fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_are_xdg_compliant() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();
        assert!(paths.config_dir.ends_with("encap"), "config_dir: {:?}", paths.config_dir);
        assert!(paths.state_dir.ends_with("encap"), "state_dir: {:?}", paths.state_dir);
        assert!(paths.config_file().ends_with("encap/config.toml"));
        assert!(paths.history_file().ends_with("encap/history.txt"));
    }

    #[test]
    fn env_vars_override_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("ENCAP_CONFIG_DIR", "/custom/config");
        env.insert("ENCAP_STATE_DIR", "/custom/state");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
    }

    #[test]
    fn relative_and_empty_overrides_are_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("ENCAP_CONFIG_DIR", "relative/path");
        env.insert("ENCAP_STATE_DIR", "");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.is_absolute());
        assert!(paths.state_dir.ends_with("encap"));
    }

    #[test]
    fn ensure_dirs_creates_both() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths {
            config_dir: dir.path().join("c"),
            state_dir: dir.path().join("s"),
        };
        paths.ensure_dirs().unwrap();
        assert!(paths.config_dir.is_dir() && paths.state_dir.is_dir());
    }
}
