use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::loader::LoaderSettings;
use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    /// File this config was read from; `None` means the default location.
    #[serde(skip)]
    pub source: Option<PathBuf>,

    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub shell: ShellConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directory at the bottom of every session's search stack
    #[serde(default = "default_local_root")]
    pub local_root: String,

    /// Per-fetch timeout used when a guest passes `timeout=0`
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Whether `importer.*_repo` may register remote sources at all
    #[serde(default = "default_true")]
    pub allow_remote: bool,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Persist line-editor history under the state directory
    #[serde(default = "default_true")]
    pub history: bool,

    /// Print `Nest shell n` / `Unnest shell n` on entry and exit
    #[serde(default = "default_true")]
    pub banners: bool,

    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_local_root() -> String {
    ".".to_string()
}
fn default_fetch_timeout_secs() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_user_agent() -> String {
    format!("encap/{}", env!("CARGO_PKG_VERSION"))
}
fn default_history_size() -> usize {
    1000
}
fn default_log_level() -> String {
    "warn".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            local_root: default_local_root(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            allow_remote: default_true(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            history: default_true(),
            banners: default_true(),
            history_size: default_history_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load from the default location. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from `path`, or from the default location when `None`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let paths = Paths::resolve()?;
        let file = match path {
            Some(p) => expand_path(&p.to_string_lossy()),
            None => paths.config_file(),
        };

        let mut config = if file.exists() {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read config: {}", file.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Invalid config: {}", file.display()))?
        } else if path.is_some() {
            anyhow::bail!("Config file not found: {}", file.display());
        } else {
            Config::default()
        };
        config.paths = paths;
        config.source = path.map(|_| file);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The file `save` writes.
    pub fn file(&self) -> PathBuf {
        self.source
            .clone()
            .unwrap_or_else(|| self.paths.config_file())
    }

    pub fn save(&self) -> Result<()> {
        let path = self.file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Resolved `loader.local_root`, with `~` expanded.
    pub fn local_root(&self) -> PathBuf {
        expand_path(&self.loader.local_root)
    }

    pub fn loader_settings(&self) -> LoaderSettings {
        LoaderSettings {
            fetch_timeout: Duration::from_secs(self.loader.fetch_timeout_secs.max(1)),
            allow_remote: self.loader.allow_remote,
        }
    }

    /// Shell history file, when history is enabled.
    pub fn history_file(&self) -> Option<PathBuf> {
        self.shell.history.then(|| self.paths.history_file())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["loader", "local_root"] => Ok(self.loader.local_root.clone()),
            ["loader", "fetch_timeout_secs"] => Ok(self.loader.fetch_timeout_secs.to_string()),
            ["loader", "allow_remote"] => Ok(self.loader.allow_remote.to_string()),
            ["loader", "user_agent"] => Ok(self.loader.user_agent.clone()),
            ["shell", "history"] => Ok(self.shell.history.to_string()),
            ["shell", "banners"] => Ok(self.shell.banners.to_string()),
            ["shell", "history_size"] => Ok(self.shell.history_size.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "format"] => Ok(self.logging.format.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["loader", "local_root"] => self.loader.local_root = value.to_string(),
            ["loader", "fetch_timeout_secs"] => self.loader.fetch_timeout_secs = value.parse()?,
            ["loader", "allow_remote"] => self.loader.allow_remote = value.parse()?,
            ["loader", "user_agent"] => self.loader.user_agent = value.to_string(),
            ["shell", "history"] => self.shell.history = value.parse()?,
            ["shell", "banners"] => self.shell.banners = value.parse()?,
            ["shell", "history_size"] => self.shell.history_size = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "format"] => match value {
                "text" | "json" => self.logging.format = value.to_string(),
                other => anyhow::bail!("logging.format must be text or json, not {}", other),
            },
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).to_string())
}

/// Default config template with helpful comments (written by `config init`)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# encap configuration

[loader]
# Directory searched last for `import` (bottom of the source stack)
local_root = "."
# Seconds a single remote fetch may take when a guest passes timeout=0
fetch_timeout_secs = 10
# Set to false to refuse importer.remote_repo / github_repo / ...
allow_remote = true
# user_agent = "encap/0.1.0"

[shell]
# History lives in the state directory (see `encap paths`)
history = true
history_size = 1000
# Print "Nest shell n" / "Unnest shell n"
banners = true

[logging]
# RUST_LOG overrides this; -v forces debug
level = "warn"
# "text" or "json" (one object per line on stderr)
format = "text"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_matches_defaults() {
        let parsed = Config::parse(DEFAULT_CONFIG_TEMPLATE).unwrap();
        let defaults = Config::default();
        assert_eq!(parsed.loader.local_root, defaults.loader.local_root);
        assert_eq!(parsed.loader.fetch_timeout_secs, defaults.loader.fetch_timeout_secs);
        assert_eq!(parsed.loader.allow_remote, defaults.loader.allow_remote);
        assert_eq!(parsed.loader.user_agent, defaults.loader.user_agent);
        assert_eq!(parsed.shell.history_size, defaults.shell.history_size);
        assert_eq!(parsed.logging.level, "warn");
        assert_eq!(parsed.logging.format, defaults.logging.format);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config = Config::parse("[loader]\nallow_remote = false\n").unwrap();
        assert!(!config.loader.allow_remote);
        assert_eq!(config.loader.fetch_timeout_secs, 10);
        assert!(config.shell.banners);
        assert!(!config.loader_settings().allow_remote);
    }

    #[test]
    fn get_and_set_dotted_keys() {
        let mut config = Config::default();
        config.set_value("loader.fetch_timeout_secs", "3").unwrap();
        config.set_value("shell.banners", "false").unwrap();
        assert_eq!(config.get_value("loader.fetch_timeout_secs").unwrap(), "3");
        assert_eq!(config.get_value("shell.banners").unwrap(), "false");
        assert_eq!(config.loader_settings().fetch_timeout, Duration::from_secs(3));
        assert!(config.set_value("shell.history_size", "lots").is_err());
        assert!(config.get_value("server.port").is_err());
        assert!(config.set_value("logging.format", "xml").is_err());
        config.set_value("logging.format", "json").unwrap();
        assert_eq!(config.get_value("logging.format").unwrap(), "json");
    }

    #[test]
    fn local_root_expands_tilde() {
        let mut config = Config::default();
        config.loader.local_root = "~/modules".to_string();
        let root = config.local_root();
        assert!(!root.to_string_lossy().starts_with('~'));
        assert!(root.ends_with("modules"));
    }

    #[test]
    fn explicit_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encap.toml");
        fs::write(&path, "[shell]\nhistory = false\n").unwrap();

        let mut config = Config::load_from(Some(&path)).unwrap();
        assert!(config.history_file().is_none());
        config.set_value("logging.level", "debug").unwrap();
        config.save().unwrap();

        let reloaded = Config::load_from(Some(&path)).unwrap();
        assert_eq!(reloaded.logging.level, "debug");
        assert!(!reloaded.shell.history);
        assert!(Config::load_from(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
