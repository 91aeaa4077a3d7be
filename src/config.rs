//! Configuration management for sshpane.
//!
//! Settings are loaded from `~/.sshpane/config.toml`. Every field is
//! optional; missing or unparsable files fall back to the defaults.
//!
//! ```toml
//! [terminal]
//! term_type = "xterm-256color"
//! cols = 80
//! rows = 24
//! max_lines = 5000
//!
//! [transport]
//! connect_timeout_secs = 10
//! channel_timeout_secs = 10
//! exec_timeout_secs = 30
//!
//! [transfer]
//! chunk_size = 8192
//!
//! [vault]
//! # defaults to ~/.sshpane/vault
//! dir = "/path/to/vault"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub terminal: TerminalConfig,
    pub transport: TransportConfig,
    pub transfer: TransferConfig,
    pub vault: VaultConfig,
}

/// Pseudo-terminal settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Terminal type requested for the PTY
    pub term_type: String,
    /// Size used when the local terminal size is unknown
    pub cols: u16,
    pub rows: u16,
    /// Display buffer line cap
    pub max_lines: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            term_type: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
            max_lines: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_secs: u64,
    pub channel_timeout_secs: u64,
    pub exec_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            channel_timeout_secs: 10,
            exec_timeout_secs: 30,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::transfer::CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `~/.sshpane/config.toml`
    pub fn load() -> Self {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Ignoring invalid config {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Could not read config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save configuration to `~/.sshpane/config.toml`
    pub fn save(&self) -> Result<(), String> {
        match config_path() {
            Some(path) => self.save_to(&path),
            None => Err("Could not determine config path".to_string()),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }
        fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Vault directory: the configured one, else `~/.sshpane/vault`
    pub fn vault_dir(&self) -> Option<PathBuf> {
        self.vault
            .dir
            .clone()
            .or_else(|| app_dir().map(|dir| dir.join("vault")))
    }
}

/// `~/.sshpane`
pub fn app_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".sshpane"))
}

fn config_path() -> Option<PathBuf> {
    app_dir().map(|dir| dir.join("config.toml"))
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.terminal.term_type, "xterm-256color");
        assert_eq!((config.terminal.cols, config.terminal.rows), (80, 24));
        assert_eq!(config.transfer.chunk_size, 8192);
        assert_eq!(config.transport.exec_timeout(), Duration::from_secs(30));
        assert_eq!(config.vault.dir, None);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[terminal]\ncols = 132\n\n[vault]\ndir = \"/srv/vault\"\n").unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.terminal.cols, 132);
        assert_eq!(config.terminal.rows, 24);
        assert_eq!(config.transport, TransportConfig::default());
        assert_eq!(config.vault_dir(), Some(PathBuf::from("/srv/vault")));
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[terminal\ncols = ").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
        assert_eq!(Config::load_from(&dir.path().join("missing.toml")), Config::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.transport.connect_timeout_secs = 3;
        config.terminal.term_type = "vt100".to_string();

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path), config);
    }
}
