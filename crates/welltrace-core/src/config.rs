//! Persistent configuration for welltrace.
//!
//! Stores user settings in `~/.welltrace/config.json`. Command-line flags take
//! precedence over anything stored here.
//!
//! # Example
//!
//! ```no_run
//! use welltrace_core::config::WelltraceConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = WelltraceConfig::load();
//!
//! if config.audit_log {
//!     println!("Audit trail goes to {}", config.audit_dir().display());
//! }
//! ```

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.json";

/// Returns `~/.welltrace`, creating it if needed.
///
/// Falls back to a relative `.welltrace` when the home directory cannot be
/// determined.
pub fn welltrace_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".welltrace");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Returns `~/.welltrace/logs`, creating it if needed.
pub fn logs_dir() -> PathBuf {
    let dir = welltrace_dir().join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn default_color() -> bool {
    true
}

/// Persistent welltrace configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelltraceConfig {
    /// Colorize console output.
    #[serde(default = "default_color")]
    pub color: bool,

    /// Write every run's log as a JSONL audit trail.
    #[serde(default)]
    pub audit_log: bool,

    /// Where audit trails go. Defaults to `~/.welltrace/logs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log_dir: Option<PathBuf>,

    /// Wait for operator acknowledgement after each ERROR entry.
    #[serde(default)]
    pub pause_on_error: bool,
}

impl Default for WelltraceConfig {
    fn default() -> Self {
        Self {
            color: default_color(),
            audit_log: false,
            audit_log_dir: None,
            pause_on_error: false,
        }
    }
}

impl WelltraceConfig {
    /// Load config from `~/.welltrace/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        let path = welltrace_dir().join(CONFIG_FILENAME);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.welltrace/config.json`.
    pub fn save(&self) -> io::Result<()> {
        let path = welltrace_dir().join(CONFIG_FILENAME);
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Directory for audit trails.
    pub fn audit_dir(&self) -> PathBuf {
        self.audit_log_dir.clone().unwrap_or_else(logs_dir)
    }
}
