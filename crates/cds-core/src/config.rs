use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CdsError, Result};

/// Top-level CDS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            engine: EngineConfig::default(),
            checkpoint: None,
            log: None,
        }
    }
}

fn default_workspace() -> String {
    "~/.cds".to_string()
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on node hooks running at once (0 = unlimited).
    #[serde(default)]
    pub max_parallel_nodes: usize,
    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize {
    256
}

/// Node status checkpointing, used to restart interrupted executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Enable checkpointing (default: true when section is present).
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// SQLite file for status snapshots. Default: <workspace>/checkpoints.db
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

fn default_checkpoint_enabled() -> bool {
    true
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = lifecycle and failures, 2 = +node results, 3 = +dispatches (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_level() -> u8 {
    2
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CdsError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| CdsError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    /// Checkpoint database path, if checkpointing is enabled.
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        let cp = self.checkpoint.as_ref().filter(|c| c.enabled)?;
        Some(match cp.path {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("checkpoints.db"),
        })
    }

    /// Run log level; 0 when run logging is disabled.
    pub fn log_level(&self) -> u8 {
        self.log
            .as_ref()
            .filter(|l| l.enabled)
            .map_or(0, |l| l.level)
    }

    /// Run log directory, if run logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match log.log_dir {
            Some(ref dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

pub fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.workspace, "~/.cds");
        assert_eq!(config.engine.max_parallel_nodes, 0);
        assert_eq!(config.engine.event_capacity, 256);
        assert!(config.checkpoint_path().is_none());
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_section_presence_enables_features() {
        let config: AppConfig = toml::from_str(
            r#"
workspace = "/srv/cds"

[checkpoint]

[log]
log_dir = "/var/log/cds"
"#,
        )
        .unwrap();
        assert_eq!(
            config.checkpoint_path(),
            Some(PathBuf::from("/srv/cds/checkpoints.db"))
        );
        assert_eq!(config.log_dir(), Some(PathBuf::from("/var/log/cds")));
        assert_eq!(config.log_level(), 2);
    }

    #[test]
    fn test_log_level_from_config() {
        let config: AppConfig = toml::from_str("[log]\nlevel = 3\n").unwrap();
        assert_eq!(config.log_level(), 3);

        let config: AppConfig = toml::from_str("[log]\nenabled = false\nlevel = 3\n").unwrap();
        assert_eq!(config.log_level(), 0);
    }

    #[test]
    fn test_disabled_sections() {
        let config: AppConfig = toml::from_str(
            r#"
[checkpoint]
enabled = false

[log]
enabled = false
"#,
        )
        .unwrap();
        assert!(config.checkpoint_path().is_none());
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_expand_env_vars_keeps_unknown() {
        let out = expand_env_vars("path = \"${CDS_SURELY_UNSET_VARIABLE}\"");
        assert_eq!(out, "path = \"${CDS_SURELY_UNSET_VARIABLE}\"");
    }
}
