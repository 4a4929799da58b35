//! Configuration loading for the stagehand daemon.
//!
//! Every option has a compiled default, can be set in a TOML file, and can
//! be overridden by an environment variable. Files load in order (later
//! wins):
//!
//! 1. `/etc/stagehand/config.toml` (system)
//! 2. `~/.config/stagehand/config.toml` (user)
//! 3. `./stagehand.toml` (local override)
//! 4. Environment variables (`STAGEHAND_*`)
//!
//! # Example Config
//!
//! ```toml
//! [server]
//! listen_port = 8321
//!
//! [console]
//! ip = "10.1.1.32"
//! port = 10023
//! mock = false
//!
//! [paths]
//! scene_dir = "~/.local/share/stagehand/scenes"
//! backup_dir = "~/.local/share/stagehand/backups"
//!
//! [session]
//! idle_window_secs = 10
//! max_probe_failures = 5
//!
//! [log]
//! level = "info"
//! ```

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// TCP port for the HTTP/WebSocket surface.
    pub listen_port: u16,
    /// Default console target for the session.
    pub console_ip: String,
    pub console_port: u16,
    /// Sandbox directory for scene backups.
    pub scene_dir: PathBuf,
    /// Sandbox directory for full-console backups.
    pub backup_dir: PathBuf,
    /// Replace the console with the in-process emulator.
    pub mock_mode: bool,
    /// Seconds of silence before the session re-probes.
    pub idle_window_secs: u64,
    /// Consecutive unanswered probes before the session fails.
    pub max_probe_failures: u32,
    pub log_level: String,
}

impl Default for StageConfig {
    fn default() -> Self {
        let data_dir = directories::BaseDirs::new()
            .map(|d| d.data_dir().join("stagehand"))
            .unwrap_or_else(|| PathBuf::from(".stagehand"));
        Self {
            listen_port: 8321,
            console_ip: "192.168.1.64".to_string(),
            console_port: 10023,
            scene_dir: data_dir.join("scenes"),
            backup_dir: data_dir.join("backups"),
            mock_mode: false,
            idle_window_secs: 10,
            max_probe_failures: 5,
            log_level: "info".to_string(),
        }
    }
}

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

impl StageConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./stagehand.toml` override. System and user configs still load
    /// first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = StageConfig::default();

        for path in discover_config_files(config_path) {
            apply_file(&mut config, &path)?;
            sources.files.push(path);
        }

        apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }
}

/// Discover config files in standard locations, in load order. Only
/// returns files that exist.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/stagehand/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("stagehand/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // CLI override takes precedence over local
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("stagehand.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Overlay one TOML file onto the config.
fn apply_file(config: &mut StageConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    apply_toml(config, &contents, path)
}

fn apply_toml(config: &mut StageConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if let Some(server) = table.get("server").and_then(|v| v.as_table()) {
        if let Some(v) = server.get("listen_port").and_then(|v| v.as_integer()) {
            config.listen_port = v as u16;
        }
    }

    if let Some(console) = table.get("console").and_then(|v| v.as_table()) {
        if let Some(v) = console.get("ip").and_then(|v| v.as_str()) {
            config.console_ip = v.to_string();
        }
        if let Some(v) = console.get("port").and_then(|v| v.as_integer()) {
            config.console_port = v as u16;
        }
        if let Some(v) = console.get("mock").and_then(|v| v.as_bool()) {
            config.mock_mode = v;
        }
    }

    if let Some(paths) = table.get("paths").and_then(|v| v.as_table()) {
        if let Some(v) = paths.get("scene_dir").and_then(|v| v.as_str()) {
            config.scene_dir = expand_path(v);
        }
        if let Some(v) = paths.get("backup_dir").and_then(|v| v.as_str()) {
            config.backup_dir = expand_path(v);
        }
    }

    if let Some(session) = table.get("session").and_then(|v| v.as_table()) {
        if let Some(v) = session.get("idle_window_secs").and_then(|v| v.as_integer()) {
            config.idle_window_secs = v as u64;
        }
        if let Some(v) = session
            .get("max_probe_failures")
            .and_then(|v| v.as_integer())
        {
            config.max_probe_failures = v as u32;
        }
    }

    if let Some(log) = table.get("log").and_then(|v| v.as_table()) {
        if let Some(v) = log.get("level").and_then(|v| v.as_str()) {
            config.log_level = v.to_string();
        }
    }

    Ok(())
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut StageConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("STAGEHAND_PORT") {
        if let Ok(port) = v.parse() {
            config.listen_port = port;
            sources.env_overrides.push("STAGEHAND_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("STAGEHAND_CONSOLE_IP") {
        config.console_ip = v;
        sources.env_overrides.push("STAGEHAND_CONSOLE_IP".to_string());
    }
    if let Ok(v) = env::var("STAGEHAND_CONSOLE_PORT") {
        if let Ok(port) = v.parse() {
            config.console_port = port;
            sources
                .env_overrides
                .push("STAGEHAND_CONSOLE_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("STAGEHAND_SCENE_DIR") {
        config.scene_dir = expand_path(&v);
        sources.env_overrides.push("STAGEHAND_SCENE_DIR".to_string());
    }
    if let Ok(v) = env::var("STAGEHAND_BACKUP_DIR") {
        config.backup_dir = expand_path(&v);
        sources
            .env_overrides
            .push("STAGEHAND_BACKUP_DIR".to_string());
    }
    if let Ok(v) = env::var("STAGEHAND_MOCK") {
        config.mock_mode = matches!(v.as_str(), "1" | "true" | "yes" | "on");
        sources.env_overrides.push("STAGEHAND_MOCK".to_string());
    }
    if let Ok(v) = env::var("STAGEHAND_LOG_LEVEL") {
        config.log_level = v;
        sources.env_overrides.push("STAGEHAND_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand a leading `~` in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
