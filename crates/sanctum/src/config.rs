//! Layered configuration: defaults, then an optional TOML file, then
//! `SANCTUM__*` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "sanctum";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub realtime: RealtimeConfig,
    pub game: GameConfig,
    pub signaling: SignalingConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `sanctum.db` in the XDG data directory.
    pub path: Option<String>,
}

/// Connection pump settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Outbound queue capacity per connection.
    pub send_buffer: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    pub write_wait_secs: u64,
    pub pong_wait_secs: u64,
    /// Defaults to nine tenths of `pong_wait_secs`.
    pub ping_period_secs: Option<u64>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            send_buffer: 256,
            max_message_size: 512,
            write_wait_secs: 10,
            pong_wait_secs: 60,
            ping_period_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// How long a player of an active game may stay away before forfeiting.
    pub forfeit_grace_secs: u64,
    /// Points awarded to the winner of a game.
    pub win_points: i64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            forfeit_grace_secs: 60,
            win_points: 10,
        }
    }
}

impl GameConfig {
    pub fn forfeit_grace(&self) -> Duration {
        Duration::from_secs(self.forfeit_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub max_peers_per_room: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_peers_per_room: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    /// Connection URL for the redis backend.
    pub url: String,
    pub publish_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
            publish_timeout_ms: 2000,
        }
    }
}

impl BusConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms.max(1))
    }
}

impl AppConfig {
    /// Build the effective configuration. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Self> {
        let defaults = AppConfig::default();
        let built = Config::builder()
            .set_default("logging.level", defaults.logging.level)?
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", i64::from(defaults.server.port))?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
            .build()
            .with_context(|| format!("loading configuration from {}", path.display()))?;

        let mut config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;

        if let Some(ref db) = config.database.path {
            config.database.path = Some(expand_str_path(db)?.display().to_string());
        }
        Ok(config)
    }

    /// Resolved SQLite path.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database.path {
            Some(path) => expand_str_path(path),
            None => Ok(default_data_dir()?.join("sanctum.db")),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Write the default configuration to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let body = format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n{toml}",
        path.display()
    );
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

pub fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.realtime.send_buffer, 256);
        assert_eq!(cfg.realtime.max_message_size, 512);
        assert_eq!(cfg.realtime.pong_wait_secs, 60);
        assert_eq!(cfg.game.win_points, 10);
        assert_eq!(cfg.game.forfeit_grace(), Duration::from_secs(60));
        assert_eq!(cfg.signaling.max_peers_per_room, 8);
        assert_eq!(cfg.bus.backend, BusBackend::Memory);
        assert_eq!(cfg.bus.publish_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.realtime.write_wait_secs, 10);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[server]\nport = 9100\n\n[signaling]\nmax_peers_per_room = 4\n\n[bus]\nbackend = \"redis\"\n",
        )
        .unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.signaling.max_peers_per_room, 4);
        assert_eq!(cfg.bus.backend, BusBackend::Redis);
        assert_eq!(cfg.game.win_points, 10);
    }

    #[test]
    fn written_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default_config(&path).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for sanctum"));
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.realtime.send_buffer, 256);
    }
}
