//! TOML-based configuration for the client.
//!
//! Reads `AppConfig` from the platform-appropriate config file unless a path
//! is given on the command line:
//! - Windows:  `%APPDATA%\ArkAssistant\config.toml`
//! - Linux:    `~/.config/arkassistant/config.toml`
//! - macOS:    `~/Library/Application Support/ArkAssistant/config.toml`
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "10.0.0.2"
//! port = 9999
//! passphrase = "shared secret"
//!
//! [touch]
//! jitter_px = 2
//! ```
//!
//! Every field has a `#[serde(default = "...")]` fallback, so a partial file
//! (or none at all) is valid.  [`AppConfig::load`] is the only way the binary
//! builds a config and it always runs [`AppConfig::validate`], so the rest of
//! the crate never sees a zero port or a zero-step swipe.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::automate::EngineConfig;
use crate::infrastructure::touch::TouchConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is outside its allowed range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level application configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub touch: TouchSettings,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote service address and shared secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Passphrase the channel key is derived from; must match the service.
    #[serde(default = "default_passphrase")]
    pub passphrase: String,
    /// Overall limit for one request/response exchange.
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,
}

/// Device bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Path to the `adb` executable; a bare name is looked up on `PATH`.
    #[serde(default = "default_adb_path")]
    pub adb_path: PathBuf,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

/// Touch daemon and gesture settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TouchSettings {
    /// First local port tried for the daemon relay.
    #[serde(default = "default_relay_base_port")]
    pub relay_base_port: u16,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_tap_duration")]
    pub tap_duration_ms: u64,
    #[serde(default = "default_swipe_duration")]
    pub swipe_duration_ms: u64,
    #[serde(default = "default_swipe_steps")]
    pub swipe_steps: u32,
    #[serde(default = "default_pressure")]
    pub pressure: u32,
    /// Random offset applied to server-issued coordinates, in screen pixels.
    #[serde(default)]
    pub jitter_px: u32,
    /// Where the daemon binary is installed on the device.
    #[serde(default = "default_daemon_path")]
    pub daemon_path: String,
    /// Local cache for downloaded daemon binaries and helper packages.
    /// Defaults to `<config dir>/cache`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

/// Screenshot processing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    /// JPEG quality, 1–100.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Longest edge of the image sent to the service, in pixels.
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
}

/// Task loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_incomplete_polls: Option<u32>,
    /// How long shutdown waits for the worker before abandoning it.
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9999
}
fn default_passphrase() -> String {
    "default_password".to_string()
}
fn default_server_timeout() -> u64 {
    300
}
fn default_adb_path() -> PathBuf {
    PathBuf::from("adb")
}
fn default_command_timeout() -> u64 {
    10
}
fn default_relay_base_port() -> u16 {
    20000
}
fn default_connect_attempts() -> u32 {
    5
}
fn default_connect_backoff() -> u64 {
    300
}
fn default_handshake_timeout() -> u64 {
    2000
}
fn default_tap_duration() -> u64 {
    50
}
fn default_swipe_duration() -> u64 {
    200
}
fn default_swipe_steps() -> u32 {
    10
}
fn default_pressure() -> u32 {
    100
}
fn default_daemon_path() -> String {
    "/data/local/tmp/minitouch".to_string()
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_max_dimension() -> u32 {
    1024
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_join_timeout() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            passphrase: default_passphrase(),
            timeout_secs: default_server_timeout(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for TouchSettings {
    fn default() -> Self {
        Self {
            relay_base_port: default_relay_base_port(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff(),
            handshake_timeout_ms: default_handshake_timeout(),
            tap_duration_ms: default_tap_duration(),
            swipe_duration_ms: default_swipe_duration(),
            swipe_steps: default_swipe_steps(),
            pressure: default_pressure(),
            jitter_px: 0,
            daemon_path: default_daemon_path(),
            cache_dir: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            max_dimension: default_max_dimension(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_incomplete_polls: None,
            join_timeout_secs: default_join_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Loading and validation ────────────────────────────────────────────────────

impl AppConfig {
    /// Loads and validates the config at `path`, or at the platform default
    /// location when `path` is `None`.  A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system errors other than "not
    /// found", [`ConfigError::Parse`] for malformed TOML, and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_file_path()?,
        };

        let config = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str::<AppConfig>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(e) => return Err(ConfigError::Io { path, source: e }),
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes the config to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system failures or
    /// [`ConfigError::Serialize`] if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every value the rest of the crate relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.server.host.trim().is_empty() {
            return Err(invalid("server.host", "must not be empty"));
        }
        if self.server.port == 0 {
            return Err(invalid("server.port", "must not be 0"));
        }
        if self.server.passphrase.is_empty() {
            return Err(invalid("server.passphrase", "must not be empty"));
        }
        if self.server.timeout_secs == 0 {
            return Err(invalid("server.timeout_secs", "must be greater than 0"));
        }
        if self.device.command_timeout_secs == 0 {
            return Err(invalid("device.command_timeout_secs", "must be greater than 0"));
        }
        if self.touch.relay_base_port == 0 {
            return Err(invalid("touch.relay_base_port", "must not be 0"));
        }
        if self.touch.connect_attempts == 0 {
            return Err(invalid("touch.connect_attempts", "must be at least 1"));
        }
        if self.touch.handshake_timeout_ms == 0 {
            return Err(invalid("touch.handshake_timeout_ms", "must be greater than 0"));
        }
        if self.touch.swipe_steps == 0 {
            return Err(invalid("touch.swipe_steps", "must be at least 1"));
        }
        if !self.touch.daemon_path.starts_with('/') {
            return Err(invalid("touch.daemon_path", "must be an absolute device path"));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(invalid(
                "capture.jpeg_quality",
                format!("{} is outside 1..=100", self.capture.jpeg_quality),
            ));
        }
        if self.capture.max_dimension == 0 {
            return Err(invalid("capture.max_dimension", "must be greater than 0"));
        }
        if self.engine.poll_interval_ms == 0 {
            return Err(invalid("engine.poll_interval_ms", "must be greater than 0"));
        }
        if self.engine.join_timeout_secs == 0 {
            return Err(invalid("engine.join_timeout_secs", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.device.command_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.join_timeout_secs)
    }

    /// Engine tunables derived from the `[engine]` section.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            max_incomplete_polls: self.engine.max_incomplete_polls,
        }
    }

    /// Touch channel tunables derived from the `[touch]` section.
    pub fn touch_config(&self) -> TouchConfig {
        let t = &self.touch;
        TouchConfig {
            relay_base_port: t.relay_base_port,
            connect_attempts: t.connect_attempts,
            connect_backoff: Duration::from_millis(t.connect_backoff_ms),
            handshake_timeout: Duration::from_millis(t.handshake_timeout_ms),
            tap_duration_ms: t.tap_duration_ms,
            swipe_duration_ms: t.swipe_duration_ms,
            swipe_steps: t.swipe_steps,
            pressure: t.pressure,
            jitter_px: t.jitter_px,
            daemon_path: t.daemon_path.clone(),
            ..TouchConfig::default()
        }
    }
}

// ── Platform directories ──────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Resolves the platform config base directory including the app subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("ArkAssistant"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("arkassistant"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("ArkAssistant")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.server.port, 9999);
        assert_eq!(cfg.server.timeout_secs, 300);
        assert_eq!(cfg.capture.jpeg_quality, 80);
        assert_eq!(cfg.capture.max_dimension, 1024);
        assert_eq!(cfg.touch.jitter_px, 0);
        assert_eq!(cfg.engine.max_incomplete_polls, None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let cfg: AppConfig = toml::from_str("[server]\nhost = \"10.0.0.2\"\n").unwrap();

        assert_eq!(cfg.server.host, "10.0.0.2");
        assert_eq!(cfg.server.port, 9999);
        assert_eq!(cfg.touch.swipe_steps, 10);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();

        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_values() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.touch.jitter_px = 3;
        cfg.engine.max_incomplete_polls = Some(20);

        // Act
        cfg.save(&path).unwrap();
        let restored = AppConfig::load(Some(&path)).unwrap();

        // Assert
        assert_eq!(restored, cfg);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[capture]\njpeg_quality = 0\n").unwrap();

        let result = AppConfig::load(Some(&path));

        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "capture.jpeg_quality", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_port_and_steps() {
        let mut cfg = AppConfig::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.touch.swipe_steps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        assert!(matches!(AppConfig::load(Some(&path)), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_derived_engine_and_touch_configs() {
        let mut cfg = AppConfig::default();
        cfg.engine.poll_interval_ms = 250;
        cfg.touch.pressure = 50;

        assert_eq!(cfg.engine_config().poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.touch_config().pressure, 50);
    }
}
