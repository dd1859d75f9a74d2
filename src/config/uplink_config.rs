//! Uplink Configuration - node identity, archive server and timing as TOML values
//!
//! Every struct implements `Default` with the values in [`super::defaults`],
//! so a node with no config file still runs against the standard layout.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one sensor node.
///
/// Load with `UplinkConfig::load()` which searches:
/// 1. `$FIELDNODE_CONFIG` env var
/// 2. `./uplink_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UplinkConfig {
    /// Node identification
    #[serde(default)]
    pub node: NodeConfig,

    /// Archive server connection
    #[serde(default)]
    pub server: ServerConfig,

    /// Local and remote directory layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// Dispatcher and transfer timing
    #[serde(default)]
    pub timing: TimingConfig,

    /// Reachability probing
    #[serde(default)]
    pub reachability: ReachabilityConfig,
}

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "FIELDNODE_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "uplink_config.toml";

impl UplinkConfig {
    /// Load configuration using the standard search order:
    /// 1. `$FIELDNODE_CONFIG` environment variable
    /// 2. `./uplink_config.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), node = %config.node.name, "Loaded uplink config from FIELDNODE_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from FIELDNODE_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "FIELDNODE_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(node = %config.node.name, "Loaded uplink config from ./uplink_config.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./uplink_config.toml, using defaults");
                }
            }
        }

        info!("No uplink_config.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        for key in unknown_keys(&contents) {
            warn!(key = %key, "Unknown config key (ignored)");
        }

        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate values for internal consistency.
    ///
    /// All problems are collected so the operator sees them in one pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.node.name.trim().is_empty() {
            errors.push("node.name must not be empty".to_string());
        }
        if self.node.name.contains('/') {
            errors.push(format!("node.name '{}' must not contain '/'", self.node.name));
        }
        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be > 0".to_string());
        }
        if self.server.connect_attempts == 0 {
            errors.push("server.connect_attempts must be > 0".to_string());
        }
        for (name, root) in [
            ("paths.remote_lowres_root", &self.paths.remote_lowres_root),
            ("paths.remote_highres_root", &self.paths.remote_highres_root),
        ] {
            if !root.starts_with('/') {
                errors.push(format!("{name} must be an absolute remote path, got '{root}'"));
            }
        }

        let t = &self.timing;
        for (name, value) in [
            ("timing.idle_sleep_secs", t.idle_sleep_secs),
            ("timing.connect_timeout_secs", t.connect_timeout_secs),
            ("timing.outage_sleep_secs", t.outage_sleep_secs),
            ("timing.log_lock_timeout_secs", t.log_lock_timeout_secs),
            ("timing.sync_io_timeout_secs", t.sync_io_timeout_secs),
            ("timing.transfer_timeout_secs", t.transfer_timeout_secs),
            ("reachability.ping_timeout_secs", self.reachability.ping_timeout_secs),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be > 0"));
            }
        }
        if t.outage_reboot_after_secs < t.outage_sleep_secs {
            errors.push(format!(
                "timing.outage_reboot_after_secs ({}) must be >= timing.outage_sleep_secs ({})",
                t.outage_reboot_after_secs, t.outage_sleep_secs
            ));
        }
        if t.sync_deadline_secs < t.sync_io_timeout_secs {
            errors.push(format!(
                "timing.sync_deadline_secs ({}) must be >= timing.sync_io_timeout_secs ({})",
                t.sync_deadline_secs, t.sync_io_timeout_secs
            ));
        }
        if self.reachability.ping_count == 0 {
            errors.push("reachability.ping_count must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Unknown Key Detection
// ============================================================================

const KNOWN_KEYS: &[&str] = &[
    "node", "node.name",
    "server", "server.host", "server.user", "server.port", "server.identity_file",
    "server.connect_attempts",
    "paths", "paths.remote_lowres_root", "paths.remote_highres_root",
    "paths.local_highres_root", "paths.staging_dir", "paths.diagnostic_log",
    "timing", "timing.idle_sleep_secs", "timing.outage_sleep_secs",
    "timing.outage_reboot_after_secs", "timing.connect_timeout_secs",
    "timing.transfer_timeout_secs", "timing.sync_io_timeout_secs",
    "timing.sync_deadline_secs", "timing.log_lock_timeout_secs",
    "reachability", "reachability.public_target", "reachability.ping_count",
    "reachability.ping_timeout_secs",
];

/// Dotted key paths present in `raw_toml` that no config field consumes.
fn unknown_keys(raw_toml: &str) -> Vec<String> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new(); // parse errors are reported by serde
    };
    let mut found = Vec::new();
    walk_toml_keys(&value, "", &mut found);
    found
        .into_iter()
        .filter(|k| !KNOWN_KEYS.contains(&k.as_str()))
        .collect()
}

fn walk_toml_keys(value: &toml::Value, prefix: &str, out: &mut Vec<String>) {
    if let toml::Value::Table(table) = value {
        for (k, v) in table {
            let key = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            walk_toml_keys(v, &key, out);
            out.push(key);
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Node
// ============================================================================

/// Node identity used in every remote path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier (directory name on the archive server)
    #[serde(default = "default_node_name")]
    pub name: String,
}

fn default_node_name() -> String {
    "fieldnode".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Archive server SSH/SFTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_user")]
    pub user: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Private key passed to ssh/sftp/rsync with `-i`. Agent/default keys when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    /// Attempts per session open before reporting the server unavailable
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

fn default_server_host() -> String {
    "archive.local".to_string()
}
fn default_server_user() -> String {
    "uplink".to_string()
}
fn default_server_port() -> u16 {
    defaults::SERVER_PORT
}
fn default_connect_attempts() -> u32 {
    defaults::CONNECT_ATTEMPTS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            user: default_server_user(),
            port: default_server_port(),
            identity_file: None,
            connect_attempts: default_connect_attempts(),
        }
    }
}

// ============================================================================
// Paths
// ============================================================================

/// Local and remote directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Remote root of the low-res object tree (`<root>/<node>/<YYYY>/<MM>/<DD>/`)
    #[serde(default = "default_remote_lowres_root")]
    pub remote_lowres_root: String,

    /// Remote root of the high-res mirror (`<root>/<node>/<YYYY>/<MM>/`)
    #[serde(default = "default_remote_highres_root")]
    pub remote_highres_root: String,

    /// Local root of the high-res CSV tree, laid out as `<root>/<YYYY>/<MM>/`
    #[serde(default = "default_local_highres_root")]
    pub local_highres_root: PathBuf,

    /// Scratch directory for compressed payloads awaiting SFTP put
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Append-only diagnostic log file
    #[serde(default = "default_diagnostic_log")]
    pub diagnostic_log: PathBuf,
}

fn default_remote_lowres_root() -> String {
    "/srv/fieldnode/lowres".to_string()
}
fn default_remote_highres_root() -> String {
    "/srv/fieldnode/highres".to_string()
}
fn default_local_highres_root() -> PathBuf {
    PathBuf::from("./data/highres")
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from("./data/staging")
}
fn default_diagnostic_log() -> PathBuf {
    PathBuf::from("./data/uplink.log")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            remote_lowres_root: default_remote_lowres_root(),
            remote_highres_root: default_remote_highres_root(),
            local_highres_root: default_local_highres_root(),
            staging_dir: default_staging_dir(),
            diagnostic_log: default_diagnostic_log(),
        }
    }
}

// ============================================================================
// Timing
// ============================================================================

/// Dispatcher pacing and transfer bounds, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_idle_sleep")]
    pub idle_sleep_secs: u64,

    #[serde(default = "default_outage_sleep")]
    pub outage_sleep_secs: u64,

    /// Continuous outage that triggers a forced reboot
    #[serde(default = "default_outage_reboot_after")]
    pub outage_reboot_after_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,

    #[serde(default = "default_sync_io_timeout")]
    pub sync_io_timeout_secs: u64,

    #[serde(default = "default_sync_deadline")]
    pub sync_deadline_secs: u64,

    #[serde(default = "default_log_lock_timeout")]
    pub log_lock_timeout_secs: u64,
}

fn default_idle_sleep() -> u64 {
    defaults::IDLE_SLEEP_SECS
}
fn default_outage_sleep() -> u64 {
    defaults::OUTAGE_SLEEP_SECS
}
fn default_outage_reboot_after() -> u64 {
    defaults::OUTAGE_REBOOT_AFTER_SECS
}
fn default_connect_timeout() -> u64 {
    defaults::CONNECT_TIMEOUT_SECS
}
fn default_transfer_timeout() -> u64 {
    defaults::TRANSFER_TIMEOUT_SECS
}
fn default_sync_io_timeout() -> u64 {
    defaults::SYNC_IO_TIMEOUT_SECS
}
fn default_sync_deadline() -> u64 {
    defaults::SYNC_DEADLINE_SECS
}
fn default_log_lock_timeout() -> u64 {
    defaults::LOG_LOCK_TIMEOUT_SECS
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            idle_sleep_secs: default_idle_sleep(),
            outage_sleep_secs: default_outage_sleep(),
            outage_reboot_after_secs: default_outage_reboot_after(),
            connect_timeout_secs: default_connect_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
            sync_io_timeout_secs: default_sync_io_timeout(),
            sync_deadline_secs: default_sync_deadline(),
            log_lock_timeout_secs: default_log_lock_timeout(),
        }
    }
}

impl TimingConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_secs(self.idle_sleep_secs)
    }

    pub fn outage_sleep(&self) -> Duration {
        Duration::from_secs(self.outage_sleep_secs)
    }

    pub fn outage_reboot_after(&self) -> Duration {
        Duration::from_secs(self.outage_reboot_after_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn log_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.log_lock_timeout_secs)
    }
}

// ============================================================================
// Reachability
// ============================================================================

/// Ping targets and bounds for the reachability check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityConfig {
    /// Public host whose reachability stands in for "internet is up"
    #[serde(default = "default_public_target")]
    pub public_target: String,

    #[serde(default = "default_ping_count")]
    pub ping_count: u32,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
}

fn default_public_target() -> String {
    defaults::PUBLIC_REACHABILITY_TARGET.to_string()
}
fn default_ping_count() -> u32 {
    defaults::PING_COUNT
}
fn default_ping_timeout() -> u64 {
    defaults::PING_TIMEOUT_SECS
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            public_target: default_public_target(),
            ping_count: default_ping_count(),
            ping_timeout_secs: default_ping_timeout(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = UplinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.outage_reboot_after_secs, 3 * 24 * 3600);
        assert_eq!(config.server.connect_attempts, 3);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_str = r#"
[node]
name = "site-07"

[server]
host = "archive.example.org"
port = 2200
"#;
        let config: UplinkConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.name, "site-07");
        assert_eq!(config.server.port, 2200);
        assert_eq!(config.server.user, "uplink");
        assert_eq!(config.timing.idle_sleep_secs, defaults::IDLE_SLEEP_SECS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = UplinkConfig::default();
        config.node.name = String::new();
        config.server.port = 0;
        config.timing.outage_reboot_after_secs = 10;
        config.paths.remote_lowres_root = "relative/path".to_string();

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert_eq!(errors.len(), 4, "got: {errors:?}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = UplinkConfig::default();
        config.timing.connect_timeout_secs = 0;
        config.reachability.ping_timeout_secs = 0;

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert_eq!(errors.len(), 2, "got: {errors:?}");
                assert!(errors.iter().any(|e| e.starts_with("timing.connect_timeout_secs")));
                assert!(errors.iter().any(|e| e.starts_with("reachability.ping_timeout_secs")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_keys_reported() {
        let toml_str = r#"
[timing]
idle_sleep_secs = 10
outage_slep_secs = 20
"#;
        let unknown = unknown_keys(toml_str);
        assert_eq!(unknown, vec!["timing.outage_slep_secs".to_string()]);
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uplink_config.toml");
        let mut config = UplinkConfig::default();
        config.node.name = "bench-node".to_string();
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = UplinkConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.node.name, "bench-node");
    }

    #[test]
    fn test_load_from_file_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server]\nport = 0\n").unwrap();

        assert!(matches!(
            UplinkConfig::load_from_file(&path),
            Err(ConfigError::Validation(_))
        ));
    }
}
