//! Relay configuration, read from environment variables at startup.
//!
//! `AR_MASTER_KEY` (base64, 32 bytes) is the only mandatory setting; the
//! process refuses to start without it. Everything else has a default.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dirs: DirsConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Directories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Host directory layout. `state_dir` holds per-session data dirs
/// (`<state>/sessions/<id>/...`); `data_dir` holds the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirsConfig {
    #[serde(default = "d_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "d_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "d_config_dir")]
    pub config_dir: PathBuf,
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            state_dir: d_state_dir(),
            data_dir: d_data_dir(),
            cache_dir: d_cache_dir(),
            config_dir: d_config_dir(),
        }
    }
}

impl DirsConfig {
    /// Data directory for one session.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.state_dir.join("sessions").join(session_id)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("relay.db")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Crypto
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CryptoConfig {
    /// Base64-encoded 256-bit master key. Mandatory.
    #[serde(default)]
    pub master_key: String,
    /// Version tag written on new ciphertexts.
    #[serde(default = "d_key_version")]
    pub key_version: u32,
    /// Retired decrypt-only keys: version → base64 key.
    #[serde(default)]
    pub retired_keys: HashMap<u32, String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reaper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Tick interval in milliseconds.
    #[serde(default = "d_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Fallback idle threshold when the environment doesn't set one.
    #[serde(default = "d_idle_minutes")]
    pub default_idle_minutes: u32,
    /// Fallback terminate threshold when the environment doesn't set one.
    #[serde(default = "d_terminate_minutes")]
    pub default_terminate_minutes: u32,
    /// Journal rows older than this many days are pruned.
    #[serde(default = "d_retention_days")]
    pub retention_days: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: d_check_interval_ms(),
            default_idle_minutes: d_idle_minutes(),
            default_terminate_minutes: d_terminate_minutes(),
            retention_days: d_retention_days(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox engines
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container engine binary (docker-compatible CLI).
    #[serde(default = "d_container_engine")]
    pub container_engine: String,
    /// MicroVM launcher binary.
    #[serde(default = "d_vm_launcher")]
    pub vm_launcher: String,
    /// Command line starting the agent inside a sandbox, whitespace-split.
    #[serde(default = "d_agent_command")]
    pub agent_command: String,
    /// Default container image when the environment doesn't set one.
    #[serde(default = "d_default_image")]
    pub default_image: String,
    /// Seconds to wait for a sandbox to become ready.
    #[serde(default = "d_startup_timeout_sec")]
    pub startup_timeout_sec: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            container_engine: d_container_engine(),
            vm_launcher: d_vm_launcher(),
            agent_command: d_agent_command(),
            default_image: d_default_image(),
            startup_timeout_sec: d_startup_timeout_sec(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Env loading + validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Build the config from `AR_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(v) = std::env::var("AR_HOST") {
            cfg.server.host = v;
        }
        if let Some(v) = env_parse::<u16>("AR_PORT") {
            cfg.server.port = v;
        }

        if let Ok(v) = std::env::var("AR_STATE_DIR") {
            cfg.dirs.state_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AR_DATA_DIR") {
            cfg.dirs.data_dir = PathBuf::from(v);
        } else {
            cfg.dirs.data_dir = cfg.dirs.state_dir.join("data");
        }
        if let Ok(v) = std::env::var("AR_CACHE_DIR") {
            cfg.dirs.cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AR_CONFIG_DIR") {
            cfg.dirs.config_dir = PathBuf::from(v);
        }

        if let Ok(v) = std::env::var("AR_MASTER_KEY") {
            cfg.crypto.master_key = v;
        }
        if let Some(v) = env_parse::<u32>("AR_KEY_VERSION") {
            cfg.crypto.key_version = v;
        }
        // Retired keys: AR_RETIRED_KEYS="1:base64,2:base64"
        if let Ok(raw) = std::env::var("AR_RETIRED_KEYS") {
            for pair in raw.split(',') {
                if let Some((ver, key)) = pair.trim().split_once(':') {
                    if let Ok(ver) = ver.parse::<u32>() {
                        cfg.crypto.retired_keys.insert(ver, key.to_string());
                    }
                }
            }
        }

        if let Some(v) = env_parse::<u64>("AR_IDLE_CHECK_INTERVAL_MS") {
            cfg.reaper.check_interval_ms = v;
        }
        if let Some(v) = env_parse::<u32>("AR_IDLE_MINUTES") {
            cfg.reaper.default_idle_minutes = v;
        }
        if let Some(v) = env_parse::<u32>("AR_TERMINATE_MINUTES") {
            cfg.reaper.default_terminate_minutes = v;
        }
        if let Some(v) = env_parse::<u32>("AR_RETENTION_DAYS") {
            cfg.reaper.retention_days = v;
        }

        if let Ok(v) = std::env::var("AR_CONTAINER_ENGINE") {
            cfg.sandbox.container_engine = v;
        }
        if let Ok(v) = std::env::var("AR_VM_LAUNCHER") {
            cfg.sandbox.vm_launcher = v;
        }
        if let Ok(v) = std::env::var("AR_AGENT_COMMAND") {
            cfg.sandbox.agent_command = v;
        }
        if let Ok(v) = std::env::var("AR_DEFAULT_IMAGE") {
            cfg.sandbox.default_image = v;
        }
        if let Some(v) = env_parse::<u64>("AR_STARTUP_TIMEOUT_SEC") {
            cfg.sandbox.startup_timeout_sec = v;
        }

        cfg
    }

    /// Validate the configuration. Error-severity issues are fatal.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.crypto.master_key.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "AR_MASTER_KEY is not set; generate one with `agentrelay generate-key`"
                    .into(),
            });
        } else {
            match BASE64.decode(&self.crypto.master_key) {
                Ok(bytes) if bytes.len() == 32 => {}
                Ok(bytes) => issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!(
                        "AR_MASTER_KEY must decode to 32 bytes, got {}",
                        bytes.len()
                    ),
                }),
                Err(e) => issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!("AR_MASTER_KEY is not valid base64: {e}"),
                }),
            }
        }

        for (ver, key) in &self.crypto.retired_keys {
            if *ver == self.crypto.key_version {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    message: format!(
                        "retired key version {ver} shadows the current key version and is ignored"
                    ),
                });
            }
            if BASE64
                .decode(key)
                .map(|b| b.len() != 32)
                .unwrap_or(true)
            {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!("retired key version {ver} is not a valid base64 256-bit key"),
                });
            }
        }

        if self.reaper.check_interval_ms < 1_000 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "AR_IDLE_CHECK_INTERVAL_MS below 1s will hammer the store".into(),
            });
        }
        if self.reaper.default_terminate_minutes <= self.reaper.default_idle_minutes {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "terminate threshold should exceed the idle threshold".into(),
            });
        }

        if self.sandbox.agent_command.trim().is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "AR_AGENT_COMMAND must not be empty".into(),
            });
        }

        issues
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    3720
}
fn d_state_dir() -> PathBuf {
    PathBuf::from("./state")
}
fn d_data_dir() -> PathBuf {
    PathBuf::from("./state/data")
}
fn d_cache_dir() -> PathBuf {
    PathBuf::from("./state/cache")
}
fn d_config_dir() -> PathBuf {
    PathBuf::from("./state/config")
}
fn d_key_version() -> u32 {
    1
}
fn d_check_interval_ms() -> u64 {
    60_000
}
fn d_idle_minutes() -> u32 {
    30
}
fn d_terminate_minutes() -> u32 {
    240
}
fn d_retention_days() -> u32 {
    30
}
fn d_container_engine() -> String {
    "docker".into()
}
fn d_vm_launcher() -> String {
    "vmctl".into()
}
fn d_agent_command() -> String {
    "agent-shell --stdio".into()
}
fn d_default_image() -> String {
    "agentrelay/sandbox:latest".into()
}
fn d_startup_timeout_sec() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_master_key_is_fatal() {
        let cfg = Config::default();
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("AR_MASTER_KEY")));
    }

    #[test]
    fn valid_key_passes() {
        let mut cfg = Config::default();
        cfg.crypto.master_key = BASE64.encode([7u8; 32]);
        let errors: Vec<_> = cfg
            .validate()
            .into_iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn short_key_is_fatal() {
        let mut cfg = Config::default();
        cfg.crypto.master_key = BASE64.encode([7u8; 16]);
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("32 bytes")));
    }

    #[test]
    fn session_dir_layout() {
        let dirs = DirsConfig::default();
        assert!(dirs
            .session_dir("abc")
            .ends_with("state/sessions/abc"));
    }
}
