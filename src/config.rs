//! Configuration types for sandboxes and the bundled grains

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a settings file to load
pub const SETTINGS_ENV: &str = "GRAIN_SANDBOX_SETTINGS";

/// Top-level fixture configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FixtureConfig {
    /// Sandbox directory settings
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Defaults for the web server grain
    #[serde(default)]
    pub web_server: WebServerConfig,

    /// Defaults for the database grain
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Sandbox directory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Directory under which sandbox directories are placed (system temp dir when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_root: Option<PathBuf>,

    /// Prefix of every sandbox directory name
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Directory reclamation retry policy
    #[serde(default)]
    pub reclaim: ReclaimPolicy,
}

/// Bounded retry policy for removing a sandbox directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimPolicy {
    /// Maximum number of delete attempts
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Pause between attempts, in milliseconds
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
}

/// Web server grain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebServerConfig {
    /// Server executable, resolved on PATH when not absolute
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments; `{root}`, `{port}`, `{https_port}` and `{site}` are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Extra environment for the server process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Output line announcing readiness (matched case-insensitively).
    /// When unset the server is ready once its first endpoint accepts connections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_message: Option<String>,

    /// How long to wait for readiness
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// How long a stopped server may take to exit before it is killed
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Directory inside the sandbox the site is copied to
    #[serde(default = "default_site_dir")]
    pub site_dir: String,

    /// Fixed port for https bindings (a free port is picked when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_port: Option<u16>,
}

/// Database grain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Directory inside the sandbox holding database files
    #[serde(default = "default_data_dir")]
    pub directory: String,

    /// Prefix for generated database names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_prefix() -> String {
    "sandbox_".to_string()
}

fn default_attempts() -> u32 {
    3
}

fn default_pause_ms() -> u64 {
    1
}

fn default_program() -> String {
    "python3".to_string()
}

fn default_args() -> Vec<String> {
    ["-m", "http.server", "{port}", "--bind", "127.0.0.1", "--directory", "{root}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_site_dir() -> String {
    "Web".to_string()
}

fn default_data_dir() -> String {
    "Data".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            temp_root: None,
            prefix: default_prefix(),
            reclaim: ReclaimPolicy::default(),
        }
    }
}

impl SandboxConfig {
    /// Directory sandboxes are created under
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            pause_ms: default_pause_ms(),
        }
    }
}

impl ReclaimPolicy {
    /// Pause between delete attempts
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

impl Default for WebServerConfig {
    fn default() -> Self {
        let mut env = HashMap::new();
        // python buffers stdout when piped, which hides the banner
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        Self {
            program: default_program(),
            args: default_args(),
            env,
            ready_message: None,
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            site_dir: default_site_dir(),
            https_port: None,
        }
    }
}

impl WebServerConfig {
    /// Readiness deadline
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Grace period after a stop request
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            directory: default_data_dir(),
            prefix: None,
            max_connections: default_max_connections(),
        }
    }
}

impl FixtureConfig {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from `GRAIN_SANDBOX_SETTINGS`, then the default settings path, then defaults
    pub fn load() -> crate::Result<Self> {
        if let Some(path) = std::env::var_os(SETTINGS_ENV) {
            let config = Self::from_file(Path::new(&path))?;
            config.validate()?;
            return Ok(config);
        }

        let default_path = Self::default_settings_path();
        let config = if default_path.exists() {
            Self::from_file(&default_path)?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        use crate::error::SandboxError;

        if self.sandbox.reclaim.attempts == 0 {
            return Err(SandboxError::Config(
                "reclaim.attempts must be at least 1".to_string(),
            ));
        }

        if self.sandbox.prefix.contains(std::path::is_separator) {
            return Err(SandboxError::Config(format!(
                "sandbox prefix '{}' must not contain a path separator",
                self.sandbox.prefix
            )));
        }

        if self.web_server.program.trim().is_empty() {
            return Err(SandboxError::Config(
                "webServer.program must not be empty".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(SandboxError::Config(
                "database.maxConnections must be at least 1".to_string(),
            ));
        }

        if self.sandbox.temp_root.is_none() {
            tracing::debug!("No temp root configured, using the system temp directory");
        }

        Ok(())
    }

    /// Get default settings path
    pub fn default_settings_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".grain-sandbox.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serialization() {
        let config = FixtureConfig {
            sandbox: SandboxConfig {
                prefix: "fixture_".to_string(),
                ..Default::default()
            },
            database: DatabaseConfig {
                prefix: Some("orders".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: FixtureConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.sandbox.prefix, "fixture_");
        assert_eq!(parsed.database.prefix.as_deref(), Some("orders"));
        assert_eq!(parsed.sandbox.reclaim, ReclaimPolicy::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: FixtureConfig =
            serde_json::from_str(r#"{"webServer":{"readyMessage":"listening"}}"#).unwrap();

        assert_eq!(parsed.sandbox.prefix, "sandbox_");
        assert_eq!(parsed.sandbox.reclaim.attempts, 3);
        assert_eq!(parsed.web_server.ready_message.as_deref(), Some("listening"));
        assert_eq!(parsed.web_server.program, "python3");
        assert_eq!(parsed.database.directory, "Data");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut config = FixtureConfig::default();
        config.web_server.https_port = Some(44399);
        config.to_file(&path).unwrap();

        let loaded = FixtureConfig::from_file(&path).unwrap();
        assert_eq!(loaded.web_server.https_port, Some(44399));
    }

    // Both `load` sources live in process-wide environment, so they share one test
    #[test]
    fn test_load_prefers_env_then_home() {
        let dir = tempfile::tempdir().unwrap();
        let previous_home = std::env::var_os("HOME");

        let settings = dir.path().join("settings.json");
        std::fs::write(&settings, r#"{"sandbox":{"prefix":"from_env_"}}"#).unwrap();
        std::env::set_var(SETTINGS_ENV, &settings);
        let loaded = FixtureConfig::load();

        std::fs::write(&settings, r#"{"sandbox":{"reclaim":{"attempts":0}}}"#).unwrap();
        let invalid = FixtureConfig::load();
        std::env::remove_var(SETTINGS_ENV);

        let home = dir.path().join("home");
        std::fs::create_dir(&home).unwrap();
        std::fs::write(
            home.join(".grain-sandbox.json"),
            r#"{"database":{"prefix":"from_home"}}"#,
        )
        .unwrap();
        std::env::set_var("HOME", &home);
        let from_home = FixtureConfig::load();
        let home_path = FixtureConfig::default_settings_path();

        std::fs::remove_file(home.join(".grain-sandbox.json")).unwrap();
        let defaults = FixtureConfig::load();

        match previous_home {
            Some(value) => std::env::set_var("HOME", value),
            None => std::env::remove_var("HOME"),
        }

        assert_eq!(loaded.unwrap().sandbox.prefix, "from_env_");
        assert!(matches!(invalid, Err(crate::SandboxError::Config(_))));
        assert_eq!(home_path, home.join(".grain-sandbox.json"));
        assert_eq!(from_home.unwrap().database.prefix.as_deref(), Some("from_home"));
        let defaults = defaults.unwrap();
        assert_eq!(defaults.sandbox.prefix, "sandbox_");
        assert!(defaults.database.prefix.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = FixtureConfig::default();
        config.sandbox.reclaim.attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_prefix_with_separator() {
        let mut config = FixtureConfig::default();
        config.sandbox.prefix = "a/b".to_string();
        assert!(config.validate().is_err());
    }
}
