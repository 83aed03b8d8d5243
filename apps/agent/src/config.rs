//! Agent configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/loadstream/agent.toml`
//! - Windows: `%APPDATA%/loadstream/agent.toml`
//!
//! Missing fields fall back to their defaults, so a hand-edited partial
//! file keeps working across upgrades.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use loadstream_engine::AgentConfig;

/// On-disk agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Display name of this agent (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Coordinator base URL.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Local WebSocket port for the UI.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// Directory holding the state database (platform data dir by default).
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Target part size in MiB.
    #[serde(default = "default_part_size_mib")]
    pub part_size_mib: u64,

    /// Worker pool sizing.
    #[serde(default = "default_workers_min")]
    pub workers_min: usize,
    #[serde(default = "default_workers_max")]
    pub workers_max: usize,
    #[serde(default = "default_true")]
    pub workers_auto: bool,

    /// Presigned-URL prefetching.
    #[serde(default = "default_presign_batch_size")]
    pub presign_batch_size: usize,
    #[serde(default = "default_presign_lookahead")]
    pub presign_lookahead: usize,

    /// Retry schedule.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Per-part PUT deadline in seconds.
    #[serde(default = "default_http_timeout_s")]
    pub http_timeout_s: u64,

    /// Progress push cadence in milliseconds.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Loadstream Agent".into())
}

fn default_backend_url() -> String {
    "http://localhost:8000".into()
}

fn default_ws_port() -> u16 {
    8765
}

fn default_part_size_mib() -> u64 {
    128
}

fn default_workers_min() -> usize {
    1
}

fn default_workers_max() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_presign_batch_size() -> usize {
    20
}

fn default_presign_lookahead() -> usize {
    50
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_http_timeout_s() -> u64 {
    300
}

fn default_progress_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            backend_url: default_backend_url(),
            ws_port: default_ws_port(),
            data_dir: None,
            part_size_mib: default_part_size_mib(),
            workers_min: default_workers_min(),
            workers_max: default_workers_max(),
            workers_auto: true,
            presign_batch_size: default_presign_batch_size(),
            presign_lookahead: default_presign_lookahead(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            http_timeout_s: default_http_timeout_s(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path()?;

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Saves the current configuration to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = config_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Directory for the state database.
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => Ok(default_data_dir()?),
        }
    }

    /// The engine's immutable snapshot of these tunables.
    pub fn engine_config(&self) -> AgentConfig {
        AgentConfig {
            part_size_bytes: self.part_size_mib * 1024 * 1024,
            workers_min: self.workers_min,
            workers_max: self.workers_max,
            workers_auto: self.workers_auto,
            presign_batch_size: self.presign_batch_size,
            presign_lookahead: self.presign_lookahead,
            retry_max_attempts: self.retry_max_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
            retry_max_delay_ms: self.retry_max_delay_ms,
            http_timeout_s: self.http_timeout_s,
            progress_interval_ms: self.progress_interval_ms,
            ws_port: self.ws_port,
            backend_url: self.backend_url.clone(),
            ..AgentConfig::default()
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    Ok(config_root()?.join("agent.toml"))
}

fn config_root() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home).join(".config").join("loadstream"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("loadstream"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/loadstream"))
    }
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    Ok(config_root()?.join("data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.name.is_empty());
        assert_eq!(config.backend_url, "http://localhost:8000");
        assert_eq!(config.ws_port, 8765);
        assert_eq!(config.part_size_mib, 128);
        assert!(config.workers_auto);
        assert_eq!(config.retry_max_attempts, 3);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config {
            name: "TestAgent".into(),
            backend_url: "http://backend:9000".into(),
            ws_port: 9999,
            part_size_mib: 64,
            workers_auto: false,
            workers_max: 2,
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.name, "TestAgent");
        assert_eq!(parsed.backend_url, "http://backend:9000");
        assert_eq!(parsed.ws_port, 9999);
        assert_eq!(parsed.part_size_mib, 64);
        assert!(!parsed.workers_auto);
        assert_eq!(parsed.workers_max, 2);
    }

    #[test]
    fn config_partial_toml() {
        // Only specify the backend, rest should use defaults.
        let toml_str = r#"backend_url = "http://lan-backend:8000""#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend_url, "http://lan-backend:8000");
        assert_eq!(config.ws_port, 8765);
        assert_eq!(config.presign_lookahead, 50);
    }

    #[test]
    fn engine_config_mapping() {
        let config = Config {
            part_size_mib: 64,
            http_timeout_s: 120,
            ..Config::default()
        };
        let engine = config.engine_config();
        assert_eq!(engine.part_size_bytes, 64 * 1024 * 1024);
        assert_eq!(engine.http_timeout_s, 120);
        // Storage bounds are not user-tunable.
        assert_eq!(engine.min_part_size_mib, 5);
        assert_eq!(engine.max_part_size_mib, 512);
        assert_eq!(engine.max_parts, 10_000);
    }

    #[test]
    fn config_file_roundtrip_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.toml");

        let config = Config {
            name: "SaveTest".into(),
            ..Config::default()
        };

        // Write manually since save() uses config_path().
        let content = toml::to_string_pretty(&config).unwrap();
        std::fs::write(&path, &content).unwrap();

        let loaded: Config =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.name, "SaveTest");
        assert_eq!(loaded.ws_port, config.ws_port);
    }

    #[test]
    fn explicit_data_dir_wins() {
        let config = Config {
            data_dir: Some("/var/lib/loadstream".into()),
            ..Config::default()
        };
        assert_eq!(
            config.data_dir().unwrap(),
            PathBuf::from("/var/lib/loadstream")
        );
    }
}
