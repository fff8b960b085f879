//! Bridge configuration: JSON file, defaults for anything missing, then
//! environment overrides.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use super::error::{BridgeError, BridgeResult};

pub const ENV_STORAGE_PATH: &str = "CORTEX_STORAGE_PATH";
pub const ENV_CALL_TIMEOUT_SECS: &str = "CORTEX_CALL_TIMEOUT_SECS";
pub const ENV_LOG_LEVEL: &str = "CORTEX_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Prefix accepted in front of channel names (`<namespace>/memory`).
    pub channel_namespace: String,
    /// Any path on the volume the storage probes measure.
    pub storage_path: PathBuf,
    pub call_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_namespace: "com.vertex.cortex".to_string(),
            storage_path: default_storage_path(),
            call_timeout_secs: 300,
            startup_timeout_secs: 30,
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Apply `CORTEX_*` overrides looked up through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> BridgeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_STORAGE_PATH) {
            self.storage_path = PathBuf::from(path);
        }
        if let Some(secs) = lookup(ENV_CALL_TIMEOUT_SECS) {
            self.call_timeout_secs = secs.trim().parse().map_err(|e| {
                BridgeError::Config(format!("{ENV_CALL_TIMEOUT_SECS}={secs}: {e}"))
            })?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        Ok(())
    }

    fn validate(&self) -> BridgeResult<()> {
        if self.call_timeout_secs == 0 {
            return Err(BridgeError::Config("call_timeout_secs must be positive".into()));
        }
        if self.startup_timeout_secs == 0 {
            return Err(BridgeError::Config(
                "startup_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Separate child process (crash isolation, memory reclaim on kill).
    #[default]
    Process,
    /// Dedicated thread inside the host process.
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable; the current executable when unset.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub mode: WorkerMode,
    /// Artificial delay per model operation in the mock backend.
    pub mock_latency_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["--worker".to_string()],
            mode: WorkerMode::Process,
            mock_latency_ms: 0,
        }
    }
}

impl WorkerConfig {
    pub fn mock_latency(&self) -> Duration {
        Duration::from_millis(self.mock_latency_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub level: String,
    /// Write a timestamped log file in `dir` besides stderr.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            level: "info".to_string(),
            file: true,
        }
    }
}

/// Load configuration from `path` (defaults when absent), then apply the
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> BridgeResult<BridgeConfig> {
    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => BridgeConfig::default(),
    };
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn read_config_file(path: &Path) -> BridgeResult<BridgeConfig> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("Config file {} not found, using defaults", path.display());
            Ok(BridgeConfig::default())
        }
        Err(e) => Err(BridgeError::Config(format!("{}: {e}", path.display()))),
    }
}

fn default_storage_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.channel_namespace, "com.vertex.cortex");
        assert_eq!(config.call_timeout(), Duration::from_secs(300));
        assert_eq!(config.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.worker.args, vec!["--worker"]);
        assert_eq!(config.worker.mode, WorkerMode::Process);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = read_config_file(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        fs::write(
            &path,
            r#"{
                "call_timeout_secs": 12,
                "worker": { "mode": "in_process", "mock_latency_ms": 250 },
                "logging": { "file": false }
            }"#,
        )
        .unwrap();

        let config = read_config_file(&path).unwrap();
        assert_eq!(config.call_timeout_secs, 12);
        assert_eq!(config.worker.mode, WorkerMode::InProcess);
        assert_eq!(config.worker.mock_latency(), Duration::from_millis(250));
        assert_eq!(config.worker.args, vec!["--worker"]);
        assert!(!config.logging.file);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.startup_timeout_secs, 30);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
        assert_eq!(err.code(), "CONFIG");
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        fs::write(&path, r#"{ "startup_timeout_secs": 0 }"#).unwrap();

        assert!(matches!(
            load_config(Some(&path)),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_STORAGE_PATH, "/data"),
            (ENV_CALL_TIMEOUT_SECS, " 45 "),
            (ENV_LOG_LEVEL, "debug"),
        ]);

        let mut config = BridgeConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.storage_path, PathBuf::from("/data"));
        assert_eq!(config.call_timeout_secs, 45);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_bad_env_timeout_is_config_error() {
        let mut config = BridgeConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == ENV_CALL_TIMEOUT_SECS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
        assert_eq!(config.call_timeout_secs, 300);
    }
}
