//! Service configuration and runtime tunables.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("unknown tunable: {0}")]
    UnknownTunable(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public TCP listener port.
    pub port: u16,
    /// Control-plane socket path.
    pub admin_socket: PathBuf,
    /// Service root; `processing/`, `outgoing/` and `logs/` live under it.
    pub root: PathBuf,
    pub max_clients: usize,
    pub max_queued_jobs: usize,
    /// Seconds of client inactivity before teardown.
    pub client_timeout_secs: u64,
    /// Seconds of admin inactivity before teardown.
    pub admin_timeout_secs: u64,
    pub compile_timeout_secs: u64,
    pub execution_timeout_secs: u64,
    /// Upload size cap in bytes.
    pub max_file_size: u64,
    /// Per-stream capture cap in bytes.
    pub max_output_size: u64,
    /// Seconds a terminal job survives before the retirement sweep.
    pub job_retention_secs: u64,
    /// Sweeper period in seconds.
    pub sweep_interval_secs: u64,
    /// Mirror logs into `logs/` via a rolling file sink.
    pub log_to_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            admin_socket: PathBuf::from("/tmp/code_server_admin.sock"),
            root: std::env::temp_dir().join("smeltd"),
            max_clients: 1000,
            max_queued_jobs: 256,
            client_timeout_secs: 300,
            admin_timeout_secs: 1800,
            compile_timeout_secs: 60,
            execution_timeout_secs: 30,
            max_file_size: 8 * 1024 * 1024,
            max_output_size: 1024 * 1024,
            job_retention_secs: 3600,
            sweep_interval_secs: 10,
            log_to_file: false,
        }
    }
}

impl Config {
    /// Load from a TOML file. An explicitly named file that is missing or
    /// malformed is a startup failure, not a silent fallback.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be >= 1".into()));
        }
        if self.max_queued_jobs == 0 {
            return Err(ConfigError::Invalid("max_queued_jobs must be >= 1".into()));
        }
        for (name, value) in [
            ("client_timeout_secs", self.client_timeout_secs),
            ("admin_timeout_secs", self.admin_timeout_secs),
            ("compile_timeout_secs", self.compile_timeout_secs),
            ("execution_timeout_secs", self.execution_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be >= 1")));
            }
        }
        if self.max_file_size == 0 || self.max_file_size > crate::proto::MAX_PAYLOAD_LEN as u64 {
            return Err(ConfigError::Invalid(format!(
                "max_file_size must be within 1..={}",
                crate::proto::MAX_PAYLOAD_LEN
            )));
        }
        Ok(())
    }
}

/// The tunables the control plane may read and write at runtime.
///
/// Kept as atomics so hot paths (session reads, worker timeouts) never take
/// a lock for them.
#[derive(Debug)]
pub struct Tunables {
    client_timeout_secs: AtomicU64,
    admin_timeout_secs: AtomicU64,
    compile_timeout_secs: AtomicU64,
    execution_timeout_secs: AtomicU64,
    max_file_size: AtomicU64,
    max_output_size: AtomicU64,
    job_retention_secs: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunableKey {
    ClientTimeout,
    AdminTimeout,
    CompileTimeout,
    ExecutionTimeout,
    MaxFileSize,
    MaxOutputSize,
    JobRetention,
}

impl TunableKey {
    pub const ALL: [TunableKey; 7] = [
        TunableKey::ClientTimeout,
        TunableKey::AdminTimeout,
        TunableKey::CompileTimeout,
        TunableKey::ExecutionTimeout,
        TunableKey::MaxFileSize,
        TunableKey::MaxOutputSize,
        TunableKey::JobRetention,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TunableKey::ClientTimeout => "client_timeout",
            TunableKey::AdminTimeout => "admin_timeout",
            TunableKey::CompileTimeout => "compile_timeout",
            TunableKey::ExecutionTimeout => "execution_timeout",
            TunableKey::MaxFileSize => "max_file_size",
            TunableKey::MaxOutputSize => "max_output_size",
            TunableKey::JobRetention => "job_retention",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        TunableKey::ALL.into_iter().find(|key| key.as_str() == raw)
    }
}

impl fmt::Display for TunableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Tunables {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client_timeout_secs: AtomicU64::new(config.client_timeout_secs),
            admin_timeout_secs: AtomicU64::new(config.admin_timeout_secs),
            compile_timeout_secs: AtomicU64::new(config.compile_timeout_secs),
            execution_timeout_secs: AtomicU64::new(config.execution_timeout_secs),
            max_file_size: AtomicU64::new(config.max_file_size),
            max_output_size: AtomicU64::new(config.max_output_size),
            job_retention_secs: AtomicU64::new(config.job_retention_secs),
        }
    }

    fn cell(&self, key: TunableKey) -> &AtomicU64 {
        match key {
            TunableKey::ClientTimeout => &self.client_timeout_secs,
            TunableKey::AdminTimeout => &self.admin_timeout_secs,
            TunableKey::CompileTimeout => &self.compile_timeout_secs,
            TunableKey::ExecutionTimeout => &self.execution_timeout_secs,
            TunableKey::MaxFileSize => &self.max_file_size,
            TunableKey::MaxOutputSize => &self.max_output_size,
            TunableKey::JobRetention => &self.job_retention_secs,
        }
    }

    pub fn get(&self, key: TunableKey) -> u64 {
        self.cell(key).load(Ordering::Relaxed)
    }

    pub fn set(&self, key: TunableKey, value: u64) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                key: key.as_str(),
                reason: "must be >= 1".into(),
            });
        }
        if key == TunableKey::MaxFileSize && value > crate::proto::MAX_PAYLOAD_LEN as u64 {
            return Err(ConfigError::InvalidValue {
                key: key.as_str(),
                reason: format!("must be <= {}", crate::proto::MAX_PAYLOAD_LEN),
            });
        }
        self.cell(key).store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.get(TunableKey::ClientTimeout))
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.get(TunableKey::AdminTimeout))
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.get(TunableKey::CompileTimeout))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.get(TunableKey::ExecutionTimeout))
    }

    pub fn max_file_size(&self) -> u64 {
        self.get(TunableKey::MaxFileSize)
    }

    pub fn max_output_size(&self) -> usize {
        self.get(TunableKey::MaxOutputSize) as usize
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.get(TunableKey::JobRetention))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut config = Config::default();
        config.compile_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smeltd.toml");
        std::fs::write(&path, "port = 9090\nmax_queued_jobs = 4\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.max_queued_jobs, 4);
        // Unspecified fields keep their defaults.
        assert_eq!(config.client_timeout_secs, 300);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smeltd.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn tunable_whitelist_round_trip() {
        let tunables = Tunables::from_config(&Config::default());
        for key in TunableKey::ALL {
            assert_eq!(TunableKey::parse(key.as_str()), Some(key));
        }
        assert_eq!(TunableKey::parse("not_a_key"), None);

        tunables.set(TunableKey::ExecutionTimeout, 5).unwrap();
        assert_eq!(tunables.execution_timeout(), Duration::from_secs(5));
        assert!(tunables.set(TunableKey::ExecutionTimeout, 0).is_err());
        assert!(tunables
            .set(TunableKey::MaxFileSize, u64::MAX)
            .is_err());
    }
}
