use std::path::{Path, PathBuf};

use arbor_events::DEFAULT_BUFFER;
use arbor_runtime::{PoolConfig, SessionConfig, SupervisionConfig, WorkerConfig};
use arbor_security::{SecurityConfig, parse_signing_key};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-topic broadcast buffer; slower subscribers skip what falls out.
    pub buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
        }
    }
}

/// Kernel configuration, usually read from `arbor.toml`.
///
/// ```toml
/// root = ".arbor"
/// allowed_commands = ["echo", "git"]
///
/// [pool]
/// max_workers = 4
/// queue_timeout_ms = 30000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Data directory: journals, snapshots, and exports live under it.
    pub root: PathBuf,
    /// Programs `shell.exec` may run.
    pub allowed_commands: Vec<String>,
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Hex-encoded 32-byte capability signing key. A random key is used when
    /// unset, so capabilities do not survive a restart.
    pub signing_key: Option<String>,
    pub pool: PoolConfig,
    pub security: SecurityConfig,
    pub supervision: SupervisionConfig,
    pub worker: WorkerConfig,
    pub session: SessionConfig,
    pub bus: BusConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".arbor"),
            allowed_commands: vec!["echo".to_owned()],
            log_level: "info".to_owned(),
            signing_key: None,
            pool: PoolConfig::default(),
            security: SecurityConfig::default(),
            supervision: SupervisionConfig::default(),
            worker: WorkerConfig::default(),
            session: SessionConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl KernelConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_workers == 0 {
            return Err(ConfigError::Invalid("pool.max_workers must be at least 1".into()));
        }
        if self.security.max_delegation_depth < self.security.default_delegation_depth {
            return Err(ConfigError::Invalid(
                "security.default_delegation_depth exceeds max_delegation_depth".into(),
            ));
        }
        self.signing_key_bytes()?;
        Ok(())
    }

    pub(crate) fn signing_key_bytes(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        match &self.signing_key {
            None => Ok(None),
            Some(raw) => parse_signing_key(raw).map(Some).ok_or_else(|| {
                ConfigError::Invalid("signing_key must be 64 hex characters".into())
            }),
        }
    }
}
