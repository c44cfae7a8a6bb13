//! Configuration types and loading
//!
//! Every component receives the pieces of [`AppConfig`] it needs at
//! construction time; nothing reads the environment behind the caller's back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "ATTACHEABLE";

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where originals and variants live
    pub storage: StorageConfig,

    /// External image tools
    pub tools: ToolsConfig,

    /// Remote copy of committed originals
    pub replication: ReplicationConfig,

    /// Log output
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage root; type path prefixes are resolved against it
    pub root: PathBuf,
    /// Directory (relative to `root`) that public paths are computed from
    pub public_root: PathBuf,
    /// Staging directory for uploads (system temp dir when unset)
    pub tmp_dir: Option<PathBuf>,
    /// Maximum accepted upload size in bytes
    pub max_upload_size: u64,
    /// Unix mode applied to committed originals
    pub file_mode: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            public_root: PathBuf::from("public"),
            tmp_dir: None,
            max_upload_size: 100 * 1024 * 1024, // 100 MB
            file_mode: 0o644,
        }
    }
}

impl StorageConfig {
    /// Directory uploads are staged into before commit
    pub fn staging_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Absolute base that public paths are made relative to
    pub fn public_base(&self) -> PathBuf {
        self.root.join(&self.public_root)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Inspection command (`identify` compatible)
    pub identify: PathBuf,
    /// Conversion command (`convert` compatible)
    pub convert: PathBuf,
    /// Upper bound for a single tool invocation
    pub timeout_seconds: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            identify: PathBuf::from("identify"),
            convert: PathBuf::from("convert"),
            timeout_seconds: 60,
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub ssh: PathBuf,
    pub scp: PathBuf,
    /// Upper bound for each remote command
    pub timeout_seconds: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            ssh: PathBuf::from("ssh"),
            scp: PathBuf::from("scp"),
            timeout_seconds: 120,
        }
    }
}

impl ReplicationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub filter: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("Config file error: {0}")]
    FileError(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::FileError(err.to_string())
    }
}

impl AppConfig {
    /// Load configuration from `ATTACHEABLE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Storage
        if let Ok(root) = std::env::var("ATTACHEABLE_ROOT") {
            config.storage.root = PathBuf::from(root);
        }
        if let Ok(public_root) = std::env::var("ATTACHEABLE_PUBLIC_ROOT") {
            config.storage.public_root = PathBuf::from(public_root);
        }
        if let Ok(tmp) = std::env::var("ATTACHEABLE_TMP_DIR") {
            config.storage.tmp_dir = Some(PathBuf::from(tmp));
        }
        if let Ok(size) = std::env::var("ATTACHEABLE_MAX_UPLOAD_SIZE") {
            config.storage.max_upload_size = parse_number("ATTACHEABLE_MAX_UPLOAD_SIZE", &size)?;
        }
        if let Ok(mode) = std::env::var("ATTACHEABLE_FILE_MODE") {
            config.storage.file_mode = u32::from_str_radix(mode.trim_start_matches("0o"), 8)
                .map_err(|e| ConfigError::InvalidValue {
                    key: "ATTACHEABLE_FILE_MODE".to_string(),
                    message: e.to_string(),
                })?;
        }

        // Tools
        if let Ok(identify) = std::env::var("ATTACHEABLE_IDENTIFY") {
            config.tools.identify = PathBuf::from(identify);
        }
        if let Ok(convert) = std::env::var("ATTACHEABLE_CONVERT") {
            config.tools.convert = PathBuf::from(convert);
        }
        if let Ok(timeout) = std::env::var("ATTACHEABLE_TOOL_TIMEOUT") {
            config.tools.timeout_seconds = parse_number("ATTACHEABLE_TOOL_TIMEOUT", &timeout)?;
        }

        // Replication
        if let Ok(ssh) = std::env::var("ATTACHEABLE_SSH") {
            config.replication.ssh = PathBuf::from(ssh);
        }
        if let Ok(scp) = std::env::var("ATTACHEABLE_SCP") {
            config.replication.scp = PathBuf::from(scp);
        }
        if let Ok(timeout) = std::env::var("ATTACHEABLE_REPLICA_TIMEOUT") {
            config.replication.timeout_seconds =
                parse_number("ATTACHEABLE_REPLICA_TIMEOUT", &timeout)?;
        }

        // Logging
        if let Ok(filter) = std::env::var("ATTACHEABLE_LOG") {
            config.logging.filter = Some(filter);
        }
        if let Ok(v) = std::env::var("ATTACHEABLE_LOG_JSON") {
            config.logging.json = v == "true" || v == "1" || v == "yes";
        }

        Ok(config)
    }

    /// Load defaults, then `path` (any format the `config` crate knows by
    /// extension), then `ATTACHEABLE__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            tracing::debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.max_upload_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "storage.max_upload_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.tools.timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "tools.timeout_seconds".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected an integer, got {:?}", value),
    })
}
