//! TOML-based configuration for storesync.
//!
//! The remote URL may embed credentials, so it can be supplied through the
//! `STORESYNC_REMOTE_URL` environment variable instead of the file; see
//! [`VcConfig::apply_env_overrides`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::git::remote_url;

/// Environment variable overriding `remote.url`.
pub const REMOTE_URL_ENV: &str = "STORESYNC_REMOTE_URL";

/// Branch used when no remote says otherwise.
pub const DEFAULT_BRANCH: &str = "master";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcConfig {
    /// The managed data directory and its ignore rules.
    pub store: StoreConfig,

    /// Remote repository to mirror. Absent means local-only.
    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    /// Identity stamped on every commit.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Network behaviour for remote operations.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging settings (consumed by the binary).
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The document store's data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory whose files are versioned.
    #[serde(default)]
    pub data_dir: PathBuf,

    /// Extra glob patterns excluded from every commit, on top of the
    /// built-in transient/settings patterns.
    #[serde(default)]
    pub ignore: Vec<String>,
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Remote repository settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Clone/fetch/push URL. HTTPS URLs may carry `user:password@`.
    pub url: String,

    /// Branch to track (default `master`).
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Whether `push` is permitted (default true).
    #[serde(default = "default_true")]
    pub allow_push: bool,

    /// Username for SSH-agent lookup when the URL does not carry one.
    #[serde(default)]
    pub username: Option<String>,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.into()
}
fn default_true() -> bool {
    true
}

impl RemoteConfig {
    /// A remote on the default branch with pushing enabled.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: default_branch(),
            allow_push: true,
            username: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_allow_push(mut self, allow_push: bool) -> Self {
        self.allow_push = allow_push;
        self
    }

    /// Check the URL scheme and branch name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !remote_url::has_supported_scheme(&self.url) {
            return Err(ConfigError::InvalidRemoteUrl(remote_url::redact(&self.url)));
        }
        if self.branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "remote.branch".into(),
                detail: "branch must not be empty".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Author/committer identity for commits created by storesync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_name")]
    pub name: String,

    #[serde(default = "default_identity_email")]
    pub email: String,
}

fn default_identity_name() -> String {
    "storesync".into()
}
fn default_identity_email() -> String {
    "storesync@localhost".into()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            email: default_identity_email(),
        }
    }
}

// ---------------------------------------------------------------------------
// Network & logging
// ---------------------------------------------------------------------------

/// Bounds applied to clone/fetch/push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Seconds before a remote operation is abandoned (default 60).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    60
}

impl NetworkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl VcConfig {
    /// Configuration for a data directory with every other section defaulted.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig {
                data_dir: data_dir.into(),
                ignore: Vec::new(),
            },
            remote: None,
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Load a [`VcConfig`] from a TOML file at the given path.
    ///
    /// This does **not** apply environment overrides; call
    /// [`apply_env_overrides`](Self::apply_env_overrides) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: VcConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Replace `remote.url` from [`REMOTE_URL_ENV`] when it is set.
    ///
    /// A remote section is created on demand so a local-only file can be
    /// pointed at a remote purely through the environment.
    pub fn apply_env_overrides(&mut self) {
        match std::env::var(REMOTE_URL_ENV) {
            Ok(url) if !url.is_empty() => {
                debug!(env = REMOTE_URL_ENV, url = %remote_url::redact(&url), "remote url overridden");
                match self.remote.as_mut() {
                    Some(remote) => remote.url = url,
                    None => self.remote = Some(RemoteConfig::new(url)),
                }
            }
            Ok(_) => warn!(env = REMOTE_URL_ENV, "env var is set but empty"),
            Err(_) => {}
        }
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingDataDir);
        }
        if let Some(remote) = &self.remote {
            remote.validate()?;
        }
        if self.network.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "network.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.identity.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "identity.name".into(),
                detail: "identity name must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, apply overrides, and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
