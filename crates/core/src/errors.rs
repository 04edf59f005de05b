//! Error types for the storesync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`VcError`] enum unifies them for callers that want a single
//! error type. [`VcError::kind`] folds every error into one of the six
//! [`ErrorKind`]s exposed to the host's API layer.

use std::fmt;

use git2::{ErrorClass, ErrorCode};
use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for every version-control operation.
#[derive(Debug, Error)]
pub enum VcError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Git(#[from] GitError),

    /// The caller is not permitted to perform the operation (e.g. push while
    /// pushing is disabled).
    #[error("not authorized: {0}")]
    Authorization(String),
}

impl From<git2::Error> for VcError {
    fn from(err: git2::Error) -> Self {
        VcError::Git(GitError::from(err))
    }
}

impl From<std::io::Error> for VcError {
    fn from(err: std::io::Error) -> Self {
        VcError::Git(GitError::IoError(err))
    }
}

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Coarse classification of a [`VcError`], one per outcome the host's API
/// layer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Network,
    MergeConflict,
    Authorization,
    Io,
}

impl ErrorKind {
    /// Suggested HTTP status for surfacing this kind over a network API.
    pub fn status_code(self) -> u16 {
        match self {
            Self::Configuration => 400,
            Self::Authentication | Self::Authorization => 401,
            Self::MergeConflict => 409,
            Self::Network => 502,
            Self::Io => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Authentication => write!(f, "authentication"),
            Self::Network => write!(f, "network"),
            Self::MergeConflict => write!(f, "merge_conflict"),
            Self::Authorization => write!(f, "authorization"),
            Self::Io => write!(f, "io"),
        }
    }
}

impl VcError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::Git(e) => e.kind(),
        }
    }
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local repository and remote (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The managed directory does not contain a repository.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, remote-tracking ref) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// A commit id did not parse or does not exist.
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// Push was rejected by the remote (e.g. non-fast-forward).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// Both sides changed the same paths; nothing was committed.
    #[error("merge conflict on {} path(s): {}", .paths.len(), .paths.join(", "))]
    MergeConflict { paths: Vec<String> },

    /// The credential chain was exhausted against the remote.
    #[error("authentication failed for '{url}': {detail}")]
    AuthenticationFailed { url: String, detail: String },

    /// Transport-level failure talking to the remote.
    #[error("network error during {operation}: {detail}")]
    Network { operation: String, detail: String },

    /// A remote operation exceeded the configured timeout.
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GitError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Git2Error(e) => classify_git2(e),
            Self::PushRejected { .. } | Self::Network { .. } | Self::Timeout { .. } => {
                ErrorKind::Network
            }
            Self::MergeConflict { .. } => ErrorKind::MergeConflict,
            Self::AuthenticationFailed { .. } => ErrorKind::Authentication,
            Self::RepositoryNotFound(_)
            | Self::RefNotFound(_)
            | Self::CommitNotFound(_)
            | Self::IoError(_) => ErrorKind::Io,
        }
    }

    /// Re-label a raw git2 error coming back from a remote operation so the
    /// message names the operation and the (redacted) URL.
    pub fn from_remote(err: git2::Error, operation: &str, url: &str) -> Self {
        match classify_git2(&err) {
            ErrorKind::Authentication => Self::AuthenticationFailed {
                url: url.to_string(),
                detail: err.message().to_string(),
            },
            ErrorKind::Network => Self::Network {
                operation: operation.to_string(),
                detail: err.message().to_string(),
            },
            _ => Self::Git2Error(err),
        }
    }
}

fn classify_git2(err: &git2::Error) -> ErrorKind {
    match err.code() {
        ErrorCode::Auth | ErrorCode::Certificate => return ErrorKind::Authentication,
        ErrorCode::Conflict | ErrorCode::MergeConflict => return ErrorKind::MergeConflict,
        _ => {}
    }
    match err.class() {
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl => {
            ErrorKind::Network
        }
        _ => ErrorKind::Io,
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// The managed data directory was not provided.
    #[error("data directory is not configured")]
    MissingDataDir,

    /// The remote URL does not use a supported scheme.
    #[error("invalid remote url '{0}': must start with https://, ssh:// or git@")]
    InvalidRemoteUrl(String),

    /// A remote operation was requested but no remote is configured.
    #[error("no remote repository is configured")]
    NoRemote,

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
