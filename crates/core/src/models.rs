//! Domain model types shared by the engine and whatever exposes it.
//!
//! Everything here serializes to the JSON shapes the store's UI consumes.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Changes
// ---------------------------------------------------------------------------

/// How a path differs between two snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    /// Absent in the old snapshot, present in the new one.
    Insert,
    /// Present in the old snapshot, absent in the new one.
    Remove,
    /// Present in both with different content.
    Update,
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Remove => write!(f, "remove"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// One changed file between two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// `/`-rooted path relative to the managed directory.
    pub path: String,
    /// First segment of the relative path (the logical collection).
    pub entity_set: String,
    pub operation: ChangeOperation,
    /// Unified diff text for this file.
    pub patch: String,
}

impl Change {
    /// Build a change for a repository-relative path.
    pub fn new(rel_path: &str, operation: ChangeOperation, patch: String) -> Self {
        let entity_set = rel_path.split('/').next().unwrap_or_default().to_string();
        Self {
            path: format!("/{rel_path}"),
            entity_set,
            operation,
            patch,
        }
    }
}

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

/// History entry: what the commit list needs and nothing more.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub message: String,
    pub date: DateTime<Utc>,
}

/// A commit created or inspected by storesync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commit {
    #[serde(rename = "_id")]
    pub id: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
    pub date: DateTime<Utc>,
    /// Zero for the root commit, two for a merge commit.
    pub parents: Vec<String>,
}

impl From<&git2::Commit<'_>> for Commit {
    fn from(commit: &git2::Commit<'_>) -> Self {
        let author = commit.author();
        let committer = commit.committer();
        Self {
            id: commit.id().to_string(),
            message: commit.message().unwrap_or("").to_string(),
            author_name: author.name().unwrap_or("").to_string(),
            author_email: author.email().unwrap_or("").to_string(),
            committer_name: committer.name().unwrap_or("").to_string(),
            committer_email: committer.email().unwrap_or("").to_string(),
            date: git_time_to_utc(commit.time()),
            parents: commit.parent_ids().map(|id| id.to_string()).collect(),
        }
    }
}

impl From<&git2::Commit<'_>> for CommitSummary {
    fn from(commit: &git2::Commit<'_>) -> Self {
        Self {
            id: commit.id().to_string(),
            message: commit.message().unwrap_or("").to_string(),
            date: git_time_to_utc(commit.time()),
        }
    }
}

fn git_time_to_utc(time: git2::Time) -> DateTime<Utc> {
    Utc.timestamp_opt(time.seconds(), 0)
        .single()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

/// Relationship between the local branch tip and the remote-tracking tip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SyncState {
    UpToDate,
    Ahead { commits: usize },
    Behind { commits: usize },
    Diverged { ahead: usize, behind: usize },
    /// No remote configured, or the remote branch does not exist yet.
    NoRemote,
}

impl SyncState {
    pub fn from_ahead_behind(ahead: usize, behind: usize) -> Self {
        match (ahead, behind) {
            (0, 0) => Self::UpToDate,
            (a, 0) => Self::Ahead { commits: a },
            (0, b) => Self::Behind { commits: b },
            (a, b) => Self::Diverged { ahead: a, behind: b },
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up to date"),
            Self::Ahead { commits } => write!(f, "ahead by {commits}"),
            Self::Behind { commits } => write!(f, "behind by {commits}"),
            Self::Diverged { ahead, behind } => {
                write!(f, "diverged ({ahead} ahead, {behind} behind)")
            }
            Self::NoRemote => write!(f, "no remote"),
        }
    }
}
