//! Commit history enumeration.
//!
//! Walks are lazy: [`CommitIter`] yields one commit per `next()` and holds
//! no lock, so dropping it half way is harmless. Every call starts a fresh
//! walk from the current refs.

use git2::{Oid, Repository, Revwalk, Sort};
use tracing::debug;

use crate::errors::GitError;
use crate::git::client::{tracking_ref, GitClient};
use crate::models::CommitSummary;

/// Lazy sequence of commit summaries.
pub struct CommitIter<'r> {
    repo: &'r Repository,
    walk: Revwalk<'r>,
}

impl Iterator for CommitIter<'_> {
    type Item = Result<CommitSummary, GitError>;

    fn next(&mut self) -> Option<Self::Item> {
        let oid = match self.walk.next()? {
            Ok(oid) => oid,
            Err(e) => return Some(Err(e.into())),
        };
        Some(
            self.repo
                .find_commit(oid)
                .map(|commit| CommitSummary::from(&commit))
                .map_err(GitError::from),
        )
    }
}

/// Produces ordered, restartable views of the commit graph.
pub struct RevisionHistoryWalker<'a> {
    client: &'a GitClient,
}

impl<'a> RevisionHistoryWalker<'a> {
    pub fn new(client: &'a GitClient) -> Self {
        Self { client }
    }

    /// Every commit reachable from HEAD, newest first. Empty when HEAD is
    /// unborn.
    pub fn history(&self) -> Result<CommitIter<'a>, GitError> {
        let repo = self.client.repo();
        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TIME)?;
        if !self.client.is_unborn() {
            walk.push_head()?;
        }
        Ok(CommitIter { repo, walk })
    }

    /// Commits reachable from HEAD but not from the remote-tracking ref for
    /// `branch` (the current branch when `None`), oldest first.
    ///
    /// If the remote-tracking ref does not exist nothing has been pushed, so
    /// the whole history is unpushed.
    pub fn local_commits(&self, branch: Option<&str>) -> Result<CommitIter<'a>, GitError> {
        let repo = self.client.repo();
        let branch = match branch {
            Some(b) => b.to_string(),
            None => self.client.current_branch()?,
        };
        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        if !self.client.is_unborn() {
            walk.push_head()?;
        }
        match self.client.tracking_oid(&branch)? {
            Some(remote_tip) => walk.hide(remote_tip)?,
            None => debug!(tracking = %tracking_ref(&branch), "no remote-tracking ref, nothing pushed"),
        }
        Ok(CommitIter { repo, walk })
    }

    /// Whether `target` is reachable from HEAD, found by walking local
    /// history.
    pub fn contains(&self, target: Oid) -> Result<bool, GitError> {
        if self.client.is_unborn() {
            return Ok(false);
        }
        let mut walk = self.client.repo().revwalk()?;
        walk.push_head()?;
        for oid in walk {
            if oid? == target {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
