//! Synchronization with the configured remote.
//!
//! The [`SyncEngine`] covers the three remote-facing steps a host walks
//! through when local and remote work have diverged:
//!
//! 1. [`status`](SyncEngine::status): fetch and report what the remote has
//!    that HEAD does not.
//! 2. [`merge`](SyncEngine::merge): three-way merge of the remote-tracking
//!    tip into HEAD. Conflicts abort with nothing committed.
//! 3. [`push`](SyncEngine::push): publish the current branch, subject to the
//!    injected [`PushPolicy`].

use std::sync::atomic::{AtomicBool, Ordering};

use git2::build::CheckoutBuilder;
use git2::{MergeOptions, Oid};
use tracing::{debug, info, warn};

use crate::config::{IdentityConfig, RemoteConfig};
use crate::errors::{GitError, VcError};
use crate::git::changeset::{ChangeSetExtractor, SnapshotRef};
use crate::git::client::{tracking_ref, GitClient, ORIGIN};
use crate::git::credentials::CredentialNegotiator;
use crate::git::history::RevisionHistoryWalker;
use crate::ignore_policy::IgnorePolicy;
use crate::models::{Change, Commit, SyncState};

// ---------------------------------------------------------------------------
// Push policy
// ---------------------------------------------------------------------------

/// Decides whether `push` may run. Injected by the host.
pub trait PushPolicy: Send + Sync {
    fn push_allowed(&self) -> bool;
}

impl PushPolicy for bool {
    fn push_allowed(&self) -> bool {
        *self
    }
}

/// Runtime-switchable policy.
impl PushPolicy for AtomicBool {
    fn push_allowed(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Remote synchronization for one open repository.
pub struct SyncEngine<'a> {
    client: &'a GitClient,
    remote: &'a RemoteConfig,
    negotiator: CredentialNegotiator,
    identity: &'a IdentityConfig,
    policy: &'a IgnorePolicy,
    push_policy: &'a dyn PushPolicy,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        client: &'a GitClient,
        remote: &'a RemoteConfig,
        identity: &'a IdentityConfig,
        policy: &'a IgnorePolicy,
        push_policy: &'a dyn PushPolicy,
    ) -> Self {
        Self {
            client,
            remote,
            negotiator: CredentialNegotiator::new(remote.url.clone(), remote.username.clone()),
            identity,
            policy,
            push_policy,
        }
    }

    /// Update the remote-tracking ref. `None` when the remote branch does
    /// not exist.
    pub fn fetch(&self) -> Result<Option<Oid>, GitError> {
        self.client.ensure_origin(&self.remote.url)?;
        self.client.fetch(&self.remote.branch, &self.negotiator)
    }

    /// Changes the remote has that HEAD lacks; empty when up to date.
    pub fn status(&self) -> Result<Vec<Change>, GitError> {
        let Some(remote_tip) = self.fetch()? else {
            debug!(branch = %self.remote.branch, "remote branch does not exist");
            return Ok(Vec::new());
        };
        if RevisionHistoryWalker::new(self.client).contains(remote_tip)? {
            debug!(tip = %remote_tip, "remote tip already in local history");
            return Ok(Vec::new());
        }
        let local = match self.client.head_commit()? {
            Some(head) => SnapshotRef::Commit(head.id()),
            None => SnapshotRef::Empty,
        };
        ChangeSetExtractor::new(self.client, self.policy).extract(local, SnapshotRef::Commit(remote_tip))
    }

    /// Ancestry relationship between HEAD and the remote-tracking ref, after
    /// a fetch.
    pub fn sync_state(&self) -> Result<SyncState, GitError> {
        let Some(remote_tip) = self.fetch()? else {
            return Ok(SyncState::NoRemote);
        };
        let Some(head) = self.client.head_commit()? else {
            let behind = self.client.repo().revwalk().and_then(|mut walk| {
                walk.push(remote_tip)?;
                Ok(walk.count())
            })?;
            return Ok(SyncState::from_ahead_behind(0, behind));
        };
        let (ahead, behind) = self.client.repo().graph_ahead_behind(head.id(), remote_tip)?;
        Ok(SyncState::from_ahead_behind(ahead, behind))
    }

    /// Merge the remote branch into HEAD.
    ///
    /// Returns the HEAD commit unchanged when the remote tip is already part
    /// of local history, otherwise a new commit whose parents are the local
    /// and remote tips. Conflicting paths abort the merge with
    /// [`GitError::MergeConflict`]; HEAD and the working tree are untouched.
    pub fn merge(&self) -> Result<Commit, GitError> {
        let branch = &self.remote.branch;
        let remote_tip = self
            .fetch()?
            .ok_or_else(|| GitError::RefNotFound(tracking_ref(branch)))?;
        let repo = self.client.repo();

        let Some(local) = self.client.head_commit()? else {
            return self.adopt_remote(remote_tip);
        };
        if RevisionHistoryWalker::new(self.client).contains(remote_tip)? {
            info!("already up to date");
            return Ok(Commit::from(&local));
        }

        let remote = repo.find_commit(remote_tip)?;
        let mut opts = MergeOptions::new();
        opts.find_renames(true);
        let mut merged = repo.merge_commits(&local, &remote, Some(&opts))?;
        if merged.has_conflicts() {
            let mut paths = Vec::new();
            for conflict in merged.conflicts()? {
                let conflict = conflict?;
                let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
                if let Some(entry) = entry {
                    paths.push(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
            paths.sort();
            paths.dedup();
            warn!(?paths, "merge conflict, nothing committed");
            return Err(GitError::MergeConflict { paths });
        }

        let tree = repo.find_tree(merged.write_tree_to(repo)?)?;
        let sig = GitClient::signature(self.identity)?;
        let message = format!("Merge remote-tracking branch '{ORIGIN}/{branch}'");
        let oid = repo.commit(None, &sig, &sig, &message, &tree, &[&local, &remote])?;

        // Working tree first, so a refused checkout leaves HEAD where it was.
        let mut checkout = CheckoutBuilder::new();
        checkout.safe();
        repo.checkout_tree(tree.as_object(), Some(&mut checkout))?;
        self.advance_head(oid, local.id(), &message)?;

        info!(sha = %oid, local = %local.id(), remote = %remote_tip, "merge committed");
        Ok(Commit::from(&repo.find_commit(oid)?))
    }

    /// Push the current branch. Refused with an authorization error when the
    /// push policy forbids it.
    pub fn push(&self) -> Result<(), VcError> {
        if !self.push_policy.push_allowed() {
            return Err(VcError::Authorization("pushing is disabled".into()));
        }
        self.client.ensure_origin(&self.remote.url)?;
        let branch = self.client.current_branch()?;
        self.client.push(&branch, &self.negotiator)?;
        Ok(())
    }

    /// With no local history, take the remote branch as is.
    fn adopt_remote(&self, remote_tip: Oid) -> Result<Commit, GitError> {
        let repo = self.client.repo();
        let remote = repo.find_commit(remote_tip)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.safe();
        repo.checkout_tree(remote.as_object(), Some(&mut checkout))?;
        let branch = self.client.current_branch()?;
        repo.reference(
            &format!("refs/heads/{branch}"),
            remote_tip,
            false,
            "storesync: fast-forward",
        )?;
        info!(sha = %remote_tip, "adopted remote branch");
        Ok(Commit::from(&remote))
    }

    /// Move the current branch from `expected` to `new`, failing if someone
    /// else moved it meanwhile.
    fn advance_head(&self, new: Oid, expected: Oid, message: &str) -> Result<(), GitError> {
        let branch = self.client.current_branch()?;
        self.client.repo().reference_matching(
            &format!("refs/heads/{branch}"),
            new,
            true,
            expected,
            &format!("storesync: {message}"),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitManager;
    use crate::errors::ErrorKind;
    use std::path::Path;

    struct Fixture {
        _root: tempfile::TempDir,
        remote: RemoteConfig,
        upstream: GitClient,
        local: GitClient,
        identity: IdentityConfig,
        policy: IgnorePolicy,
    }

    /// A bare "remote", a working clone used to publish upstream commits,
    /// and a local clone under test. Both clones start from one shared
    /// commit.
    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let bare = root.path().join("remote.git");
        git2::Repository::init_opts(
            &bare,
            git2::RepositoryInitOptions::new().bare(true).initial_head("master"),
        )
        .unwrap();
        let url = bare.to_string_lossy().into_owned();
        let remote = RemoteConfig::new(url.clone());
        let negotiator = CredentialNegotiator::new(url.clone(), None);
        let identity = IdentityConfig::default();
        let policy = IgnorePolicy::default();

        let upstream = GitClient::init(&root.path().join("upstream"), "master").unwrap();
        upstream.ensure_origin(&url).unwrap();
        write(upstream.repo_path(), "shared.txt", "one\ntwo\nthree\n");
        CommitManager::new(&upstream, &policy, &identity).commit("shared").unwrap();
        upstream.push("master", &negotiator).unwrap();

        let local = GitClient::clone_repo(&url, &root.path().join("local"), "master", &negotiator).unwrap();
        Fixture {
            _root: root,
            remote,
            upstream,
            local,
            identity,
            policy,
        }
    }

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    fn publish(f: &Fixture, name: &str, contents: &str) -> Commit {
        write(f.upstream.repo_path(), name, contents);
        let c = CommitManager::new(&f.upstream, &f.policy, &f.identity).commit(name).unwrap();
        let negotiator = CredentialNegotiator::new(f.remote.url.clone(), None);
        f.upstream.push("master", &negotiator).unwrap();
        c
    }

    fn local_commit(f: &Fixture, name: &str, contents: &str) -> Commit {
        write(f.local.repo_path(), name, contents);
        CommitManager::new(&f.local, &f.policy, &f.identity).commit(name).unwrap()
    }

    #[test]
    fn test_status_up_to_date() {
        let f = fixture();
        let engine = SyncEngine::new(&f.local, &f.remote, &f.identity, &f.policy, &true);
        assert!(engine.status().unwrap().is_empty());
        assert_eq!(engine.sync_state().unwrap(), SyncState::UpToDate);
    }

    #[test]
    fn test_status_reports_remote_commit() {
        let f = fixture();
        publish(&f, "remote.txt", "from remote\n");

        let engine = SyncEngine::new(&f.local, &f.remote, &f.identity, &f.policy, &true);
        let changes = engine.status().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "/remote.txt");
        assert_eq!(engine.sync_state().unwrap(), SyncState::Behind { commits: 1 });
    }

    #[test]
    fn test_merge_creates_two_parent_commit() {
        let f = fixture();
        let upstream = publish(&f, "remote.txt", "from remote\n");
        let local = local_commit(&f, "local.txt", "from local\n");

        let engine = SyncEngine::new(&f.local, &f.remote, &f.identity, &f.policy, &true);
        assert_eq!(
            engine.sync_state().unwrap(),
            SyncState::Diverged { ahead: 1, behind: 1 }
        );
        let merge = engine.merge().unwrap();

        assert_eq!(merge.parents, vec![local.id, upstream.id]);
        assert!(f.local.repo_path().join("remote.txt").exists());
        assert!(f.local.repo_path().join("local.txt").exists());
        assert_eq!(engine.sync_state().unwrap(), SyncState::Ahead { commits: 2 });
        assert!(engine.status().unwrap().is_empty());
    }

    #[test]
    fn test_merge_conflict_leaves_head() {
        let f = fixture();
        publish(&f, "shared.txt", "one\nremote\nthree\n");
        let local = local_commit(&f, "shared.txt", "one\nlocal\nthree\n");

        let engine = SyncEngine::new(&f.local, &f.remote, &f.identity, &f.policy, &true);
        let err = engine.merge().unwrap_err();
        match &err {
            GitError::MergeConflict { paths } => assert_eq!(paths, &vec!["shared.txt".to_string()]),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::MergeConflict);
        assert_eq!(f.local.head_commit().unwrap().unwrap().id().to_string(), local.id);
        assert_eq!(
            std::fs::read_to_string(f.local.repo_path().join("shared.txt")).unwrap(),
            "one\nlocal\nthree\n"
        );
    }

    #[test]
    fn test_merge_when_up_to_date_returns_head() {
        let f = fixture();
        let local = local_commit(&f, "local.txt", "x\n");
        let engine = SyncEngine::new(&f.local, &f.remote, &f.identity, &f.policy, &true);
        assert_eq!(engine.merge().unwrap().id, local.id);
    }

    #[test]
    fn test_push_disabled_is_authorization_error() {
        let f = fixture();
        local_commit(&f, "local.txt", "x\n");
        let engine = SyncEngine::new(&f.local, &f.remote, &f.identity, &f.policy, &false);
        let err = engine.push().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[test]
    fn test_push_diverged_is_rejected() {
        let f = fixture();
        publish(&f, "remote.txt", "r\n");
        local_commit(&f, "local.txt", "l\n");

        let engine = SyncEngine::new(&f.local, &f.remote, &f.identity, &f.policy, &true);
        let err = engine.push().unwrap_err();
        assert!(
            matches!(err, VcError::Git(GitError::PushRejected { .. })),
            "unexpected error: {err:?}"
        );
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn test_runtime_push_policy() {
        let flag = AtomicBool::new(false);
        assert!(!flag.push_allowed());
        flag.store(true, Ordering::SeqCst);
        assert!(flag.push_allowed());
    }
}
