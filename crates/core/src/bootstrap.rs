//! Establishing the repository behind a data directory.
//!
//! What happens depends on two facts: whether the directory already holds a
//! repository or any files, and whether a remote is configured.
//!
//! | Directory                  | No remote          | Remote                        |
//! |----------------------------|--------------------|-------------------------------|
//! | has `.git`                 | open (no-op)       | open, point `origin` at remote |
//! | empty / missing            | init + root commit | clone in place                |
//! | files but no `.git`        | init + root commit | clone aside, merge files in   |
//!
//! A remote without the configured branch is treated like no remote, except
//! that `origin` is set and, when local files were present, the root commit
//! is pushed.
//!
//! Local files are never overwritten: a file that differs from the remote's
//! version at the same path aborts with a merge conflict and leaves the
//! directory as it was.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use git2::{ObjectType, Oid, TreeWalkMode, TreeWalkResult};
use tracing::{debug, info, warn};

use crate::commit::CommitManager;
use crate::config::{IdentityConfig, RemoteConfig, DEFAULT_BRANCH};
use crate::errors::{GitError, VcError};
use crate::git::client::GitClient;
use crate::git::credentials::CredentialNegotiator;
use crate::ignore_policy::{IgnorePolicy, GITIGNORE};
use crate::sync_engine::{PushPolicy, SyncEngine};

const INITIAL_COMMIT_MESSAGE: &str = "initial commit";
const MERGE_LOCAL_MESSAGE: &str = "merging in local changes";

/// The path [`RepositoryBootstrapper::initialize`] takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPlan {
    /// A repository is already there.
    ExistingRepository,
    /// No remote: create a repository and snapshot whatever is present.
    LocalInit,
    /// Remote and an empty directory: clone straight into it.
    Clone,
    /// Remote and pre-existing files: clone elsewhere, then merge the files
    /// into the clone as a new commit.
    CloneAndMerge,
}

/// One-shot repository setup for a data directory.
pub struct RepositoryBootstrapper<'a> {
    data_dir: &'a Path,
    remote: Option<&'a RemoteConfig>,
    identity: &'a IdentityConfig,
    policy: &'a IgnorePolicy,
    push_policy: &'a dyn PushPolicy,
}

impl<'a> RepositoryBootstrapper<'a> {
    pub fn new(
        data_dir: &'a Path,
        remote: Option<&'a RemoteConfig>,
        identity: &'a IdentityConfig,
        policy: &'a IgnorePolicy,
        push_policy: &'a dyn PushPolicy,
    ) -> Self {
        Self {
            data_dir,
            remote,
            identity,
            policy,
            push_policy,
        }
    }

    /// Decide what [`initialize`](Self::initialize) will do, without doing it.
    pub fn plan(&self) -> Result<BootstrapPlan, VcError> {
        if self.data_dir.join(".git").exists() {
            return Ok(BootstrapPlan::ExistingRepository);
        }
        Ok(match self.remote {
            None => BootstrapPlan::LocalInit,
            Some(_) if is_empty_dir(self.data_dir)? => BootstrapPlan::Clone,
            Some(_) => BootstrapPlan::CloneAndMerge,
        })
    }

    /// Make the data directory a usable repository. Returns the path taken.
    pub fn initialize(&self) -> Result<BootstrapPlan, VcError> {
        let plan = self.plan()?;
        info!(data_dir = %self.data_dir.display(), ?plan, "bootstrapping repository");
        match (plan, self.remote) {
            (BootstrapPlan::ExistingRepository, remote) => self.reopen(remote)?,
            (BootstrapPlan::Clone, Some(remote)) => self.clone_in_place(remote)?,
            (BootstrapPlan::CloneAndMerge, Some(remote)) => self.clone_and_merge(remote)?,
            // Clone plans are only chosen with a remote present.
            (_, _) => self.local_init()?,
        }
        Ok(plan)
    }

    fn reopen(&self, remote: Option<&RemoteConfig>) -> Result<(), VcError> {
        let client = GitClient::open(self.data_dir)?;
        if let Some(remote) = remote {
            client.ensure_origin(&remote.url)?;
        }
        if client.is_unborn() {
            debug!("repository has no commits yet");
            self.policy.write_gitignore(self.data_dir)?;
            CommitManager::new(&client, self.policy, self.identity).commit(INITIAL_COMMIT_MESSAGE)?;
        }
        Ok(())
    }

    fn local_init(&self) -> Result<(), VcError> {
        let client = GitClient::init(self.data_dir, DEFAULT_BRANCH)?;
        self.policy.write_gitignore(self.data_dir)?;
        let commit = CommitManager::new(&client, self.policy, self.identity).commit(INITIAL_COMMIT_MESSAGE)?;
        info!(sha = %commit.id, "initialized local repository");
        Ok(())
    }

    fn clone_in_place(&self, remote: &RemoteConfig) -> Result<(), VcError> {
        let negotiator = negotiator(remote);
        if !GitClient::remote_has_branch(&remote.url, &remote.branch, &negotiator)? {
            return self.adopt_empty_remote(remote, false);
        }
        let existed = self.data_dir.exists();
        match GitClient::clone_repo(&remote.url, self.data_dir, &remote.branch, &negotiator) {
            Ok(_) => {
                self.policy.write_gitignore(self.data_dir)?;
                Ok(())
            }
            Err(e) => {
                // Leave nothing that looks like a repository behind.
                let cleanup = if existed {
                    remove_if_exists(&self.data_dir.join(".git"))
                } else {
                    remove_if_exists(self.data_dir)
                };
                if let Err(io) = cleanup {
                    warn!(error = %io, "failed to clean up after failed clone");
                }
                Err(e.into())
            }
        }
    }

    /// The remote has no commits on the branch: start local history with
    /// `origin` configured, publishing it when `publish` is set.
    fn adopt_empty_remote(&self, remote: &RemoteConfig, publish: bool) -> Result<(), VcError> {
        info!(branch = %remote.branch, "remote branch is empty, initializing locally");
        let mut rollback = Rollback::default();
        rollback.git_dir = Some(self.data_dir.join(".git"));
        let client = GitClient::init(self.data_dir, &remote.branch)?;
        client.ensure_origin(&remote.url)?;
        if self.policy.write_gitignore(self.data_dir)? {
            rollback.files.push(self.data_dir.join(GITIGNORE));
        }
        let commit = CommitManager::new(&client, self.policy, self.identity).commit(INITIAL_COMMIT_MESSAGE)?;

        if publish && self.push_policy.push_allowed() {
            SyncEngine::new(&client, remote, self.identity, self.policy, self.push_policy).push()?;
        }
        rollback.disarm();
        info!(sha = %commit.id, published = publish, "initialized against empty remote");
        Ok(())
    }

    fn clone_and_merge(&self, remote: &RemoteConfig) -> Result<(), VcError> {
        let negotiator = negotiator(remote);
        if !GitClient::remote_has_branch(&remote.url, &remote.branch, &negotiator)? {
            return self.adopt_empty_remote(remote, true);
        }
        let staging = staging_dir(self.data_dir)?;
        let clone_path = staging.path().join("clone");
        let clone = GitClient::clone_repo(&remote.url, &clone_path, &remote.branch, &negotiator)?;

        let remote_files = self.reconcile(&clone)?;
        drop(clone);

        let mut rollback = Rollback::default();
        for rel in &remote_files {
            let target = self.data_dir.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(clone_path.join(rel), &target)?;
            rollback.files.push(target);
        }
        let git_dir = self.data_dir.join(".git");
        rollback.git_dir = Some(git_dir.clone());
        move_dir(&clone_path.join(".git"), &git_dir)?;

        let client = GitClient::open(self.data_dir)?;
        if self.policy.write_gitignore(self.data_dir)? {
            rollback.files.push(self.data_dir.join(GITIGNORE));
        }
        let commit = CommitManager::new(&client, self.policy, self.identity).commit(MERGE_LOCAL_MESSAGE)?;
        info!(sha = %commit.id, copied = remote_files.len(), "merged local files into clone");

        if self.push_policy.push_allowed() {
            SyncEngine::new(&client, remote, self.identity, self.policy, self.push_policy).push()?;
        } else {
            debug!("push disabled, merge commit stays local");
        }
        rollback.disarm();
        Ok(())
    }

    /// Compare the clone's tree with the data directory.
    ///
    /// Returns the remote files missing locally. Fails with a merge conflict
    /// listing every path where both sides hold different content.
    fn reconcile(&self, clone: &GitClient) -> Result<Vec<PathBuf>, GitError> {
        let Some(tree) = clone.head_tree()? else {
            return Ok(Vec::new());
        };
        let mut missing = Vec::new();
        let mut conflicts = Vec::new();
        let mut failure: Option<io::Error> = None;

        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            let Some(name) = entry.name() else {
                return TreeWalkResult::Skip;
            };
            let rel = format!("{root}{name}");
            let local = self.data_dir.join(&rel);
            match entry.kind() {
                Some(ObjectType::Tree) => match fs::symlink_metadata(&local) {
                    Ok(meta) if !meta.is_dir() => {
                        conflicts.push(rel);
                        TreeWalkResult::Skip
                    }
                    _ => TreeWalkResult::Ok,
                },
                Some(ObjectType::Blob) => {
                    match fs::symlink_metadata(&local) {
                        Ok(meta) if meta.is_dir() => conflicts.push(rel),
                        Ok(_) => match Oid::hash_file(ObjectType::Blob, &local) {
                            Ok(oid) if oid == entry.id() => {}
                            Ok(_) => conflicts.push(rel),
                            Err(e) => {
                                failure = Some(io::Error::new(io::ErrorKind::Other, e.message().to_string()));
                                return TreeWalkResult::Abort;
                            }
                        },
                        Err(e) if e.kind() == io::ErrorKind::NotFound => missing.push(PathBuf::from(rel)),
                        Err(e) => {
                            failure = Some(e);
                            return TreeWalkResult::Abort;
                        }
                    }
                    TreeWalkResult::Ok
                }
                _ => TreeWalkResult::Skip,
            }
        })
        .or_else(|e| if failure.is_some() { Ok(()) } else { Err(e) })?;

        if let Some(e) = failure {
            return Err(GitError::IoError(e));
        }
        if !conflicts.is_empty() {
            warn!(?conflicts, "local files collide with remote files");
            return Err(GitError::MergeConflict { paths: conflicts });
        }
        Ok(missing)
    }
}

fn negotiator(remote: &RemoteConfig) -> CredentialNegotiator {
    CredentialNegotiator::new(remote.url.clone(), remote.username.clone())
}

/// Undoes a half-finished merge-in when dropped.
#[derive(Default)]
struct Rollback {
    files: Vec<PathBuf>,
    git_dir: Option<PathBuf>,
}

impl Rollback {
    fn disarm(&mut self) {
        self.files.clear();
        self.git_dir = None;
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.files.is_empty() && self.git_dir.is_none() {
            return;
        }
        warn!(files = self.files.len(), "rolling back partial bootstrap");
        for file in &self.files {
            let _ = fs::remove_file(file);
        }
        if let Some(dir) = &self.git_dir {
            let _ = remove_if_exists(dir);
        }
    }
}

/// Temporary directory next to `data_dir`, so the clone's `.git` can be
/// renamed rather than copied.
fn staging_dir(data_dir: &Path) -> io::Result<tempfile::TempDir> {
    match data_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => tempfile::Builder::new()
            .prefix(".storesync-clone-")
            .tempdir_in(parent)
            .or_else(|_| tempfile::tempdir()),
        None => tempfile::tempdir(),
    }
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn move_dir(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    debug!(from = %from.display(), to = %to.display(), "rename failed, copying");
    copy_dir_all(from, to)
}

fn copy_dir_all(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
