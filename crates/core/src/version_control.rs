//! The host-facing version-control API.
//!
//! [`VersionControl`] exposes one async method per capability. Each call
//! reopens the repository on a blocking thread, so the handle is cheap to
//! clone and share. Mutating calls are serialized; read-only calls may run
//! alongside each other but never alongside a mutation. Remote calls are
//! bounded by `network.timeout_secs`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapPlan, RepositoryBootstrapper};
use crate::commit::CommitManager;
use crate::config::{IdentityConfig, RemoteConfig, VcConfig};
use crate::errors::{ConfigError, GitError, VcError};
use crate::git::changeset::ChangeSetExtractor;
use crate::git::client::GitClient;
use crate::git::history::RevisionHistoryWalker;
use crate::ignore_policy::IgnorePolicy;
use crate::models::{Change, Commit, CommitSummary, SyncState};
use crate::sync_engine::{PushPolicy, SyncEngine};

/// Everything a blocking operation needs, shared by clones of the handle.
struct Inner {
    data_dir: PathBuf,
    remote: Option<RemoteConfig>,
    identity: IdentityConfig,
    policy: IgnorePolicy,
    timeout: Duration,
    push_policy: Arc<dyn PushPolicy>,
}

impl Inner {
    fn open(&self) -> Result<GitClient, GitError> {
        GitClient::open(&self.data_dir)
    }

    fn remote(&self) -> Result<&RemoteConfig, VcError> {
        self.remote.as_ref().ok_or_else(|| ConfigError::NoRemote.into())
    }

    fn engine<'a>(&'a self, client: &'a GitClient) -> Result<SyncEngine<'a>, VcError> {
        Ok(SyncEngine::new(
            client,
            self.remote()?,
            &self.identity,
            &self.policy,
            &*self.push_policy,
        ))
    }
}

/// Version control for one data directory.
#[derive(Clone)]
pub struct VersionControl {
    inner: Arc<Inner>,
    // Single writer, many readers.
    lock: Arc<RwLock<()>>,
}

impl VersionControl {
    /// Validate `config` and build a handle. Nothing touches the disk until
    /// [`init`](Self::init).
    pub fn new(config: &VcConfig) -> Result<Self, VcError> {
        config.validate()?;
        Ok(Self::unvalidated(config))
    }

    /// Build a handle without validating `config`, e.g. for a remote given
    /// as a local path.
    pub fn unvalidated(config: &VcConfig) -> Self {
        let allow_push = config.remote.as_ref().is_some_and(|r| r.allow_push);
        Self {
            inner: Arc::new(Inner {
                data_dir: config.store.data_dir.clone(),
                remote: config.remote.clone(),
                identity: config.identity.clone(),
                policy: IgnorePolicy::new(config.store.ignore.clone()),
                timeout: config.network.timeout(),
                push_policy: Arc::new(allow_push),
            }),
            lock: Arc::new(RwLock::new(())),
        }
    }

    /// Replace the push policy derived from `remote.allow_push`.
    pub fn with_push_policy(self, push_policy: Arc<dyn PushPolicy>) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(Inner {
                data_dir: inner.data_dir.clone(),
                remote: inner.remote.clone(),
                identity: inner.identity.clone(),
                policy: inner.policy.clone(),
                timeout: inner.timeout,
                push_policy,
            }),
            lock: self.lock,
        }
    }

    /// Wait until the host reports its data directory ready, then bootstrap.
    ///
    /// The directory received overrides `store.data_dir`. A dropped sender
    /// means the store never became ready.
    pub async fn start_when_ready(
        mut config: VcConfig,
        ready: oneshot::Receiver<PathBuf>,
    ) -> Result<Self, VcError> {
        debug!("waiting for data directory");
        let data_dir = ready.await.map_err(|_| ConfigError::MissingDataDir)?;
        info!(data_dir = %data_dir.display(), "data directory ready");
        config.store.data_dir = data_dir;
        let vc = Self::new(&config)?;
        vc.init().await?;
        Ok(vc)
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn remote(&self) -> Option<&RemoteConfig> {
        self.inner.remote.as_ref()
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Make the data directory a repository, cloning or merging with the
    /// remote as needed.
    pub async fn init(&self) -> Result<BootstrapPlan, VcError> {
        let op = |inner: &Inner| {
            RepositoryBootstrapper::new(
                &inner.data_dir,
                inner.remote.as_ref(),
                &inner.identity,
                &inner.policy,
                &*inner.push_policy,
            )
            .initialize()
        };
        if self.inner.remote.is_some() {
            self.remote_op("clone", true, op).await
        } else {
            self.write(op).await
        }
    }

    /// Commit every admitted file with `message`.
    pub async fn commit(&self, message: impl Into<String>) -> Result<Commit, VcError> {
        let message = message.into();
        self.write(move |inner| {
            let client = inner.open()?;
            Ok(CommitManager::new(&client, &inner.policy, &inner.identity).commit(&message)?)
        })
        .await
    }

    /// Replace the working tree with commit `id`'s tree. HEAD stays put and
    /// uncommitted edits are discarded.
    pub async fn checkout(&self, id: impl Into<String>) -> Result<(), VcError> {
        let id = id.into();
        self.write(move |inner| {
            let client = inner.open()?;
            let tree = client.find_commit(&id)?.tree().map_err(GitError::from)?;
            client.force_checkout_tree(&tree)?;
            info!(commit = %id, "checked out");
            Ok(())
        })
        .await
    }

    /// Discard every uncommitted edit, new files included.
    pub async fn revert(&self) -> Result<(), VcError> {
        self.write(|inner| {
            let client = inner.open()?;
            client.reset_hard_to_head(&inner.policy)?;
            info!("working tree reset to HEAD");
            Ok(())
        })
        .await
    }

    /// Uncommitted changes relative to HEAD.
    pub async fn local_changes(&self) -> Result<Vec<Change>, VcError> {
        self.read(|inner| {
            let client = inner.open()?;
            Ok(ChangeSetExtractor::new(&client, &inner.policy).local_changes()?)
        })
        .await
    }

    /// Every commit reachable from HEAD, newest first.
    pub async fn history(&self) -> Result<Vec<CommitSummary>, VcError> {
        self.read(|inner| {
            let client = inner.open()?;
            let commits = RevisionHistoryWalker::new(&client)
                .history()?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(commits)
        })
        .await
    }

    /// Changes introduced by commit `id`.
    pub async fn diff(&self, id: impl Into<String>) -> Result<Vec<Change>, VcError> {
        let id = id.into();
        self.read(move |inner| {
            let client = inner.open()?;
            Ok(ChangeSetExtractor::new(&client, &inner.policy).commit_changes(&id)?)
        })
        .await
    }

    /// What the remote has that HEAD lacks. Empty means up to date.
    pub async fn status(&self) -> Result<Vec<Change>, VcError> {
        self.remote_op("fetch", false, |inner| {
            let client = inner.open()?;
            Ok(inner.engine(&client)?.status()?)
        })
        .await
    }

    /// Ahead/behind relationship with the remote branch.
    pub async fn sync_state(&self) -> Result<SyncState, VcError> {
        if self.inner.remote.is_none() {
            return Ok(SyncState::NoRemote);
        }
        self.remote_op("fetch", false, |inner| {
            let client = inner.open()?;
            Ok(inner.engine(&client)?.sync_state()?)
        })
        .await
    }

    /// Merge the remote branch into HEAD.
    pub async fn merge(&self) -> Result<Commit, VcError> {
        self.remote_op("merge", true, |inner| {
            let client = inner.open()?;
            Ok(inner.engine(&client)?.merge()?)
        })
        .await
    }

    /// Push the current branch to the remote.
    pub async fn push(&self) -> Result<(), VcError> {
        if !self.inner.push_policy.push_allowed() {
            warn!("push refused, pushing is disabled");
            return Err(VcError::Authorization("pushing is disabled".into()));
        }
        self.remote_op("push", true, |inner| {
            let client = inner.open()?;
            inner.engine(&client)?.push()
        })
        .await
    }

    /// Commits not yet on the remote branch, oldest first.
    pub async fn local_commits(&self, branch: Option<String>) -> Result<Vec<CommitSummary>, VcError> {
        self.read(move |inner| {
            let client = inner.open()?;
            let commits = RevisionHistoryWalker::new(&client)
                .local_commits(branch.as_deref())?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(commits)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn read<T, F>(&self, f: F) -> Result<T, VcError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, VcError> + Send + 'static,
    {
        let guard = Arc::clone(&self.lock).read_owned().await;
        self.run(guard, f).await
    }

    async fn write<T, F>(&self, f: F) -> Result<T, VcError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, VcError> + Send + 'static,
    {
        let guard = Arc::clone(&self.lock).write_owned().await;
        self.run(guard, f).await
    }

    /// Run `f` on a blocking thread that holds `guard` until `f` returns.
    async fn run<G, T, F>(&self, guard: G, f: F) -> Result<T, VcError>
    where
        G: Send + 'static,
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, VcError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f(&inner)
        })
        .await
        .map_err(join_error)?
    }

    /// Run a network-bound operation under the configured timeout.
    ///
    /// The clock starts once the lock is held. The guard travels with the
    /// blocking task, so a timed-out operation keeps others out until it
    /// actually finishes.
    async fn remote_op<T, F>(&self, operation: &'static str, mutates: bool, f: F) -> Result<T, VcError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, VcError> + Send + 'static,
    {
        let timeout = self.inner.timeout;
        let outcome = if mutates {
            let guard = Arc::clone(&self.lock).write_owned().await;
            tokio::time::timeout(timeout, self.run(guard, f)).await
        } else {
            let guard = Arc::clone(&self.lock).read_owned().await;
            tokio::time::timeout(timeout, self.run(guard, f)).await
        };
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, secs = timeout.as_secs(), "remote operation timed out");
                Err(GitError::Timeout {
                    operation: operation.to_string(),
                    secs: timeout.as_secs(),
                }
                .into())
            }
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> VcError {
    GitError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::models::ChangeOperation;
    use std::sync::atomic::AtomicBool;

    fn local_vc(dir: &Path) -> VersionControl {
        VersionControl::new(&VcConfig::for_data_dir(dir)).unwrap()
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let err = VersionControl::new(&VcConfig::for_data_dir("")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let config = VcConfig::for_data_dir("/tmp/x").with_remote(RemoteConfig::new("ftp://host/repo"));
        let err = VersionControl::new(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_commit_and_history() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo"), "foo\n").unwrap();
        let vc = local_vc(dir.path());
        assert_eq!(vc.init().await.unwrap(), BootstrapPlan::LocalInit);

        std::fs::write(dir.path().join("bar"), "bar\n").unwrap();
        let changes = vc.local_changes().await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, ChangeOperation::Insert);

        let commit = vc.commit("add bar").await.unwrap();
        let history = vc.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, commit.id);
        assert!(vc.local_changes().await.unwrap().is_empty());

        let diff = vc.diff(commit.id.clone()).await.unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "/bar");
    }

    #[tokio::test]
    async fn test_checkout_and_revert() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "v1\n").unwrap();
        let vc = local_vc(dir.path());
        vc.init().await.unwrap();
        let first = vc.history().await.unwrap()[0].id.clone();

        std::fs::write(dir.path().join("a.txt"), "v2\n").unwrap();
        let second = vc.commit("v2").await.unwrap();

        vc.checkout(first).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "v1\n");
        // HEAD did not move.
        assert_eq!(vc.history().await.unwrap()[0].id, second.id);

        vc.revert().await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "v2\n");
    }

    #[tokio::test]
    async fn test_remote_ops_without_remote() {
        let dir = tempfile::tempdir().unwrap();
        let vc = local_vc(dir.path());
        vc.init().await.unwrap();

        assert_eq!(vc.sync_state().await.unwrap(), SyncState::NoRemote);
        assert_eq!(vc.status().await.unwrap_err().kind(), ErrorKind::Configuration);
        assert_eq!(vc.merge().await.unwrap_err().kind(), ErrorKind::Configuration);
        // Pushing is disabled when no remote is configured.
        assert_eq!(vc.push().await.unwrap_err().kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn test_push_disabled_by_config() {
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteConfig::new("https://example.invalid/repo.git").with_allow_push(false);
        let vc = VersionControl::new(&VcConfig::for_data_dir(dir.path()).with_remote(remote)).unwrap();
        let err = vc.push().await.unwrap_err();
        assert!(matches!(err, VcError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_injected_push_policy() {
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteConfig::new("https://example.invalid/repo.git");
        let flag = Arc::new(AtomicBool::new(false));
        let vc = VersionControl::new(&VcConfig::for_data_dir(dir.path()).with_remote(remote))
            .unwrap()
            .with_push_policy(flag.clone());
        assert_eq!(vc.push().await.unwrap_err().kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn test_remote_timeout_excludes_lock_wait() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("remote.git");
        git2::Repository::init_opts(&bare, git2::RepositoryInitOptions::new().bare(true).initial_head("master"))
            .unwrap();
        let mut config = VcConfig::for_data_dir(dir.path().join("data"))
            .with_remote(RemoteConfig::new(bare.to_string_lossy().into_owned()));
        config.network.timeout_secs = 1;
        let vc = VersionControl::unvalidated(&config);
        vc.init().await.unwrap();
        vc.push().await.unwrap();

        let guard = Arc::clone(&vc.lock).write_owned().await;
        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            drop(guard);
        });

        // Waiting for the writer takes longer than the timeout; the fetch itself does not.
        assert!(vc.status().await.unwrap().is_empty());
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn test_checkout_unknown_commit() {
        let dir = tempfile::tempdir().unwrap();
        let vc = local_vc(dir.path());
        vc.init().await.unwrap();
        let err = vc.checkout("0123456789abcdef").await.unwrap_err();
        assert!(matches!(err, VcError::Git(GitError::CommitNotFound(_))));
    }

    #[tokio::test]
    async fn test_start_when_ready() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo"), "foo\n").unwrap();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(VersionControl::start_when_ready(VcConfig::for_data_dir("unused"), rx));
        tx.send(dir.path().to_path_buf()).unwrap();

        let vc = task.await.unwrap().unwrap();
        assert_eq!(vc.data_dir(), dir.path());
        assert_eq!(vc.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_when_ready_sender_dropped() {
        let (tx, rx) = oneshot::channel::<PathBuf>();
        drop(tx);
        let err = VersionControl::start_when_ready(VcConfig::for_data_dir("unused"), rx)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
