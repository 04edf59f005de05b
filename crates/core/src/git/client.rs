//! Local repository operations via `git2`.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    AutotagOption, Direction, FetchOptions, Index, IndexAddOption, Oid, PushOptions, Remote,
    Repository, RepositoryInitOptions, ResetType, Signature, Tree,
};
use tracing::{debug, info, instrument, warn};

use crate::config::IdentityConfig;
use crate::errors::GitError;
use crate::git::credentials::CredentialNegotiator;
use crate::git::remote_url;
use crate::ignore_policy::IgnorePolicy;

/// Name of the single remote storesync manages.
pub const ORIGIN: &str = "origin";

/// Ref name of the remote-tracking branch for `branch`.
pub fn tracking_ref(branch: &str) -> String {
    format!("refs/remotes/{ORIGIN}/{branch}")
}

/// High-level client wrapping a `git2::Repository` rooted at the data
/// directory.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

impl GitClient {
    /// Open the repository at `repo_path` (no upward search).
    pub fn open<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        debug!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Create an empty repository whose unborn HEAD points at `branch`.
    #[instrument]
    pub fn init(path: &Path, branch: &str) -> Result<Self, GitError> {
        info!("initializing git repository");
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(branch).mkpath(true);
        let repo = Repository::init_opts(path, &opts)?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Clone `url` into `path`, checking out `branch`.
    #[instrument(skip(negotiator, url), fields(url = %remote_url::redact(url), path = %path.display()))]
    pub fn clone_repo(
        url: &str,
        path: &Path,
        branch: &str,
        negotiator: &CredentialNegotiator,
    ) -> Result<Self, GitError> {
        info!("cloning git repository");
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(negotiator.remote_callbacks());
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_opts).branch(branch);
        let repo = builder
            .clone(url, path)
            .map_err(|e| GitError::from_remote(e, "clone", &remote_url::redact(url)))?;
        info!("clone completed");
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Whether `branch` exists on the remote at `url`. A freshly created
    /// remote has no branches at all.
    #[instrument(skip(negotiator, url), fields(url = %remote_url::redact(url)))]
    pub fn remote_has_branch(
        url: &str,
        branch: &str,
        negotiator: &CredentialNegotiator,
    ) -> Result<bool, GitError> {
        let redacted = remote_url::redact(url);
        let mut remote = Remote::create_detached(url)?;
        let mut connection = remote
            .connect_auth(Direction::Fetch, Some(negotiator.remote_callbacks()), None)
            .map_err(|e| GitError::from_remote(e, "ls-remote", &redacted))?;
        let wanted = format!("refs/heads/{branch}");
        let found = connection.remote().list()?.iter().any(|head| head.name() == wanted);
        debug!(found, "remote branch lookup");
        Ok(found)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Refs
    // -----------------------------------------------------------------------

    /// Whether HEAD points at a branch with no commits yet.
    pub fn is_unborn(&self) -> bool {
        self.repo.head().is_err()
    }

    /// The commit HEAD points at, or `None` when HEAD is unborn.
    pub fn head_commit(&self) -> Result<Option<git2::Commit<'_>>, GitError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e)
                if e.code() == git2::ErrorCode::UnbornBranch
                    || e.code() == git2::ErrorCode::NotFound =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The tree of HEAD, or `None` when HEAD is unborn.
    pub fn head_tree(&self) -> Result<Option<Tree<'_>>, GitError> {
        Ok(match self.head_commit()? {
            Some(commit) => Some(commit.tree()?),
            None => None,
        })
    }

    /// Short name of the branch HEAD points at, even when unborn.
    pub fn current_branch(&self) -> Result<String, GitError> {
        match self.repo.head() {
            Ok(head) if head.is_branch() => head
                .shorthand()
                .map(str::to_string)
                .ok_or_else(|| GitError::RefNotFound("HEAD".into())),
            Ok(_) => Err(GitError::RefNotFound("HEAD is detached".into())),
            Err(_) => {
                let head = self.repo.find_reference("HEAD")?;
                head.symbolic_target()
                    .and_then(|t| t.strip_prefix("refs/heads/"))
                    .map(str::to_string)
                    .ok_or_else(|| GitError::RefNotFound("HEAD".into()))
            }
        }
    }

    /// Resolve a full or abbreviated commit id.
    pub fn find_commit(&self, id: &str) -> Result<git2::Commit<'_>, GitError> {
        let object = self
            .repo
            .revparse_single(id)
            .map_err(|_| GitError::CommitNotFound(id.to_string()))?;
        object
            .peel_to_commit()
            .map_err(|_| GitError::CommitNotFound(id.to_string()))
    }

    /// Target of the remote-tracking ref for `branch`, if it exists.
    pub fn tracking_oid(&self, branch: &str) -> Result<Option<Oid>, GitError> {
        match self.repo.refname_to_id(&tracking_ref(branch)) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure `origin` exists and points at `url`.
    pub fn ensure_origin(&self, url: &str) -> Result<(), GitError> {
        match self.repo.find_remote(ORIGIN) {
            Ok(remote) if remote.url() == Some(url) => Ok(()),
            Ok(remote) => {
                let from = remote.url().map(remote_url::redact).unwrap_or_default();
                let to = remote_url::redact(url);
                warn!(%from, %to, "re-pointing origin at configured remote");
                self.repo.remote_set_url(ORIGIN, url)?;
                Ok(())
            }
            Err(_) => {
                info!(url = %remote_url::redact(url), "adding origin remote");
                self.repo.remote(ORIGIN, url)?;
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Working tree & index
    // -----------------------------------------------------------------------

    /// Stage every new, modified and deleted file that `policy` admits.
    ///
    /// The returned index is the repository's own; it is not written to disk
    /// unless the caller calls `write()`.
    pub fn stage_all(&self, policy: &IgnorePolicy) -> Result<Index, GitError> {
        let mut index = self.repo.index()?;
        let mut admit = |path: &Path, _spec: &[u8]| -> i32 {
            if policy.is_ignored(&path.to_string_lossy()) {
                1
            } else {
                0
            }
        };
        index.add_all(
            ["*"].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut admit as &mut git2::IndexMatchedPath),
        )?;
        index.update_all(["*"].iter(), Some(&mut admit as &mut git2::IndexMatchedPath))?;
        // Previously tracked paths that the policy now excludes.
        let excluded: Vec<Vec<u8>> = index
            .iter()
            .filter(|entry| policy.is_ignored(&String::from_utf8_lossy(&entry.path)))
            .map(|entry| entry.path)
            .collect();
        for path in excluded {
            index.remove_path(Path::new(&*String::from_utf8_lossy(&path)))?;
        }
        Ok(index)
    }

    /// Replace the working tree with `tree` without moving HEAD.
    ///
    /// Tracked files are overwritten; untracked files, including the
    /// store's transient and settings files, are left alone.
    pub fn force_checkout_tree(&self, tree: &Tree<'_>) -> Result<(), GitError> {
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo.checkout_tree(tree.as_object(), Some(&mut checkout))?;
        Ok(())
    }

    /// Discard all uncommitted edits, including new files.
    pub fn reset_hard_to_head(&self, policy: &IgnorePolicy) -> Result<(), GitError> {
        let Some(head) = self.head_commit()? else {
            return Err(GitError::RefNotFound("HEAD".into()));
        };
        // Staging first makes new files tracked so the hard reset removes them.
        let mut index = self.stage_all(policy)?;
        index.write()?;
        self.repo.reset(head.as_object(), ResetType::Hard, None)?;
        Ok(())
    }

    /// Signature for commits created by storesync.
    pub fn signature(identity: &IdentityConfig) -> Result<Signature<'static>, GitError> {
        Ok(Signature::now(&identity.name, &identity.email)?)
    }

    // -----------------------------------------------------------------------
    // Remote operations
    // -----------------------------------------------------------------------

    /// Fetch `branch` from origin into its remote-tracking ref.
    #[instrument(skip(self, negotiator))]
    pub fn fetch(&self, branch: &str, negotiator: &CredentialNegotiator) -> Result<Option<Oid>, GitError> {
        info!("fetching");
        let mut remote = self.repo.find_remote(ORIGIN)?;
        let url = remote.url().map(remote_url::redact).unwrap_or_default();
        let mut fetch_opts = FetchOptions::new();
        fetch_opts
            .remote_callbacks(negotiator.remote_callbacks())
            .download_tags(AutotagOption::None);
        let refspec = format!("+refs/heads/{branch}:{}", tracking_ref(branch));
        remote
            .fetch(&[&refspec], Some(&mut fetch_opts), None)
            .map_err(|e| GitError::from_remote(e, "fetch", &url))?;
        let oid = self.tracking_oid(branch)?;
        debug!(tip = ?oid, "fetch completed");
        Ok(oid)
    }

    /// Push local `branch` to the identically named branch on origin.
    #[instrument(skip(self, negotiator))]
    pub fn push(&self, branch: &str, negotiator: &CredentialNegotiator) -> Result<(), GitError> {
        info!("pushing");
        let mut remote = self.repo.find_remote(ORIGIN)?;
        let url = remote.url().map(remote_url::redact).unwrap_or_default();
        let rejection: RefCell<Option<String>> = RefCell::new(None);

        let mut callbacks = negotiator.remote_callbacks();
        callbacks.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                *rejection.borrow_mut() = Some(msg.to_string());
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[&refspec], Some(&mut push_opts))
            .map_err(|e| match e.code() {
                git2::ErrorCode::NotFastForward => GitError::PushRejected {
                    branch: branch.to_string(),
                    detail: e.message().to_string(),
                },
                _ => GitError::from_remote(e, "push", &url),
            })?;
        drop(push_opts);

        if let Some(detail) = rejection.into_inner() {
            return Err(GitError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }

        // Record what the remote now has, even if libgit2 did not.
        let local = self.repo.refname_to_id(&format!("refs/heads/{branch}"))?;
        self.repo
            .reference(&tracking_ref(branch), local, true, "storesync: push")?;
        info!(sha = %local, "push completed");
        Ok(())
    }
}
