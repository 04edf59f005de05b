//! End-to-end tests for the version-control facade.
//!
//! Each test builds a bare repository in a temp dir as the "remote" and
//! drives [`VersionControl`] against it through its file path. No network
//! I/O is involved.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use storesync_core::commit::CommitManager;
use storesync_core::config::{IdentityConfig, RemoteConfig, VcConfig};
use storesync_core::git::{CredentialNegotiator, GitClient};
use storesync_core::{BootstrapPlan, ChangeOperation, ErrorKind, IgnorePolicy, VersionControl};

// ===========================================================================
// Helpers
// ===========================================================================

struct Env {
    root: TempDir,
    remote: RemoteConfig,
}

impl Env {
    /// A bare remote with no branches yet.
    fn empty() -> Self {
        let root = TempDir::new().unwrap();
        let bare = root.path().join("remote.git");
        git2::Repository::init_opts(
            &bare,
            git2::RepositoryInitOptions::new().bare(true).initial_head("master"),
        )
        .unwrap();
        let remote = RemoteConfig::new(bare.to_string_lossy().into_owned());
        Self { root, remote }
    }

    /// A bare remote whose master holds `files` and the store's `.gitignore`.
    fn new(files: &[(&str, &str)]) -> Self {
        let env = Self::empty();
        let policy = IgnorePolicy::default();
        let seed = GitClient::init(&env.path("seed"), "master").unwrap();
        seed.ensure_origin(&env.remote.url).unwrap();
        write_files(seed.repo_path(), files);
        policy.write_gitignore(seed.repo_path()).unwrap();
        CommitManager::new(&seed, &policy, &IdentityConfig::default())
            .commit("seed")
            .unwrap();
        seed.push("master", &env.negotiator()).unwrap();
        env
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn negotiator(&self) -> CredentialNegotiator {
        CredentialNegotiator::new(self.remote.url.clone(), None)
    }

    /// A facade for `<root>/<name>` tracking the bare remote.
    fn vc(&self, name: &str) -> VersionControl {
        let config = VcConfig::for_data_dir(self.path(name)).with_remote(self.remote.clone());
        VersionControl::unvalidated(&config)
    }

    fn remote_head(&self) -> String {
        let repo = git2::Repository::open_bare(&self.remote.url).unwrap();
        repo.refname_to_id("refs/heads/master").unwrap().to_string()
    }
}

fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (name, contents) in files {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
}

/// Two clones of the same remote: `local` under test and `peer` publishing
/// concurrent work.
async fn two_clones(env: &Env) -> (VersionControl, VersionControl) {
    let local = env.vc("local");
    let peer = env.vc("peer");
    assert_eq!(local.init().await.unwrap(), BootstrapPlan::Clone);
    assert_eq!(peer.init().await.unwrap(), BootstrapPlan::Clone);
    (local, peer)
}

// ===========================================================================
// Bootstrap
// ===========================================================================

#[tokio::test]
async fn test_bootstrap_empty_dir_with_remote() {
    let env = Env::new(&[("templates/invoice/content.html", "<p>invoice</p>\n")]);
    std::fs::create_dir_all(env.path("data")).unwrap();
    let vc = env.vc("data");

    assert_eq!(vc.init().await.unwrap(), BootstrapPlan::Clone);

    let client = GitClient::open(env.path("data")).unwrap();
    assert!(client.tracking_oid("master").unwrap().is_some());
    assert!(vc.local_commits(None).await.unwrap().is_empty());
    assert!(env.path("data/templates/invoice/content.html").exists());
}

#[tokio::test]
async fn test_checkout_after_clone_keeps_store_files() {
    let env = Env::new(&[("data/a.json", "{\"v\": 1}\n")]);
    let vc = env.vc("data");
    assert_eq!(vc.init().await.unwrap(), BootstrapPlan::Clone);
    let head = vc.history().await.unwrap()[0].id.clone();

    write_files(
        &env.path("data"),
        &[("settings", "{\"port\": 8080}"), (".tran/1/x.json", "{}"), ("data/a.json", "{\"v\": 9}\n")],
    );
    vc.checkout(head).await.unwrap();

    assert_eq!(std::fs::read_to_string(env.path("data/settings")).unwrap(), "{\"port\": 8080}");
    assert!(env.path("data/.tran/1/x.json").exists());
    assert!(env.path("data/.gitignore").exists());
    assert_eq!(
        std::fs::read_to_string(env.path("data/data/a.json")).unwrap(),
        "{\"v\": 1}\n"
    );
    assert!(vc.local_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bootstrap_against_empty_remote() {
    let env = Env::empty();
    let vc = env.vc("data");

    assert_eq!(vc.init().await.unwrap(), BootstrapPlan::Clone);
    assert_eq!(vc.history().await.unwrap().len(), 1);
    assert_eq!(vc.local_commits(None).await.unwrap().len(), 1);

    vc.push().await.unwrap();
    assert_eq!(env.remote_head(), vc.history().await.unwrap()[0].id);
}

#[tokio::test]
async fn test_bootstrap_local_content_into_empty_remote() {
    let env = Env::empty();
    write_files(&env.path("data"), &[("foo", "foo\n")]);
    let vc = env.vc("data");

    assert_eq!(vc.init().await.unwrap(), BootstrapPlan::CloneAndMerge);
    let history = vc.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(env.remote_head(), history[0].id);
    assert!(vc.local_commits(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bootstrap_local_only() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("foo"), "foo\n").unwrap();
    let vc = VersionControl::new(&VcConfig::for_data_dir(root.path())).unwrap();

    assert_eq!(vc.init().await.unwrap(), BootstrapPlan::LocalInit);

    let history = vc.history().await.unwrap();
    assert_eq!(history.len(), 1);
    let client = GitClient::open(root.path()).unwrap();
    let tree = client.head_tree().unwrap().unwrap();
    assert!(tree.get_name("foo").is_some());
}

#[tokio::test]
async fn test_bootstrap_merges_local_content() {
    let env = Env::new(&[("templates/a.html", "<a/>\n")]);
    write_files(&env.path("data"), &[("data/local.json", "{}\n")]);
    let vc = env.vc("data");

    assert_eq!(vc.init().await.unwrap(), BootstrapPlan::CloneAndMerge);

    let history = vc.history().await.unwrap();
    assert_eq!(history[0].message, "merging in local changes");
    assert_eq!(history.len(), 2);
    assert_eq!(env.remote_head(), history[0].id);
    assert!(vc.local_commits(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bootstrap_conflict_keeps_local_file() {
    let env = Env::new(&[("a.txt", "remote\n")]);
    write_files(&env.path("data"), &[("a.txt", "local\n")]);
    let vc = env.vc("data");

    let err = vc.init().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MergeConflict);
    assert_eq!(std::fs::read_to_string(env.path("data/a.txt")).unwrap(), "local\n");
    assert!(!env.path("data/.git").exists());
}

// ===========================================================================
// Commit / push
// ===========================================================================

#[tokio::test]
async fn test_commit_listed_until_pushed() {
    let env = Env::new(&[("a.txt", "a\n")]);
    let vc = env.vc("data");
    vc.init().await.unwrap();

    write_files(&env.path("data"), &[("b.txt", "b\n")]);
    let commit = vc.commit("add b").await.unwrap();

    let history = vc.history().await.unwrap();
    assert_eq!(history[0].message, "add b");
    let unpushed = vc.local_commits(None).await.unwrap();
    assert_eq!(unpushed.len(), 1);
    assert_eq!(unpushed[0].id, commit.id);

    vc.push().await.unwrap();
    assert!(vc.local_commits(None).await.unwrap().is_empty());
    assert!(vc.local_commits(Some("master".into())).await.unwrap().is_empty());
    assert_eq!(env.remote_head(), commit.id);
}

#[tokio::test]
async fn test_push_while_diverged_is_rejected() {
    let env = Env::new(&[("a.txt", "a\n")]);
    let (local, peer) = two_clones(&env).await;

    write_files(&env.path("peer"), &[("peer.txt", "p\n")]);
    peer.commit("peer").await.unwrap();
    peer.push().await.unwrap();

    write_files(&env.path("local"), &[("local.txt", "l\n")]);
    local.commit("local").await.unwrap();
    let err = local.push().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    // Nothing was marked as pushed.
    assert_eq!(local.local_commits(None).await.unwrap().len(), 1);
}

// ===========================================================================
// Status / merge
// ===========================================================================

#[tokio::test]
async fn test_status_reports_new_remote_commit() {
    let env = Env::new(&[("data/a.json", "{\"v\": 1}\n")]);
    let (local, peer) = two_clones(&env).await;
    assert!(local.status().await.unwrap().is_empty());

    write_files(&env.path("peer"), &[("data/a.json", "{\"v\": 2}\n"), ("data/b.json", "{}\n")]);
    let published = peer.commit("edit").await.unwrap();
    peer.push().await.unwrap();

    let status = local.status().await.unwrap();
    let introduced = peer.diff(published.id).await.unwrap();
    assert_eq!(status, introduced);
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].operation, ChangeOperation::Update);
    assert_eq!(status[0].entity_set, "data");
    assert_eq!(status[1].operation, ChangeOperation::Insert);
}

#[tokio::test]
async fn test_merge_then_push() {
    let env = Env::new(&[("shared.txt", "one\ntwo\nthree\n")]);
    let (local, peer) = two_clones(&env).await;

    write_files(&env.path("peer"), &[("peer.txt", "p\n")]);
    let theirs = peer.commit("peer").await.unwrap();
    peer.push().await.unwrap();
    write_files(&env.path("local"), &[("local.txt", "l\n")]);
    let ours = local.commit("local").await.unwrap();

    let merge = local.merge().await.unwrap();
    assert_eq!(merge.parents, vec![ours.id, theirs.id]);
    assert!(env.path("local/peer.txt").exists());

    local.push().await.unwrap();
    assert_eq!(env.remote_head(), merge.id);
    assert!(local.status().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_merge_conflict_leaves_head() {
    let env = Env::new(&[("shared.txt", "one\ntwo\nthree\n")]);
    let (local, peer) = two_clones(&env).await;

    write_files(&env.path("peer"), &[("shared.txt", "one\npeer\nthree\n")]);
    peer.commit("peer edit").await.unwrap();
    peer.push().await.unwrap();
    write_files(&env.path("local"), &[("shared.txt", "one\nlocal\nthree\n")]);
    let ours = local.commit("local edit").await.unwrap();

    let err = local.merge().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MergeConflict);
    assert_eq!(local.history().await.unwrap()[0].id, ours.id);
    assert_eq!(
        std::fs::read_to_string(env.path("local/shared.txt")).unwrap(),
        "one\nlocal\nthree\n"
    );
}
