//! Snapshot-to-snapshot change extraction.
//!
//! A [`ChangeSetExtractor`] diffs two snapshots (a commit's tree, the staged
//! index, the working tree, or nothing at all) and renders each changed file
//! as a [`Change`] carrying a unified-diff body:
//!
//! ```text
//! Index: templates/a/content.html
//! ===================================================================
//! --- templates/a/content.html
//! +++ templates/a/content.html
//! @@ -1,2 +1,2 @@
//!  <h1>
//! -old
//! +new
//! ```
//!
//! The operation is decided by presence alone; renames are never detected,
//! so a moved file is one `remove` and one `insert`.

use git2::{Diff, DiffDelta, DiffLineType, DiffOptions, Index, Oid, Patch, Tree};
use tracing::debug;

use crate::errors::GitError;
use crate::git::client::GitClient;
use crate::ignore_policy::IgnorePolicy;
use crate::models::{Change, ChangeOperation};

const SEPARATOR: &str = "===================================================================";
const NO_NEWLINE: &str = "\\ No newline at end of file";

/// One side of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRef {
    /// No files at all (the parent of a root commit).
    Empty,
    /// The tree of a commit.
    Commit(Oid),
    /// The index as it is on disk.
    Index,
    /// Every non-ignored file in the data directory, staged in memory.
    WorkingTree,
}

enum Resolved<'r> {
    Tree(Option<Tree<'r>>),
    Index(Index),
}

/// Turns snapshot differences into UI change lists. Never mutates the
/// repository on disk.
pub struct ChangeSetExtractor<'a> {
    client: &'a GitClient,
    policy: &'a IgnorePolicy,
}

impl<'a> ChangeSetExtractor<'a> {
    pub fn new(client: &'a GitClient, policy: &'a IgnorePolicy) -> Self {
        Self { client, policy }
    }

    /// Changes turning `old` into `new`, in diff enumeration order.
    pub fn extract(&self, old: SnapshotRef, new: SnapshotRef) -> Result<Vec<Change>, GitError> {
        debug!(?old, ?new, "extracting changes");
        let repo = self.client.repo();
        let old_side = self.resolve(old)?;
        let new_side = self.resolve(new)?;
        let mut opts = DiffOptions::new();

        let diff = match (&old_side, &new_side) {
            (Resolved::Tree(a), Resolved::Tree(b)) => {
                repo.diff_tree_to_tree(a.as_ref(), b.as_ref(), Some(&mut opts))?
            }
            (Resolved::Tree(a), Resolved::Index(b)) => {
                repo.diff_tree_to_index(a.as_ref(), Some(b), Some(&mut opts))?
            }
            (Resolved::Index(a), Resolved::Tree(b)) => {
                opts.reverse(true);
                repo.diff_tree_to_index(b.as_ref(), Some(a), Some(&mut opts))?
            }
            (Resolved::Index(a), Resolved::Index(b)) => {
                repo.diff_index_to_index(a, b, Some(&mut opts))?
            }
        };
        diff_to_changes(&diff)
    }

    /// Uncommitted changes: HEAD against the working tree.
    pub fn local_changes(&self) -> Result<Vec<Change>, GitError> {
        let head = match self.client.head_commit()? {
            Some(commit) => SnapshotRef::Commit(commit.id()),
            None => SnapshotRef::Empty,
        };
        self.extract(head, SnapshotRef::WorkingTree)
    }

    /// Changes a commit introduced relative to each of its parents, in
    /// parent order. A root commit is compared against the empty tree.
    pub fn commit_changes(&self, id: &str) -> Result<Vec<Change>, GitError> {
        let commit = self.client.find_commit(id)?;
        let new = SnapshotRef::Commit(commit.id());
        if commit.parent_count() == 0 {
            return self.extract(SnapshotRef::Empty, new);
        }
        let mut changes = Vec::new();
        for parent in commit.parent_ids() {
            changes.extend(self.extract(SnapshotRef::Commit(parent), new)?);
        }
        Ok(changes)
    }

    fn resolve(&self, snapshot: SnapshotRef) -> Result<Resolved<'a>, GitError> {
        let repo = self.client.repo();
        Ok(match snapshot {
            SnapshotRef::Empty => Resolved::Tree(None),
            SnapshotRef::Commit(oid) => {
                let commit = repo
                    .find_commit(oid)
                    .map_err(|_| GitError::CommitNotFound(oid.to_string()))?;
                Resolved::Tree(Some(commit.tree()?))
            }
            // Opened separately so it cannot alias the in-memory staging
            // index used for the working tree.
            SnapshotRef::Index => Resolved::Index(Index::open(&repo.path().join("index"))?),
            SnapshotRef::WorkingTree => Resolved::Index(self.client.stage_all(self.policy)?),
        })
    }
}

/// Render every delta of `diff` as a [`Change`].
pub fn diff_to_changes(diff: &Diff<'_>) -> Result<Vec<Change>, GitError> {
    let mut changes = Vec::new();
    for (idx, delta) in diff.deltas().enumerate() {
        let Some(operation) = operation_of(&delta) else {
            continue;
        };
        let path = delta_path(&delta);
        let patch = Patch::from_diff(diff, idx)?;
        let text = render_patch(&path, patch.as_ref())?;
        changes.push(Change::new(&path, operation, text));
    }
    debug!(count = changes.len(), "changes extracted");
    Ok(changes)
}

fn operation_of(delta: &DiffDelta<'_>) -> Option<ChangeOperation> {
    match delta.status() {
        git2::Delta::Added => Some(ChangeOperation::Insert),
        git2::Delta::Deleted => Some(ChangeOperation::Remove),
        git2::Delta::Unmodified | git2::Delta::Ignored | git2::Delta::Untracked => None,
        _ => Some(ChangeOperation::Update),
    }
}

fn delta_path(delta: &DiffDelta<'_>) -> String {
    delta
        .new_file()
        .path()
        .or_else(|| delta.old_file().path())
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default()
}

/// Unified diff text for one file. Binary files get the header only.
fn render_patch(path: &str, patch: Option<&Patch<'_>>) -> Result<String, GitError> {
    let mut lines = vec![
        format!("Index: {path}"),
        SEPARATOR.to_string(),
        format!("--- {path}"),
        format!("+++ {path}"),
    ];

    if let Some(patch) = patch {
        for hunk_idx in 0..patch.num_hunks() {
            let (hunk, line_count) = patch.hunk(hunk_idx)?;
            lines.push(format!(
                "@@ -{},{} +{},{} @@",
                hunk.old_start(),
                hunk.old_lines(),
                hunk.new_start(),
                hunk.new_lines()
            ));
            for line_idx in 0..line_count {
                let line = patch.line_in_hunk(hunk_idx, line_idx)?;
                match line.origin_value() {
                    DiffLineType::ContextEOFNL | DiffLineType::AddEOFNL | DiffLineType::DeleteEOFNL => {
                        lines.push(NO_NEWLINE.to_string());
                    }
                    _ => {
                        let content = String::from_utf8_lossy(line.content());
                        lines.push(format!("{}{}", line.origin(), content.trim_end()));
                    }
                }
            }
        }
    }

    Ok(lines.join("\n") + "\n")
}
