//! Recording the working tree as a commit.

use tracing::info;

use crate::config::IdentityConfig;
use crate::errors::GitError;
use crate::git::client::GitClient;
use crate::ignore_policy::IgnorePolicy;
use crate::models::Commit;

/// Stages and commits everything the ignore policy admits.
pub struct CommitManager<'a> {
    client: &'a GitClient,
    policy: &'a IgnorePolicy,
    identity: &'a IdentityConfig,
}

impl<'a> CommitManager<'a> {
    pub fn new(client: &'a GitClient, policy: &'a IgnorePolicy, identity: &'a IdentityConfig) -> Self {
        Self {
            client,
            policy,
            identity,
        }
    }

    /// Stage all admitted files and commit them on top of HEAD.
    ///
    /// A commit is created even when nothing changed. The first commit of a
    /// repository has no parent.
    pub fn commit(&self, message: &str) -> Result<Commit, GitError> {
        let repo = self.client.repo();
        let mut index = self.client.stage_all(self.policy)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let sig = GitClient::signature(self.identity)?;
        let parent = self.client.head_commit()?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        let commit = repo.find_commit(oid)?;
        info!(sha = %oid, files = index.len(), "committed");
        Ok(Commit::from(&commit))
    }
}
