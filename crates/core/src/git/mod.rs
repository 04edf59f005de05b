//! Git plumbing for storesync.

pub mod changeset;
pub mod client;
pub mod credentials;
pub mod history;
pub mod remote_url;

pub use changeset::{ChangeSetExtractor, SnapshotRef};
pub use client::GitClient;
pub use credentials::{CredentialAttemptState, CredentialNegotiator};
pub use history::RevisionHistoryWalker;
