//! storesync core library.
//!
//! Git-backed version control for a document store's data directory:
//! repository bootstrap, commits, change sets with unified-diff patches,
//! history, and synchronization (status, merge, push) with one remote.
//! [`VersionControl`] is the async entry point a host embeds.

pub mod bootstrap;
pub mod commit;
pub mod config;
pub mod errors;
pub mod git;
pub mod ignore_policy;
pub mod models;
pub mod sync_engine;
pub mod version_control;

// Re-exports for convenience.
pub use bootstrap::{BootstrapPlan, RepositoryBootstrapper};
pub use config::VcConfig;
pub use errors::{ErrorKind, VcError};
pub use ignore_policy::IgnorePolicy;
pub use models::{Change, ChangeOperation, Commit, CommitSummary, SyncState};
pub use sync_engine::{PushPolicy, SyncEngine};
pub use version_control::VersionControl;
