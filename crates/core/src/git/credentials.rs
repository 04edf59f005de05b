//! Credential negotiation for remote operations.
//!
//! libgit2 calls the credentials callback again every time the server
//! rejects what it was given. The negotiator answers at most twice per
//! operation: first with the strongest credential it can derive (URL
//! user-info for HTTPS, the SSH agent otherwise), then with the neutral
//! default credential. After that libgit2 gives up and the operation fails
//! with an authentication error instead of looping.

use git2::{Cred, CredentialType, RemoteCallbacks};
use tracing::{debug, warn};

use crate::git::remote_url;

/// Username used for SSH-agent lookup when nothing better is known.
const DEFAULT_SSH_USER: &str = "git";

/// Per-operation negotiation state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialAttemptState {
    #[default]
    FirstAttempt,
    Retried,
}

/// What the negotiator decided to hand to libgit2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialPlan {
    UserPass { username: String, password: String },
    SshAgent { username: String },
    Default,
}

impl CredentialPlan {
    /// Materialize the plan as a libgit2 credential.
    pub fn into_cred(self) -> Result<Cred, git2::Error> {
        match self {
            Self::UserPass { username, password } => Cred::userpass_plaintext(&username, &password),
            Self::SshAgent { username } => Cred::ssh_key_from_agent(&username),
            Self::Default => Cred::default(),
        }
    }
}

/// Produces credentials for one remote.
#[derive(Debug, Clone)]
pub struct CredentialNegotiator {
    url: String,
    username_hint: Option<String>,
}

impl CredentialNegotiator {
    /// `url` is the configured remote URL; `username_hint` is the configured
    /// SSH username, if any.
    pub fn new(url: impl Into<String>, username_hint: Option<String>) -> Self {
        Self {
            url: url.into(),
            username_hint,
        }
    }

    /// Decide which credential to offer and advance `state`.
    ///
    /// `username` is the user libgit2 extracted from the URL, if any.
    pub fn plan(
        &self,
        url: &str,
        username: Option<&str>,
        state: &mut CredentialAttemptState,
    ) -> CredentialPlan {
        if *state == CredentialAttemptState::Retried {
            debug!("credentials already attempted, offering default credential");
            return CredentialPlan::Default;
        }
        *state = CredentialAttemptState::Retried;

        if let Some((username, password)) = remote_url::embedded_credentials(url) {
            debug!(%username, "using credentials embedded in remote url");
            return CredentialPlan::UserPass { username, password };
        }

        let username = username
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| self.username_hint.clone())
            .or_else(|| remote_url::ssh_username(url))
            .unwrap_or_else(|| DEFAULT_SSH_USER.to_string());
        debug!(%username, "using ssh agent");
        CredentialPlan::SshAgent { username }
    }

    /// Produce a libgit2 credential for `url`.
    pub fn credentials(
        &self,
        url: &str,
        username: Option<&str>,
        state: &mut CredentialAttemptState,
    ) -> Result<Cred, git2::Error> {
        self.plan(url, username, state).into_cred()
    }

    /// Callbacks for a single remote operation, with fresh attempt state.
    ///
    /// The configured URL is used for user-info extraction because libgit2
    /// may hand the callback a URL with credentials already stripped.
    pub fn remote_callbacks<'a>(&self) -> RemoteCallbacks<'a> {
        let negotiator = self.clone();
        let mut state = CredentialAttemptState::default();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed: CredentialType| {
            let result = negotiator.credentials(&negotiator.url, username_from_url, &mut state);
            if let Err(ref e) = result {
                warn!(?allowed, error = %e, "failed to build credential");
            }
            result
        });
        callbacks
    }
}
