//! Error types for version-control operations and repository discovery
//!
//! Every variant is scoped to one repository and one operation; callers
//! decide whether it aborts a cycle or is merely reported.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("reading working tree status failed: {0}")]
    Status(String),

    #[error("staging changes failed: {0}")]
    Stage(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("no current branch: {0}")]
    Branch(String),

    #[error("push to {remote} failed: {detail}")]
    Push { remote: String, detail: String },

    #[error("fetch from {remote} failed: {detail}")]
    Fetch { remote: String, detail: String },

    #[error("pull from {remote} failed: {detail}")]
    Pull { remote: String, detail: String },

    #[error("submodule update failed: {0}")]
    Submodule(String),

    #[error("listing remotes failed: {0}")]
    RemoteList(String),

    #[error("git {command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl VcsError {
    /// Remote the failure is attributed to, if any
    pub fn remote(&self) -> Option<&str> {
        match self {
            VcsError::Push { remote, .. }
            | VcsError::Fetch { remote, .. }
            | VcsError::Pull { remote, .. } => Some(remote),
            _ => None,
        }
    }
}

/// A subtree that could not be read while scanning
#[derive(Debug, Error)]
#[error("cannot read {path}: {detail}")]
pub struct DiscoveryError {
    pub path: PathBuf,
    pub detail: String,
}
