//! Git adapter
//!
//! Every operation runs the `git` command with the repository path as its
//! working directory; the process-wide current directory is never touched,
//! so any number of workers can share one process.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::debug;

use crate::error::VcsError;

/// One configured remote of a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RemoteTarget {
    pub name: String,
    pub url: String,
}

/// Outcome of a commit attempt that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Committed,
    /// Nothing was staged; not an error
    NothingToCommit,
}

/// Version-control operations scoped to a single working tree
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Vcs: Send + Sync {
    /// True if the working tree differs from HEAD, staged or not
    async fn has_local_changes(&self) -> Result<bool, VcsError>;

    async fn stage_all(&self) -> Result<(), VcsError>;

    async fn commit(&self, message: &str) -> Result<CommitStatus, VcsError>;

    /// Remotes in the order git reports them, unique by name
    async fn list_remotes(&self) -> Result<Vec<RemoteTarget>, VcsError>;

    async fn current_branch(&self) -> Result<String, VcsError>;

    async fn push_to_remote(&self, remote: &str, branch: &str) -> Result<(), VcsError>;

    async fn fetch_from_remote(&self, remote: &str) -> Result<(), VcsError>;

    /// Fetch `remote`, then report whether `remote/branch` has commits HEAD lacks.
    /// A missing remote branch is `Ok(false)`.
    async fn remote_head_differs(&self, remote: &str, branch: &str) -> Result<bool, VcsError>;

    async fn pull_from_remote(&self, remote: &str, branch: &str) -> Result<(), VcsError>;

    /// Move submodules to their tracked remote heads and stage the new pointers
    async fn sync_submodules(&self) -> Result<(), VcsError>;
}

/// Creates adapters bound to a repository path
pub trait VcsProvider: Send + Sync {
    fn open(&self, path: &Path) -> Arc<dyn Vcs>;
}

impl<F> VcsProvider for F
where
    F: Fn(&Path) -> Arc<dyn Vcs> + Send + Sync,
{
    fn open(&self, path: &Path) -> Arc<dyn Vcs> {
        self(path)
    }
}

/// Provider for the real `git` command
#[derive(Debug, Clone)]
pub struct GitProvider {
    command_timeout: Duration,
}

impl GitProvider {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

impl VcsProvider for GitProvider {
    fn open(&self, path: &Path) -> Arc<dyn Vcs> {
        Arc::new(GitRepository::new(path, self.command_timeout))
    }
}

/// Git operations for one working tree
#[derive(Debug, Clone)]
pub struct GitRepository {
    path: PathBuf,
    command_timeout: Duration,
}

/// Captured result of one git invocation
struct GitOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    /// Most useful text for an error message
    fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

impl GitRepository {
    pub fn new(path: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            command_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn git(&self, args: &[&str]) -> Result<GitOutput, VcsError> {
        let command = args.first().copied().unwrap_or_default().to_string();
        debug!("git {} in {}", args.join(" "), self.path.display());

        let mut cmd = AsyncCommand::new("git");
        cmd.args(args)
            .current_dir(&self.path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match timeout(self.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(VcsError::Spawn { command, source }),
            Err(_) => {
                return Err(VcsError::Timeout {
                    command,
                    after: self.command_timeout,
                })
            }
        };

        Ok(GitOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn submodule_paths(&self) -> Result<Vec<String>, VcsError> {
        if !self.path.join(".gitmodules").is_file() {
            return Ok(Vec::new());
        }

        let output = self
            .git(&["config", "--file", ".gitmodules", "--get-regexp", r"^submodule\..*\.path$"])
            .await?;

        // Exit status 1 means no matching keys
        if !output.success {
            return Ok(Vec::new());
        }

        Ok(parse_submodule_paths(&output.stdout))
    }
}

#[async_trait]
impl Vcs for GitRepository {
    async fn has_local_changes(&self) -> Result<bool, VcsError> {
        let output = self.git(&["status", "--porcelain"]).await?;

        if !output.success {
            return Err(VcsError::Status(output.detail()));
        }

        Ok(!output.stdout.trim().is_empty())
    }

    async fn stage_all(&self) -> Result<(), VcsError> {
        let output = self.git(&["add", "-A"]).await?;

        if !output.success {
            return Err(VcsError::Stage(output.detail()));
        }

        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<CommitStatus, VcsError> {
        // Exit code 0 means the index matches HEAD
        let staged = self.git(&["diff", "--cached", "--quiet"]).await?;
        if staged.code == Some(0) {
            debug!("Nothing staged in {}", self.path.display());
            return Ok(CommitStatus::NothingToCommit);
        }

        let output = self.git(&["commit", "-m", message]).await?;

        if !output.success {
            if output.stdout.contains("nothing to commit") {
                return Ok(CommitStatus::NothingToCommit);
            }
            return Err(VcsError::Commit(output.detail()));
        }

        Ok(CommitStatus::Committed)
    }

    async fn list_remotes(&self) -> Result<Vec<RemoteTarget>, VcsError> {
        let output = self.git(&["remote", "-v"]).await?;

        if !output.success {
            return Err(VcsError::RemoteList(output.detail()));
        }

        Ok(parse_remotes(&output.stdout))
    }

    async fn current_branch(&self) -> Result<String, VcsError> {
        let output = self.git(&["branch", "--show-current"]).await?;

        if !output.success {
            return Err(VcsError::Branch(output.detail()));
        }

        let branch = output.stdout.trim().to_string();
        if branch.is_empty() {
            return Err(VcsError::Branch("HEAD is detached".to_string()));
        }

        let head = self.git(&["rev-parse", "--verify", "--quiet", "HEAD"]).await?;
        if !head.success {
            return Err(VcsError::Branch(format!("no commits on {} yet", branch)));
        }

        Ok(branch)
    }

    async fn push_to_remote(&self, remote: &str, branch: &str) -> Result<(), VcsError> {
        let push_error = |detail: String| VcsError::Push {
            remote: remote.to_string(),
            detail,
        };

        let output = self
            .git(&["push", remote, branch])
            .await
            .map_err(|e| push_error(e.to_string()))?;

        if !output.success {
            return Err(push_error(output.detail()));
        }

        Ok(())
    }

    async fn fetch_from_remote(&self, remote: &str) -> Result<(), VcsError> {
        let fetch_error = |detail: String| VcsError::Fetch {
            remote: remote.to_string(),
            detail,
        };

        let output = self
            .git(&["fetch", remote])
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !output.success {
            return Err(fetch_error(output.detail()));
        }

        Ok(())
    }

    async fn remote_head_differs(&self, remote: &str, branch: &str) -> Result<bool, VcsError> {
        self.fetch_from_remote(remote).await?;

        let remote_ref = format!("refs/remotes/{}/{}", remote, branch);
        let exists = self.git(&["rev-parse", "--verify", "--quiet", &remote_ref]).await?;
        if !exists.success {
            debug!("{} has no branch {} yet", remote, branch);
            return Ok(false);
        }

        let range = format!("HEAD..{}", remote_ref);
        let output = self.git(&["rev-list", "--count", &range]).await?;
        if !output.success {
            return Err(VcsError::Fetch {
                remote: remote.to_string(),
                detail: output.detail(),
            });
        }

        let count: u32 = output.stdout.trim().parse().unwrap_or(0);
        Ok(count > 0)
    }

    async fn pull_from_remote(&self, remote: &str, branch: &str) -> Result<(), VcsError> {
        let pull_error = |detail: String| VcsError::Pull {
            remote: remote.to_string(),
            detail,
        };

        let output = self
            .git(&["pull", "--no-edit", "--no-rebase", remote, branch])
            .await
            .map_err(|e| pull_error(e.to_string()))?;

        if !output.success {
            return Err(pull_error(output.detail()));
        }

        Ok(())
    }

    async fn sync_submodules(&self) -> Result<(), VcsError> {
        // Nested working trees without a .gitmodules entry are managed on their own
        let paths = self.submodule_paths().await?;
        if paths.is_empty() {
            debug!("No declared submodules in {}", self.path.display());
            return Ok(());
        }

        let mut args = vec!["submodule", "update", "--init", "--recursive", "--remote", "--"];
        args.extend(paths.iter().map(String::as_str));

        let output = self
            .git(&args)
            .await
            .map_err(|e| VcsError::Submodule(e.to_string()))?;

        if !output.success {
            return Err(VcsError::Submodule(output.detail()));
        }

        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));

        let output = self.git(&args).await?;
        if !output.success {
            return Err(VcsError::Submodule(format!(
                "staging submodule pointers failed: {}",
                output.detail()
            )));
        }

        Ok(())
    }
}

/// Parse `git remote -v` output, keeping fetch URLs in first-seen order
fn parse_remotes(output: &str) -> Vec<RemoteTarget> {
    let mut remotes: Vec<RemoteTarget> = Vec::new();

    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }

        // Only take fetch URLs (ignore push URLs)
        if parts.len() >= 3 && parts[2] != "(fetch)" {
            continue;
        }

        if remotes.iter().any(|r| r.name == parts[0]) {
            continue;
        }

        remotes.push(RemoteTarget {
            name: parts[0].to_string(),
            url: parts[1].to_string(),
        });
    }

    remotes
}

/// Parse `git config --get-regexp submodule\..*\.path` output
fn parse_submodule_paths(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_once(char::is_whitespace))
        .map(|(_, path)| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}
