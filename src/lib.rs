//! gitair - Automatic Git Synchronization for Every Working Tree
//!
//! gitair finds every git working tree under a set of scan paths and keeps
//! each one committed, pushed to all of its remotes, and pulled from them,
//! without any per-repository setup.
//!
//! ## Core Features
//!
//! - **Discovery**: Walks the scan paths for `.git` directories, honoring exclude patterns
//! - **Debounced Commits**: Filesystem events collapse into one commit per quiet period
//! - **Multi-Remote Push**: Every remote is pushed independently, failures stay per-remote
//! - **Periodic Pull**: Remote changes are fetched and merged on a timer
//! - **Daemon Mode**: PID file, background mode, graceful shutdown and a status report
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`discovery`]: Repository scanning and classification
//! - [`watcher`]: Filesystem change detection
//! - [`git`]: Git command execution behind the [`git::Vcs`] trait
//! - [`sync`]: Per-repository commit/push/pull worker
//! - [`orchestrator`]: Worker registry and rescans
//! - [`daemon`]: Process lifecycle

pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod exclude;
pub mod git;
pub mod health;
pub mod orchestrator;
pub mod sync;
pub mod watcher;

pub use config::Config;
pub use daemon::Daemon;
pub use discovery::{DiscoveryReport, RepositoryDescriptor, Scanner};
pub use error::VcsError;
pub use exclude::ExcludeMatcher;
pub use git::{GitProvider, GitRepository, RemoteTarget, Vcs, VcsProvider};
pub use health::HealthCheck;
pub use orchestrator::{Orchestrator, StatusReport};
pub use sync::{SyncWorker, WorkerHandle};
