//! Sync Worker - per-repository commit/push and pull cycles
//!
//! One worker runs per managed working tree. It owns two timers (commit
//! checks and remote checks) plus a single debounce timer that filesystem
//! triggers reset. Cycles for one repository never overlap; different
//! repositories' workers run fully in parallel.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Intervals};
use crate::error::VcsError;
use crate::git::{CommitStatus, Vcs};

/// Pending triggers beyond this are redundant; one is enough to re-arm
const TRIGGER_CAPACITY: usize = 16;

/// Far-future deadline for the disarmed debounce timer
const DISARMED: Duration = Duration::from_secs(86400 * 365);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    CommitPending,
    PullPending,
}

/// Bookkeeping owned by one worker
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// A filesystem trigger arrived and no commit cycle has run since
    pub pending_change: bool,
    /// The last push fan-out had at least one failed remote
    pub push_retry_pending: bool,
    pub last_commit: Option<DateTime<Local>>,
    pub last_pull_check: Option<DateTime<Local>>,
}

/// Per-worker copy of the relevant configuration
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub watch_interval: Duration,
    pub pull_interval: Duration,
    pub debounce: Duration,
    pub auto_commit: bool,
    pub auto_push: bool,
    pub auto_pull: bool,
    /// Commit messages are `{commit_prefix} - {timestamp}`
    pub commit_prefix: String,
}

impl WorkerSettings {
    pub fn new(config: &Config, intervals: &Intervals, repo_name: &str) -> Self {
        Self {
            watch_interval: intervals.watch,
            pull_interval: intervals.pull,
            debounce: intervals.debounce,
            auto_commit: config.sync.auto_commit,
            auto_push: config.sync.auto_push,
            auto_pull: config.sync.auto_pull,
            commit_prefix: format!("{} - {}", config.commit_message, repo_name),
        }
    }
}

/// Per-remote results of one push fan-out
#[derive(Debug, Default)]
pub struct PushReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<VcsError>,
}

impl PushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub enum PushOutcome {
    Disabled,
    NoRemotes,
    /// Branch could not be determined; push skipped this cycle
    NoBranch(VcsError),
    Pushed(PushReport),
}

#[derive(Debug)]
pub enum CommitOutcome {
    Disabled,
    /// Working tree matched HEAD and nothing was waiting to be pushed
    NoChanges,
    /// The cycle reached the push step
    Completed {
        commit: Option<CommitStatus>,
        push: PushOutcome,
    },
    /// A local step failed; nothing after it ran
    Aborted(VcsError),
}

#[derive(Debug)]
pub enum PullOutcome {
    Disabled,
    NoBranch(VcsError),
    /// No remote had commits missing locally
    UpToDate { failed: Vec<VcsError> },
    Pulled { remote: String, failed: Vec<VcsError> },
}

/// The autonomous sync loop for one repository
pub struct SyncWorker {
    path: PathBuf,
    name: String,
    multi_module: Arc<AtomicBool>,
    vcs: Arc<dyn Vcs>,
    settings: WorkerSettings,
    state: SyncState,
    worker_state: WorkerState,
}

/// Control side of a running worker, held by the registry
pub struct WorkerHandle {
    trigger: mpsc::Sender<()>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    active: Arc<AtomicBool>,
    multi_module: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Signal a filesystem change. Never blocks. Returns false once the
    /// worker has exited.
    pub fn notify_change(&self) -> bool {
        match self.trigger.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    /// Ask the worker to exit after any in-flight cycle
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Update the classification used for submodule syncing
    pub fn set_multi_module(&self, value: bool) {
        self.multi_module.store(value, Ordering::SeqCst);
    }

    /// Wait for the worker task to end
    pub async fn wait(&mut self) {
        if let Err(e) = (&mut self.task).await {
            if e.is_panic() {
                error!("Sync worker panicked: {}", e);
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl SyncWorker {
    pub fn new(
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        is_multi_module: bool,
        vcs: Arc<dyn Vcs>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            multi_module: Arc::new(AtomicBool::new(is_multi_module)),
            vcs,
            settings,
            state: SyncState::default(),
            worker_state: WorkerState::Idle,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WorkerState {
        self.worker_state
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.state
    }

    /// Start the worker loop on the current runtime
    pub fn spawn(self) -> WorkerHandle {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let active = Arc::new(AtomicBool::new(true));
        let multi_module = Arc::clone(&self.multi_module);

        let task = tokio::spawn(self.run(trigger_rx, stop_rx, Arc::clone(&active)));

        WorkerHandle {
            trigger: trigger_tx,
            stop: stop_tx,
            task,
            active,
            multi_module,
        }
    }

    async fn run(
        mut self,
        mut triggers: mpsc::Receiver<()>,
        mut stop: watch::Receiver<bool>,
        active: Arc<AtomicBool>,
    ) {
        info!("Sync worker started for {}", self.path.display());

        // First ticks come one full period after start
        let now = Instant::now();
        let mut commit_ticker = interval_at(now + self.settings.watch_interval, self.settings.watch_interval);
        commit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pull_ticker = interval_at(now + self.settings.pull_interval, self.settings.pull_interval);
        pull_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let debounce = sleep(DISARMED);
        tokio::pin!(debounce);
        let mut debounce_armed = false;

        loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                Some(()) = triggers.recv() => {
                    self.state.pending_change = true;
                    debounce.as_mut().reset(Instant::now() + self.settings.debounce);
                    debounce_armed = true;
                }
                () = &mut debounce, if debounce_armed => {
                    debounce_armed = false;
                    debug!("Debounce elapsed for {}", self.name);
                    self.commit_cycle().await;
                }
                _ = commit_ticker.tick() => {
                    self.commit_cycle().await;
                }
                _ = pull_ticker.tick() => {
                    self.pull_cycle().await;
                }
            }
        }

        active.store(false, Ordering::SeqCst);
        info!("Sync worker stopped for {}", self.path.display());
    }

    /// Run the submodule-sync, commit and push sequence once
    pub async fn commit_cycle(&mut self) -> CommitOutcome {
        if !self.settings.auto_commit {
            return CommitOutcome::Disabled;
        }

        self.worker_state = WorkerState::CommitPending;
        self.state.pending_change = false;
        let outcome = self.run_commit_sequence().await;
        self.worker_state = WorkerState::Idle;

        match &outcome {
            CommitOutcome::Aborted(e) => warn!("Commit cycle for {} aborted: {}", self.path.display(), e),
            CommitOutcome::Completed {
                push: PushOutcome::Pushed(report),
                ..
            } if !report.is_clean() => {
                for failure in &report.failed {
                    warn!("{}: {}", self.path.display(), failure);
                }
                warn!(
                    "Pushed {} to {} of {} remotes",
                    self.name,
                    report.succeeded.len(),
                    report.succeeded.len() + report.failed.len()
                );
            }
            CommitOutcome::Completed {
                push: PushOutcome::NoBranch(e),
                ..
            } => info!("Skipping push for {}: {}", self.name, e),
            _ => {}
        }

        outcome
    }

    async fn run_commit_sequence(&mut self) -> CommitOutcome {
        if self.multi_module.load(Ordering::SeqCst) {
            if let Err(e) = self.vcs.sync_submodules().await {
                return CommitOutcome::Aborted(e);
            }
        }

        let has_changes = match self.vcs.has_local_changes().await {
            Ok(has_changes) => has_changes,
            Err(e) => return CommitOutcome::Aborted(e),
        };

        let commit = if has_changes {
            if let Err(e) = self.vcs.stage_all().await {
                return CommitOutcome::Aborted(e);
            }

            let message = format!(
                "{} - {}",
                self.settings.commit_prefix,
                Local::now().format("%Y-%m-%d %H:%M:%S")
            );

            match self.vcs.commit(&message).await {
                Ok(status) => {
                    if status == CommitStatus::Committed {
                        info!("Committed changes in {}", self.name);
                        self.state.last_commit = Some(Local::now());
                    }
                    Some(status)
                }
                Err(e) => return CommitOutcome::Aborted(e),
            }
        } else if self.state.push_retry_pending {
            debug!("No new changes in {}, retrying failed pushes", self.name);
            None
        } else {
            debug!("No changes in {}", self.name);
            return CommitOutcome::NoChanges;
        };

        let push = self.push_all().await;
        self.state.push_retry_pending = matches!(&push, PushOutcome::Pushed(report) if !report.is_clean());

        CommitOutcome::Completed { commit, push }
    }

    /// Push the current branch to every remote, collecting per-remote results
    async fn push_all(&self) -> PushOutcome {
        if !self.settings.auto_push {
            return PushOutcome::Disabled;
        }

        let remotes = match self.vcs.list_remotes().await {
            Ok(remotes) => remotes,
            Err(e) => {
                return PushOutcome::Pushed(PushReport {
                    succeeded: Vec::new(),
                    failed: vec![e],
                })
            }
        };

        if remotes.is_empty() {
            debug!("{} has no remotes, skipping push", self.name);
            return PushOutcome::NoRemotes;
        }

        let branch = match self.vcs.current_branch().await {
            Ok(branch) => branch,
            Err(e) => return PushOutcome::NoBranch(e),
        };

        let mut report = PushReport::default();
        for remote in &remotes {
            match self.vcs.push_to_remote(&remote.name, &branch).await {
                Ok(()) => {
                    info!("Pushed {} to {}/{}", self.name, remote.name, branch);
                    report.succeeded.push(remote.name.clone());
                }
                Err(e) => report.failed.push(e),
            }
        }

        PushOutcome::Pushed(report)
    }

    /// Pull from the first remote, in order, that has commits HEAD lacks
    pub async fn pull_cycle(&mut self) -> PullOutcome {
        if !self.settings.auto_pull {
            return PullOutcome::Disabled;
        }

        self.worker_state = WorkerState::PullPending;
        let outcome = self.run_pull_sequence().await;
        self.worker_state = WorkerState::Idle;
        self.state.last_pull_check = Some(Local::now());

        match &outcome {
            PullOutcome::NoBranch(e) => info!("Skipping pull for {}: {}", self.name, e),
            PullOutcome::UpToDate { failed } | PullOutcome::Pulled { failed, .. } => {
                for failure in failed {
                    warn!("{}: {}", self.path.display(), failure);
                }
            }
            PullOutcome::Disabled => {}
        }

        outcome
    }

    async fn run_pull_sequence(&mut self) -> PullOutcome {
        let branch = match self.vcs.current_branch().await {
            Ok(branch) => branch,
            Err(e) => return PullOutcome::NoBranch(e),
        };

        let remotes = match self.vcs.list_remotes().await {
            Ok(remotes) => remotes,
            Err(e) => return PullOutcome::UpToDate { failed: vec![e] },
        };

        let mut failed = Vec::new();
        for remote in &remotes {
            match self.vcs.remote_head_differs(&remote.name, &branch).await {
                Ok(false) => {
                    debug!("{} is up to date with {}", self.name, remote.name);
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    failed.push(e);
                    continue;
                }
            }

            match self.vcs.pull_from_remote(&remote.name, &branch).await {
                Ok(()) => {
                    info!("Pulled {}/{} into {}", remote.name, branch, self.name);
                    return PullOutcome::Pulled {
                        remote: remote.name.clone(),
                        failed,
                    };
                }
                Err(e) => failed.push(e),
            }
        }

        PullOutcome::UpToDate { failed }
    }
}
