//! Orchestrator - repository registry and worker lifecycle
//!
//! Owns the map of known repositories and their sync workers, runs the
//! periodic rescan, routes filesystem events to workers and tears every
//! worker down on shutdown.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::{Config, Intervals};
use crate::discovery::{DiscoveryReport, RepositoryDescriptor, ScanOutcome, Scanner};
use crate::exclude::ExcludeMatcher;
use crate::git::VcsProvider;
use crate::sync::{SyncWorker, WorkerHandle, WorkerSettings};
use crate::watcher::{is_ignored_event, resolve_owner, ChangeDetector, ChangeEvent, ChangeKind};

/// What one `reconcile` call changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Workers started for repositories not seen before
    pub started: usize,
    /// Workers restarted because their task had ended
    pub restarted: usize,
    /// Known repositories whose remotes and classification were refreshed
    pub refreshed: usize,
    /// New repositories not started because `max_repos` was reached
    pub skipped_limit: usize,
}

/// One line of the status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryStatus {
    pub name: String,
    pub path: PathBuf,
    pub remote_count: usize,
    pub is_multi_module: bool,
    pub active: bool,
}

/// Snapshot of the registry for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub total_repositories: usize,
    pub active_workers: usize,
    pub repositories: Vec<RepositoryStatus>,
    pub generated_at: DateTime<Local>,
}

impl StatusReport {
    /// Read a report written by a running orchestrator
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read status file: {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse status file: {:?}", path))
    }
}

#[derive(Default)]
struct Registry {
    repositories: BTreeMap<PathBuf, RepositoryDescriptor>,
    workers: HashMap<PathBuf, WorkerHandle>,
    shut_down: bool,
}

/// Keeps one sync worker running per discovered repository
pub struct Orchestrator {
    config: Arc<Config>,
    intervals: Intervals,
    roots: Vec<PathBuf>,
    matcher: ExcludeMatcher,
    scanner: Scanner,
    provider: Arc<dyn VcsProvider>,
    registry: Mutex<Registry>,
    detector: Option<Arc<ChangeDetector>>,
}

impl Orchestrator {
    pub fn new(config: Config, provider: Arc<dyn VcsProvider>) -> Result<Self> {
        let intervals = config.intervals()?;
        let roots = config
            .resolved_scan_paths()
            .context("Failed to resolve scan paths")?;
        let matcher = ExcludeMatcher::new(&config.exclude_patterns);
        let scanner = Scanner::new(matcher.clone(), Arc::clone(&provider));

        Ok(Self {
            config: Arc::new(config),
            intervals,
            roots,
            matcher,
            scanner,
            provider,
            registry: Mutex::new(Registry::default()),
            detector: None,
        })
    }

    /// Start the filesystem watcher; events must be passed to [`Orchestrator::run`]
    pub fn attach_watcher(&mut self) -> Result<mpsc::UnboundedReceiver<ChangeEvent>> {
        let (detector, events) = ChangeDetector::start(self.matcher.clone())?;
        self.detector = Some(Arc::new(detector));
        Ok(events)
    }

    /// Start workers for new repositories and refresh known ones.
    ///
    /// A running worker is never restarted because its remotes changed; it
    /// re-reads them on every cycle.
    pub async fn reconcile(&self, discovered: Vec<RepositoryDescriptor>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let mut newly_watched = Vec::new();

        {
            let mut guard = self.registry.lock().await;
            let registry = &mut *guard;

            if registry.shut_down {
                debug!("Ignoring reconcile after shutdown");
                return summary;
            }

            for mut descriptor in discovered {
                if let Some(existing) = registry.repositories.get_mut(&descriptor.path) {
                    existing.remotes = descriptor.remotes;
                    existing.is_multi_module = descriptor.is_multi_module;
                    summary.refreshed += 1;

                    match registry.workers.get(&existing.path) {
                        Some(handle) if !handle.is_finished() => {
                            handle.set_multi_module(existing.is_multi_module);
                            continue;
                        }
                        _ => {}
                    }

                    warn!("Sync worker for {} had exited, restarting", existing.path.display());
                    let handle = self.start_worker(existing);
                    existing.active = true;
                    registry.workers.insert(existing.path.clone(), handle);
                    summary.restarted += 1;
                    continue;
                }

                if self.config.max_repos > 0 && registry.workers.len() >= self.config.max_repos {
                    summary.skipped_limit += 1;
                    continue;
                }

                info!("Managing new repository: {}", descriptor.path.display());
                let handle = self.start_worker(&descriptor);
                descriptor.active = true;
                newly_watched.push(descriptor.path.clone());
                registry.workers.insert(descriptor.path.clone(), handle);
                registry.repositories.insert(descriptor.path.clone(), descriptor);
                summary.started += 1;
            }
        }

        if summary.skipped_limit > 0 {
            warn!(
                "Repository limit of {} reached, {} repositories not managed",
                self.config.max_repos, summary.skipped_limit
            );
        }

        if let Some(detector) = &self.detector {
            if !newly_watched.is_empty() {
                let detector = Arc::clone(detector);
                // Registering watches walks the tree
                let registered = tokio::task::spawn_blocking(move || {
                    newly_watched
                        .iter()
                        .map(|path| detector.watch_repository(path))
                        .sum::<usize>()
                })
                .await
                .unwrap_or(0);
                debug!("Watching {} new directories", registered);
            }
        }

        summary
    }

    fn start_worker(&self, descriptor: &RepositoryDescriptor) -> WorkerHandle {
        let settings = WorkerSettings::new(&self.config, &self.intervals, &descriptor.name);
        let vcs = self.provider.open(&descriptor.path);

        SyncWorker::new(
            descriptor.path.clone(),
            descriptor.name.clone(),
            descriptor.is_multi_module,
            vcs,
            settings,
        )
        .spawn()
    }

    /// Stop and forget repositories whose marker directory is gone.
    /// Returns the evicted paths.
    pub async fn evict_missing(&self) -> Vec<PathBuf> {
        let mut guard = self.registry.lock().await;
        let registry = &mut *guard;

        let missing: Vec<PathBuf> = registry
            .repositories
            .keys()
            .filter(|path| !path.join(".git").is_dir())
            .cloned()
            .collect();

        for path in &missing {
            if let Some(handle) = registry.workers.remove(path) {
                handle.stop();
            }
            registry.repositories.remove(path);
            if let Some(detector) = &self.detector {
                detector.unwatch_repository(path);
            }
            info!("Repository disappeared, evicted: {}", path.display());
        }

        missing
    }

    /// Stop every worker, letting in-flight cycles finish within the grace
    /// period. Safe to call more than once; later calls do nothing.
    pub async fn shutdown_all(&self) {
        let mut handles: Vec<WorkerHandle> = {
            let mut guard = self.registry.lock().await;
            let registry = &mut *guard;

            if registry.shut_down {
                return;
            }
            registry.shut_down = true;

            for descriptor in registry.repositories.values_mut() {
                descriptor.active = false;
            }
            registry.workers.drain().map(|(_, handle)| handle).collect()
        };

        info!("Stopping {} sync workers", handles.len());
        for handle in &handles {
            handle.stop();
        }

        let grace = self.intervals.shutdown_grace;
        if timeout(grace, join_all(handles.iter_mut().map(|h| h.wait())))
            .await
            .is_err()
        {
            let stragglers = handles.iter().filter(|h| !h.is_finished()).count();
            warn!(
                "{} sync workers still busy after {:?}, aborting them",
                stragglers, grace
            );
            for handle in &handles {
                if !handle.is_finished() {
                    handle.abort();
                }
            }
        }

        info!("All sync workers stopped");
    }

    /// Current registry snapshot
    pub async fn status(&self) -> StatusReport {
        let registry = self.registry.lock().await;

        let repositories: Vec<RepositoryStatus> = registry
            .repositories
            .values()
            .map(|descriptor| RepositoryStatus {
                name: descriptor.name.clone(),
                path: descriptor.path.clone(),
                remote_count: descriptor.remote_count(),
                is_multi_module: descriptor.is_multi_module,
                active: registry
                    .workers
                    .get(&descriptor.path)
                    .map(|h| h.is_active())
                    .unwrap_or(false),
            })
            .collect();

        StatusReport {
            total_repositories: repositories.len(),
            active_workers: repositories.iter().filter(|r| r.active).count(),
            repositories,
            generated_at: Local::now(),
        }
    }

    /// Route one filesystem event to the repository that owns it
    pub async fn handle_event(&self, event: ChangeEvent) {
        let new_directory = {
            let registry = self.registry.lock().await;

            let Some(root) = resolve_owner(&event.path, registry.repositories.keys()) else {
                trace!("Event outside managed repositories: {}", event.path.display());
                return;
            };

            if is_ignored_event(root, &event.path, &self.matcher) {
                trace!("Ignoring event for {}", event.path.display());
                return;
            }

            debug!("{:?} {}", event.kind, event.path.display());
            if let Some(handle) = registry.workers.get(root) {
                handle.notify_change();
            }

            event.kind == ChangeKind::Create
        };

        let Some(detector) = self.detector.as_ref().filter(|_| new_directory) else {
            return;
        };

        let detector = Arc::clone(detector);
        let path = event.path;
        match tokio::task::spawn_blocking(move || path.is_dir().then(|| detector.watch_new_directory(&path)))
            .await
        {
            Ok(Some(registered)) => debug!("Watching {} new directories", registered),
            Ok(None) => {}
            Err(e) => warn!("Failed to register new directory: {}", e),
        }
    }

    /// Scan all roots, evict vanished repositories and reconcile
    pub async fn rescan(&self) -> ReconcileSummary {
        let outcome = self.scanner.scan_detailed(&self.roots).await;
        self.apply_scan(outcome).await
    }

    async fn apply_scan(&self, outcome: ScanOutcome) -> ReconcileSummary {
        if self.config.discovery.evict_missing {
            self.evict_missing().await;
        }

        let report = DiscoveryReport::from_outcome(outcome);
        let summary = self.reconcile(report.repositories).await;

        if summary.started > 0 || summary.restarted > 0 {
            info!(
                "Discovered {} repositories ({} multi-module, {} unique remotes), {} workers started",
                report.total_repositories,
                report.multi_module,
                report.unique_remotes,
                summary.started + summary.restarted
            );
        }

        self.write_status_file().await;
        summary
    }

    /// Persist the status report for `gitair status`
    pub async fn write_status_file(&self) {
        if self.config.daemon.status_file.is_empty() {
            return;
        }

        let path = PathBuf::from(&self.config.daemon.status_file);
        let report = self.status().await;

        if let Err(e) = write_status(&path, &report).await {
            warn!("Failed to write status file {}: {:#}", path.display(), e);
        }
    }

    /// Run until `shutdown` fires: initial scan, event routing, periodic
    /// rescans, then an orderly stop of every worker.
    pub async fn run(
        self: Arc<Self>,
        events: Option<mpsc::UnboundedReceiver<ChangeEvent>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        info!(
            "Watching {} scan roots (rescan every {:?})",
            self.roots.len(),
            self.intervals.rescan
        );

        let event_task = events.map(|mut events| {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    this.handle_event(event).await;
                }
            })
        });

        let initial = self.rescan().await;
        info!("Initial scan started {} workers", initial.started);

        let rescan = self.intervals.rescan;
        let mut ticker = interval_at(Instant::now() + rescan, rescan);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let summary = self.rescan().await;
                    debug!("Rescan: {:?}", summary);
                }
            }
        }

        if let Some(task) = event_task {
            task.abort();
        }

        self.shutdown_all().await;
        self.write_status_file().await;

        Ok(())
    }
}

async fn write_status(path: &Path, report: &StatusReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let content = serde_json::to_string_pretty(report).context("Failed to serialize status")?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write status file: {:?}", path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VcsError;
    use crate::git::testing::ScriptedVcs;
    use crate::git::{MockVcs, RemoteTarget, Vcs};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Mock adapter: clean working tree, no remotes
    fn idle_vcs() -> Arc<dyn Vcs> {
        let mut vcs = MockVcs::new();
        vcs.expect_has_local_changes().returning(|| Ok(false));
        vcs.expect_list_remotes().returning(|| Ok(Vec::new()));
        vcs.expect_sync_submodules().returning(|| Ok(()));
        vcs.expect_current_branch()
            .returning(|| Err(VcsError::Branch("HEAD is detached".to_string())));
        Arc::new(vcs)
    }

    fn test_config(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.scan_paths = vec![temp.path().to_string_lossy().to_string()];
        config.daemon.status_file = temp.path().join("state/status.json").to_string_lossy().to_string();
        config.sync.watch_interval = "1h".to_string();
        config.sync.pull_interval = "1h".to_string();
        config.daemon.shutdown_grace = "5s".to_string();
        config
    }

    fn orchestrator(config: Config) -> Orchestrator {
        let provider: Arc<dyn VcsProvider> = Arc::new(|_: &Path| idle_vcs());
        Orchestrator::new(config, provider).unwrap()
    }

    fn descriptor(path: &Path) -> RepositoryDescriptor {
        RepositoryDescriptor::new(path.to_path_buf())
    }

    fn mkrepo(path: &Path) {
        std::fs::create_dir_all(path.join(".git")).unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(test_config(&temp));
        let discovered = vec![descriptor(Path::new("/w/a")), descriptor(Path::new("/w/b"))];

        let first = orch.reconcile(discovered.clone()).await;
        assert_eq!(first.started, 2);
        let after_first = orch.status().await.active_workers;

        let second = orch.reconcile(discovered).await;
        assert_eq!(second.started, 0);
        assert_eq!(second.refreshed, 2);
        assert_eq!(orch.status().await.active_workers, after_first);
        assert_eq!(after_first, 2);

        orch.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_reconcile_refreshes_remotes_without_restart() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(test_config(&temp));

        orch.reconcile(vec![descriptor(Path::new("/w/a"))]).await;

        let mut updated = descriptor(Path::new("/w/a"));
        updated.remotes = vec![RemoteTarget {
            name: "origin".to_string(),
            url: "/srv/a.git".to_string(),
        }];
        let summary = orch.reconcile(vec![updated]).await;

        assert_eq!(summary, ReconcileSummary { refreshed: 1, ..Default::default() });
        let status = orch.status().await;
        assert_eq!(status.repositories[0].remote_count, 1);
        assert!(status.repositories[0].active);

        orch.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_max_repos_caps_new_workers() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(&temp);
        config.max_repos = 2;
        let orch = orchestrator(config);

        let summary = orch
            .reconcile(vec![
                descriptor(Path::new("/w/a")),
                descriptor(Path::new("/w/b")),
                descriptor(Path::new("/w/c")),
            ])
            .await;

        assert_eq!(summary.started, 2);
        assert_eq!(summary.skipped_limit, 1);
        assert_eq!(orch.status().await.total_repositories, 2);

        orch.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything_and_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(test_config(&temp));
        orch.reconcile(vec![descriptor(Path::new("/w/a")), descriptor(Path::new("/w/b"))])
            .await;

        orch.shutdown_all().await;
        let status = orch.status().await;
        assert_eq!(status.total_repositories, 2);
        assert_eq!(status.active_workers, 0);

        orch.shutdown_all().await;

        // No workers start after shutdown
        let summary = orch.reconcile(vec![descriptor(Path::new("/w/c"))]).await;
        assert_eq!(summary.started, 0);
    }

    #[tokio::test]
    async fn test_evict_missing_repositories() {
        let temp = TempDir::new().unwrap();
        let kept = temp.path().join("kept");
        let gone = temp.path().join("gone");
        mkrepo(&kept);
        mkrepo(&gone);

        let orch = orchestrator(test_config(&temp));
        orch.reconcile(vec![descriptor(&kept), descriptor(&gone)]).await;

        std::fs::remove_dir_all(&gone).unwrap();
        let evicted = orch.evict_missing().await;

        assert_eq!(evicted, vec![gone]);
        let status = orch.status().await;
        assert_eq!(status.total_repositories, 1);
        assert_eq!(status.repositories[0].path, kept);

        orch.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_rescan_discovers_and_writes_status_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        mkrepo(&root.join("one"));
        mkrepo(&root.join("mono"));
        mkrepo(&root.join("mono/inner"));

        let config = test_config(&temp);
        let status_path = PathBuf::from(&config.daemon.status_file);
        let orch = orchestrator(config);

        let summary = orch.rescan().await;
        assert_eq!(summary.started, 3);

        let written = StatusReport::load(&status_path).unwrap();
        assert_eq!(written.total_repositories, 3);
        assert_eq!(written.active_workers, 3);
        let mono = written
            .repositories
            .iter()
            .find(|r| r.name == "mono")
            .unwrap();
        assert!(mono.is_multi_module);

        orch.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_events_route_to_innermost_repository() {
        let temp = TempDir::new().unwrap();
        let outer_checks = Arc::new(AtomicUsize::new(0));
        let inner_checks = Arc::new(AtomicUsize::new(0));

        let (outer_counter, inner_counter) = (Arc::clone(&outer_checks), Arc::clone(&inner_checks));
        let provider: Arc<dyn VcsProvider> = Arc::new(move |path: &Path| -> Arc<dyn Vcs> {
            let counter = if path.ends_with("inner") {
                Arc::clone(&inner_counter)
            } else {
                Arc::clone(&outer_counter)
            };
            let mut vcs = MockVcs::new();
            vcs.expect_sync_submodules().returning(|| Ok(()));
            vcs.expect_has_local_changes().returning(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            });
            Arc::new(vcs)
        });

        let mut config = test_config(&temp);
        config.sync.debounce_delay = "50ms".to_string();
        let orch = Orchestrator::new(config, provider).unwrap();

        let outer = descriptor(Path::new("/w/mono"));
        let inner = descriptor(Path::new("/w/mono/libs/inner"));
        orch.reconcile(vec![outer, inner]).await;

        orch.handle_event(ChangeEvent {
            kind: ChangeKind::Modify,
            path: PathBuf::from("/w/mono/libs/inner/src/lib.rs"),
        })
        .await;
        // Ignored: metadata directory and excluded name
        orch.handle_event(ChangeEvent {
            kind: ChangeKind::Modify,
            path: PathBuf::from("/w/mono/.git/index"),
        })
        .await;
        orch.handle_event(ChangeEvent {
            kind: ChangeKind::Create,
            path: PathBuf::from("/w/mono/node_modules/x.js"),
        })
        .await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(inner_checks.load(Ordering::SeqCst), 1);
        assert_eq!(outer_checks.load(Ordering::SeqCst), 0);

        orch.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_workers_past_grace() {
        let temp = TempDir::new().unwrap();
        let commits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&commits);
        let provider: Arc<dyn VcsProvider> = Arc::new(move |_: &Path| -> Arc<dyn Vcs> {
            Arc::new(ScriptedVcs {
                dirty: AtomicBool::new(true),
                stage_delay: Duration::from_secs(3600),
                commits: Arc::clone(&counter),
                ..Default::default()
            })
        });

        let mut config = test_config(&temp);
        config.sync.debounce_delay = "100ms".to_string();
        config.daemon.shutdown_grace = "1s".to_string();
        let orch = Orchestrator::new(config, provider).unwrap();

        orch.reconcile(vec![descriptor(Path::new("/w/slow"))]).await;
        orch.handle_event(ChangeEvent {
            kind: ChangeKind::Modify,
            path: PathBuf::from("/w/slow/draft.md"),
        })
        .await;
        // Worker is now stuck staging
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        orch.shutdown_all().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(60), "{:?}", elapsed);
        assert_eq!(orch.status().await.active_workers, 0);

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_created_directory_gets_watched() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        mkrepo(&repo);

        let mut orch = orchestrator(test_config(&temp));
        let _events = orch.attach_watcher().unwrap();
        orch.reconcile(vec![descriptor(&repo)]).await;

        let detector = Arc::clone(orch.detector.as_ref().unwrap());
        assert_eq!(detector.watched_directories(), 1);

        std::fs::create_dir_all(repo.join("src/nested")).unwrap();
        std::fs::write(repo.join("README.md"), "hello\n").unwrap();

        orch.handle_event(ChangeEvent {
            kind: ChangeKind::Create,
            path: repo.join("README.md"),
        })
        .await;
        assert_eq!(detector.watched_directories(), 1);

        orch.handle_event(ChangeEvent {
            kind: ChangeKind::Create,
            path: repo.join("src"),
        })
        .await;
        assert_eq!(detector.watched_directories(), 3);

        orch.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let temp = TempDir::new().unwrap();
        mkrepo(&temp.path().join("repo"));

        let orch = Arc::new(orchestrator(test_config(&temp)));
        let (tx, rx) = broadcast::channel(1);

        let task = tokio::spawn(Arc::clone(&orch).run(None, rx));
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(()).unwrap();

        task.await.unwrap().unwrap();
        let status = orch.status().await;
        assert_eq!(status.total_repositories, 1);
        assert_eq!(status.active_workers, 0);
    }
}
