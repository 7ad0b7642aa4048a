//! Repository discovery
//!
//! Walks the configured scan roots looking for git marker directories,
//! prunes excluded subtrees, classifies every working tree it finds and
//! reads its remotes through the VCS adapter.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::DiscoveryError;
use crate::exclude::ExcludeMatcher;
use crate::git::{RemoteTarget, VcsProvider};

const MARKER_DIR: &str = ".git";
const SUBMODULE_MANIFEST: &str = ".gitmodules";

/// Concurrent `git remote` invocations during one scan
pub const DEFAULT_SCAN_CONCURRENCY: usize = 8;

/// Identity of one managed working tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryDescriptor {
    /// Absolute path to the working tree root; unique key in the registry
    pub path: PathBuf,

    /// Final path component, for display
    pub name: String,

    /// Remotes in registration order, unique by name
    pub remotes: Vec<RemoteTarget>,

    /// Declares submodules or contains nested working trees
    pub is_multi_module: bool,

    /// Whether a worker is currently running for it
    pub active: bool,
}

impl RepositoryDescriptor {
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Self {
            path,
            name,
            remotes: Vec::new(),
            is_multi_module: false,
            active: false,
        }
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }
}

/// Result of the filesystem part of a scan
#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// Working tree roots, sorted and unique
    pub roots: Vec<PathBuf>,

    /// Subtrees that could not be read
    pub skipped: Vec<DiscoveryError>,
}

/// Find every working tree root below `scan_roots`.
///
/// Directories whose name matches an exclusion pattern are never entered.
/// The scan roots themselves are always entered. Marker directories are
/// recorded and not descended into, but the working tree around them is,
/// so nested repositories are found too.
pub fn walk_roots(scan_roots: &[PathBuf], matcher: &ExcludeMatcher) -> WalkOutcome {
    let mut found = BTreeSet::new();
    let mut skipped = Vec::new();

    for scan_root in scan_roots {
        let mut entries = WalkDir::new(scan_root).follow_links(false).into_iter();

        while let Some(entry) = entries.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let err = DiscoveryError {
                        path: e.path().unwrap_or(scan_root).to_path_buf(),
                        detail: e.to_string(),
                    };
                    debug!("Skipping during scan: {}", err);
                    skipped.push(err);
                    continue;
                }
            };

            if !entry.file_type().is_dir() {
                continue;
            }

            if entry.depth() > 0 && matcher.is_excluded_name(entry.file_name()) {
                debug!("Pruning excluded directory: {}", entry.path().display());
                entries.skip_current_dir();
                continue;
            }

            if entry.file_name() == MARKER_DIR {
                if let Some(parent) = entry.path().parent() {
                    debug!("Found working tree: {}", parent.display());
                    found.insert(parent.to_path_buf());
                }
                entries.skip_current_dir();
            }
        }
    }

    WalkOutcome {
        roots: found.into_iter().collect(),
        skipped,
    }
}

/// A root is multi-module if it has a submodule manifest or another
/// discovered root lies strictly below it.
pub fn is_multi_module(root: &Path, all_roots: &[PathBuf]) -> bool {
    if root.join(SUBMODULE_MANIFEST).is_file() {
        return true;
    }

    all_roots
        .iter()
        .any(|other| other != root && other.starts_with(root))
}

/// Everything a scan found
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub repositories: Vec<RepositoryDescriptor>,
    pub skipped: Vec<DiscoveryError>,
}

/// Discovers and describes working trees
#[derive(Clone)]
pub struct Scanner {
    matcher: ExcludeMatcher,
    provider: Arc<dyn VcsProvider>,
    concurrency: usize,
}

impl Scanner {
    pub fn new(matcher: ExcludeMatcher, provider: Arc<dyn VcsProvider>) -> Self {
        Self {
            matcher,
            provider,
            concurrency: DEFAULT_SCAN_CONCURRENCY,
        }
    }

    /// Limit how many repositories have their remotes read at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Scan `roots` and describe every repository found.
    ///
    /// Never fails: unreadable subtrees are skipped and a repository whose
    /// remotes cannot be listed is kept with no remotes.
    pub async fn scan(&self, roots: &[PathBuf]) -> Vec<RepositoryDescriptor> {
        let outcome = self.scan_detailed(roots).await;

        if !outcome.skipped.is_empty() {
            debug!("{} paths could not be read during scan", outcome.skipped.len());
        }

        outcome.repositories
    }

    /// Like [`Scanner::scan`] but also returns the skipped subtrees
    pub async fn scan_detailed(&self, roots: &[PathBuf]) -> ScanOutcome {
        let scan_roots = roots.to_vec();
        let matcher = self.matcher.clone();

        // walkdir is blocking; keep it off the async workers
        let walk = match tokio::task::spawn_blocking(move || walk_roots(&scan_roots, &matcher)).await {
            Ok(walk) => walk,
            Err(e) => {
                error!("Repository walk panicked: {}", e);
                return ScanOutcome::default();
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let descriptors = walk.roots.iter().map(|path| {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            let all_roots = &walk.roots;
            async move {
                let mut descriptor = RepositoryDescriptor::new(path.clone());
                descriptor.is_multi_module = is_multi_module(path, all_roots);

                // The semaphore is never closed
                let _permit = semaphore.acquire().await.ok();

                match provider.open(path).list_remotes().await {
                    Ok(remotes) => descriptor.remotes = remotes,
                    Err(e) => warn!(
                        "Cannot list remotes for {}, continuing without: {}",
                        path.display(),
                        e
                    ),
                }

                descriptor
            }
        });

        let repositories = join_all(descriptors).await;

        info!(
            "Scan found {} repositories under {} roots",
            repositories.len(),
            roots.len()
        );

        ScanOutcome {
            repositories,
            skipped: walk.skipped,
        }
    }
}

/// Normalize a remote URL so SSH and HTTPS forms of one repository compare equal
pub fn normalize_remote_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);

    let normalized = if let Some(rest) = url.strip_prefix("ssh://") {
        let rest = rest.split_once('@').map(|(_, host)| host).unwrap_or(rest);
        format!("https://{}", rest)
    } else if let Some(rest) = url.strip_prefix("git@") {
        format!("https://{}", rest.replacen(':', "/", 1))
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("https://{}", rest)
    } else {
        url.to_string()
    };

    normalized.to_lowercase()
}

/// Summary of a scan, for the `scan` command
#[derive(Debug, Serialize)]
pub struct DiscoveryReport {
    pub total_repositories: usize,
    pub multi_module: usize,
    pub without_remotes: usize,
    pub unique_remotes: usize,
    /// Normalized remote URL to every repository that uses it, where
    /// more than one checkout points at the same remote
    pub shared_remotes: BTreeMap<String, Vec<PathBuf>>,
    pub repositories: Vec<RepositoryDescriptor>,
    pub skipped: Vec<String>,
}

impl DiscoveryReport {
    pub fn from_outcome(outcome: ScanOutcome) -> Self {
        let mut by_remote: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

        for repo in &outcome.repositories {
            let mut seen = BTreeSet::new();
            for remote in &repo.remotes {
                let url = normalize_remote_url(&remote.url);
                if seen.insert(url.clone()) {
                    by_remote.entry(url).or_default().push(repo.path.clone());
                }
            }
        }

        let unique_remotes = by_remote.len();
        let shared_remotes = by_remote
            .into_iter()
            .filter(|(_, paths)| paths.len() > 1)
            .collect();

        Self {
            total_repositories: outcome.repositories.len(),
            multi_module: outcome.repositories.iter().filter(|r| r.is_multi_module).count(),
            without_remotes: outcome.repositories.iter().filter(|r| r.remotes.is_empty()).count(),
            unique_remotes,
            shared_remotes,
            skipped: outcome.skipped.iter().map(|e| e.to_string()).collect(),
            repositories: outcome.repositories,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VcsError;
    use crate::git::testing::ScriptedVcs;
    use crate::git::{MockVcs, Vcs};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn mkrepo(path: &Path) {
        fs::create_dir_all(path.join(MARKER_DIR).join("objects")).unwrap();
    }

    fn default_matcher() -> ExcludeMatcher {
        ExcludeMatcher::new(&["node_modules", "vendor", "*.tmp"])
    }

    fn provider_with_remotes(remotes: Vec<RemoteTarget>) -> Arc<dyn VcsProvider> {
        Arc::new(move |_: &Path| -> Arc<dyn Vcs> {
            let remotes = remotes.clone();
            let mut vcs = MockVcs::new();
            vcs.expect_list_remotes().returning(move || Ok(remotes.clone()));
            Arc::new(vcs)
        })
    }

    #[test]
    fn test_empty_tree_has_no_repositories() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/b/c")).unwrap();
        fs::write(temp.path().join("a/file.txt"), "x").unwrap();

        let outcome = walk_roots(&[temp.path().to_path_buf()], &default_matcher());
        assert!(outcome.roots.is_empty());
    }

    #[test]
    fn test_finds_repositories_at_any_depth() {
        let temp = TempDir::new().unwrap();
        mkrepo(&temp.path().join("one"));
        mkrepo(&temp.path().join("nested/deeper/two"));

        let outcome = walk_roots(&[temp.path().to_path_buf()], &default_matcher());
        assert_eq!(
            outcome.roots,
            vec![temp.path().join("nested/deeper/two"), temp.path().join("one")]
        );
    }

    #[test]
    fn test_excluded_directories_are_not_descended() {
        let temp = TempDir::new().unwrap();
        mkrepo(&temp.path().join("app"));
        mkrepo(&temp.path().join("app/node_modules/dep"));
        mkrepo(&temp.path().join("vendor/lib"));
        mkrepo(&temp.path().join("cache.tmp/inner"));

        let outcome = walk_roots(&[temp.path().to_path_buf()], &default_matcher());
        assert_eq!(outcome.roots, vec![temp.path().join("app")]);
    }

    #[test]
    fn test_scan_root_is_entered_even_if_excluded() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("vendor");
        mkrepo(&root.join("pkg"));

        let outcome = walk_roots(&[root.clone()], &default_matcher());
        assert_eq!(outcome.roots, vec![root.join("pkg")]);
    }

    #[test]
    fn test_scan_root_may_itself_be_a_repository() {
        let temp = TempDir::new().unwrap();
        mkrepo(temp.path());

        let outcome = walk_roots(&[temp.path().to_path_buf()], &default_matcher());
        assert_eq!(outcome.roots, vec![temp.path().to_path_buf()]);
    }

    #[test]
    fn test_marker_contents_are_not_scanned() {
        let temp = TempDir::new().unwrap();
        mkrepo(temp.path());
        // A marker inside the marker directory is not a working tree
        fs::create_dir_all(temp.path().join(".git/modules/sub/.git")).unwrap();

        let outcome = walk_roots(&[temp.path().to_path_buf()], &default_matcher());
        assert_eq!(outcome.roots, vec![temp.path().to_path_buf()]);
    }

    #[test]
    fn test_overlapping_roots_are_deduplicated() {
        let temp = TempDir::new().unwrap();
        mkrepo(&temp.path().join("proj"));

        let roots = vec![temp.path().to_path_buf(), temp.path().join("proj")];
        let outcome = walk_roots(&roots, &default_matcher());
        assert_eq!(outcome.roots, vec![temp.path().join("proj")]);
    }

    #[test]
    fn test_missing_root_is_skipped_not_fatal() {
        let temp = TempDir::new().unwrap();
        mkrepo(&temp.path().join("ok"));

        let roots = vec![temp.path().join("does-not-exist"), temp.path().to_path_buf()];
        let outcome = walk_roots(&roots, &default_matcher());

        assert_eq!(outcome.roots, vec![temp.path().join("ok")]);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].path, temp.path().join("does-not-exist"));
    }

    #[test]
    fn test_multi_module_classification() {
        let temp = TempDir::new().unwrap();
        let plain = temp.path().join("plain");
        let manifest = temp.path().join("with-manifest");
        let parent = temp.path().join("parent");
        mkrepo(&plain);
        mkrepo(&manifest);
        fs::write(manifest.join(SUBMODULE_MANIFEST), "[submodule \"x\"]\n").unwrap();
        mkrepo(&parent);
        mkrepo(&parent.join("modules/child"));

        let outcome = walk_roots(&[temp.path().to_path_buf()], &default_matcher());
        let roots = &outcome.roots;

        assert!(!is_multi_module(&plain, roots));
        assert!(is_multi_module(&manifest, roots));
        assert!(is_multi_module(&parent, roots));
        assert!(!is_multi_module(&parent.join("modules/child"), roots));
    }

    #[test]
    fn test_sibling_with_common_prefix_is_not_nested() {
        let roots = vec![PathBuf::from("/w/app"), PathBuf::from("/w/app-old")];
        assert!(!is_multi_module(Path::new("/w/app"), &roots));
    }

    #[tokio::test]
    async fn test_scan_reads_remotes() {
        let temp = TempDir::new().unwrap();
        mkrepo(&temp.path().join("svc"));

        let remotes = vec![RemoteTarget {
            name: "origin".to_string(),
            url: "git@example.com:team/svc.git".to_string(),
        }];
        let scanner = Scanner::new(default_matcher(), provider_with_remotes(remotes.clone()));

        let repos = scanner.scan(&[temp.path().to_path_buf()]).await;
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].name, "svc");
        assert_eq!(repos[0].remotes, remotes);
        assert!(!repos[0].active);
    }

    #[tokio::test]
    async fn test_remote_listing_is_bounded() {
        let temp = TempDir::new().unwrap();
        for i in 0..12 {
            mkrepo(&temp.path().join(format!("repo-{:02}", i)));
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let provider = {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |_: &Path| -> Arc<dyn Vcs> {
                Arc::new(ScriptedVcs {
                    list_delay: Duration::from_millis(20),
                    in_flight: Arc::clone(&in_flight),
                    peak: Arc::clone(&peak),
                    ..Default::default()
                })
            }
        };

        let scanner = Scanner::new(default_matcher(), Arc::new(provider)).with_concurrency(3);
        let repos = scanner.scan(&[temp.path().to_path_buf()]).await;

        assert_eq!(repos.len(), 12);
        assert_eq!(repos[0].name, "repo-00");
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_remote_listing_failure_keeps_repository() {
        let temp = TempDir::new().unwrap();
        mkrepo(&temp.path().join("broken"));

        let provider: Arc<dyn VcsProvider> = Arc::new(|_: &Path| -> Arc<dyn Vcs> {
            let mut vcs = MockVcs::new();
            vcs.expect_list_remotes()
                .returning(|| Err(VcsError::RemoteList("bad config".to_string())));
            Arc::new(vcs)
        });
        let scanner = Scanner::new(default_matcher(), provider);

        let repos = scanner.scan(&[temp.path().to_path_buf()]).await;
        assert_eq!(repos.len(), 1);
        assert!(repos[0].remotes.is_empty());
    }

    #[test]
    fn test_normalize_remote_url() {
        let expected = "https://github.com/owner/repo";
        assert_eq!(normalize_remote_url("git@github.com:owner/repo.git"), expected);
        assert_eq!(normalize_remote_url("https://github.com/owner/repo.git"), expected);
        assert_eq!(normalize_remote_url("https://github.com/Owner/Repo/"), expected);
        assert_eq!(normalize_remote_url("ssh://git@github.com/owner/repo.git"), expected);
        assert_eq!(normalize_remote_url("http://github.com/owner/repo"), expected);
        assert_ne!(
            normalize_remote_url("git@github.com:owner/repo.git"),
            normalize_remote_url("git@github.com:owner/other.git")
        );
    }

    #[test]
    fn test_report_groups_shared_remotes() {
        let remote = |url: &str| RemoteTarget {
            name: "origin".to_string(),
            url: url.to_string(),
        };
        let mut a = RepositoryDescriptor::new(PathBuf::from("/w/a"));
        a.remotes = vec![remote("git@github.com:me/app.git")];
        let mut b = RepositoryDescriptor::new(PathBuf::from("/w/b"));
        b.remotes = vec![remote("https://github.com/me/app")];
        b.is_multi_module = true;
        let c = RepositoryDescriptor::new(PathBuf::from("/w/c"));

        let report = DiscoveryReport::from_outcome(ScanOutcome {
            repositories: vec![a, b, c],
            skipped: Vec::new(),
        });

        assert_eq!(report.total_repositories, 3);
        assert_eq!(report.multi_module, 1);
        assert_eq!(report.without_remotes, 1);
        assert_eq!(report.unique_remotes, 1);
        assert_eq!(
            report.shared_remotes.get("https://github.com/me/app"),
            Some(&vec![PathBuf::from("/w/a"), PathBuf::from("/w/b")])
        );
    }
}
