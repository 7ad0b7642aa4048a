//! Filesystem change detection
//!
//! Directories of every managed working tree are registered with the
//! OS-native watcher one by one (non-recursively) so excluded subtrees such
//! as `node_modules` never cost a watch descriptor. Raw events are
//! translated, then routed to the owning repository by the orchestrator.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use walkdir::WalkDir;

use crate::exclude::ExcludeMatcher;

const MARKER_DIR: &str = ".git";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Remove,
}

/// A mutation somewhere below a watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

#[derive(Default)]
struct Registrations {
    roots: BTreeSet<PathBuf>,
    dirs: BTreeSet<PathBuf>,
}

/// Watches working trees and emits [`ChangeEvent`]s
pub struct ChangeDetector {
    watcher: Mutex<RecommendedWatcher>,
    registrations: Mutex<Registrations>,
    matcher: ExcludeMatcher,
}

impl ChangeDetector {
    /// Create the OS watcher. Events arrive on the returned receiver; the
    /// callback never blocks.
    pub fn start(matcher: ExcludeMatcher) -> Result<(Self, mpsc::UnboundedReceiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in translate_event(&event) {
                    if tx.send(change).is_err() {
                        debug!("Change channel closed, dropping filesystem events");
                        return;
                    }
                }
            }
            Err(e) => error!("File watcher error: {}", e),
        })
        .context("Failed to create file watcher")?;

        Ok((
            Self {
                watcher: Mutex::new(watcher),
                registrations: Mutex::new(Registrations::default()),
                matcher,
            },
            rx,
        ))
    }

    /// Watch every non-excluded directory of a working tree. Returns the
    /// number of directories newly registered.
    pub fn watch_repository(&self, root: &Path) -> usize {
        if let Ok(mut registrations) = self.registrations.lock() {
            registrations.roots.insert(root.to_path_buf());
        }
        self.watch_tree(root)
    }

    /// Register a directory created after its repository was watched
    pub fn watch_new_directory(&self, dir: &Path) -> usize {
        let owned = self
            .registrations
            .lock()
            .map(|r| resolve_owner(dir, r.roots.iter()).is_some())
            .unwrap_or(false);

        if !owned {
            return 0;
        }
        self.watch_tree(dir)
    }

    /// Stop watching a working tree. Directories still covered by another
    /// watched root (an enclosing repository) stay registered.
    pub fn unwatch_repository(&self, root: &Path) {
        let (Ok(mut registrations), Ok(mut watcher)) = (self.registrations.lock(), self.watcher.lock())
        else {
            return;
        };

        registrations.roots.remove(root);

        let released: Vec<PathBuf> = registrations
            .dirs
            .iter()
            .filter(|dir| dir.starts_with(root))
            .filter(|dir| resolve_owner(dir, registrations.roots.iter()).is_none())
            .cloned()
            .collect();

        for dir in &released {
            if let Err(e) = watcher.unwatch(dir) {
                trace!("Unwatch {} failed: {}", dir.display(), e);
            }
            registrations.dirs.remove(dir);
        }

        debug!("Released {} watches for {}", released.len(), root.display());
    }

    /// Number of directories currently registered
    pub fn watched_directories(&self) -> usize {
        self.registrations.lock().map(|r| r.dirs.len()).unwrap_or(0)
    }

    fn watch_tree(&self, top: &Path) -> usize {
        let (Ok(mut registrations), Ok(mut watcher)) = (self.registrations.lock(), self.watcher.lock())
        else {
            return 0;
        };

        let matcher = &self.matcher;
        let mut added = 0;

        let dirs = WalkDir::new(top)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || (entry.file_type().is_dir()
                        && entry.file_name() != MARKER_DIR
                        && !matcher.is_excluded_name(entry.file_name()))
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir());

        for entry in dirs {
            let dir = entry.path();
            if registrations.dirs.contains(dir) {
                continue;
            }

            match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    registrations.dirs.insert(dir.to_path_buf());
                    added += 1;
                }
                Err(e) => warn!("Cannot watch {}: {}", dir.display(), e),
            }
        }

        trace!("Registered {} directories under {}", added, top.display());
        added
    }
}

/// Map a notify event to zero or more change events.
/// Access and metadata-only events are not mutations.
pub fn translate_event(event: &Event) -> Vec<ChangeEvent> {
    let kind = match &event.kind {
        EventKind::Create(_) => ChangeKind::Create,
        EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => ChangeKind::Modify,
        EventKind::Remove(_) => ChangeKind::Remove,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .map(|path| ChangeEvent {
            kind,
            path: path.clone(),
        })
        .collect()
}

/// Longest repository root containing `path`, compared by whole components
pub fn resolve_owner<'a, I>(path: &Path, roots: I) -> Option<&'a PathBuf>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    roots
        .into_iter()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count())
}

/// True if any component between `root` and `path` is excluded or is the
/// repository's own metadata directory
pub fn is_ignored_event(root: &Path, path: &Path, matcher: &ExcludeMatcher) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return true;
    };

    relative.components().any(|component| match component {
        Component::Normal(name) => name == MARKER_DIR || matcher.is_excluded_name(name),
        _ => false,
    })
}
