//! Common test utilities and helpers for gitair tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;

use gitair::sync::WorkerSettings;

/// A scratch directory holding working trees and bare remotes
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Initialize a working tree on `main` with a local identity
    pub fn init_repo(&self, relative: &str) -> PathBuf {
        let path = self.path().join(relative);
        std::fs::create_dir_all(&path).expect("Failed to create repo dir");
        git(&path, &["init", "--quiet"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        configure_identity(&path);
        path
    }

    /// Initialize a working tree with one commit so HEAD exists
    pub fn init_repo_with_commit(&self, relative: &str) -> PathBuf {
        let path = self.init_repo(relative);
        write_file(&path, "README.md", "# test\n");
        git(&path, &["add", "-A"]);
        git(&path, &["commit", "--quiet", "-m", "initial"]);
        path
    }

    /// Create a bare repository whose HEAD points at `main`
    pub fn init_bare(&self, relative: &str) -> PathBuf {
        let path = self.path().join(relative);
        std::fs::create_dir_all(&path).expect("Failed to create bare dir");
        git(&path, &["init", "--bare", "--quiet"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        path
    }

    /// Clone `remote` into `relative` with a local identity
    pub fn clone_repo(&self, remote: &Path, relative: &str) -> PathBuf {
        let path = self.path().join(relative);
        git(
            self.path(),
            &["clone", "--quiet", &remote.to_string_lossy(), &path.to_string_lossy()],
        );
        configure_identity(&path);
        path
    }
}

fn configure_identity(path: &Path) {
    git(path, &["config", "user.name", "gitair tests"]);
    git(path, &["config", "user.email", "tests@gitair.invalid"]);
    git(path, &["config", "commit.gpgsign", "false"]);
}

/// Run git in `dir`, panicking with its stderr on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("Failed to run git");

    assert!(
        output.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );

    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    std::fs::write(&path, content).expect("Failed to write file");
    path
}

/// Worker settings with every automatic step enabled
pub fn worker_settings(name: &str) -> WorkerSettings {
    WorkerSettings {
        watch_interval: Duration::from_secs(30),
        pull_interval: Duration::from_secs(60),
        debounce: Duration::from_millis(100),
        auto_commit: true,
        auto_push: true,
        auto_pull: true,
        commit_prefix: format!("auto commit - {}", name),
    }
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
