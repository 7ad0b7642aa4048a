//! System health checks for gitair
//!
//! Preflight checks run by `gitair doctor` to verify the machine can
//! commit and push unattended before the daemon is started.

use crate::config::Config;
use std::process::Command;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Commit identity (user.name / user.email)
    pub identity: CheckResult,
    /// Durations and scan roots in the configuration
    pub settings: CheckResult,
    /// Every scan root exists
    pub scan_roots: CheckResult,
    /// SSH configuration status (warning only, not required)
    pub ssh: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::ok(message)
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::error(message)
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config) -> Self {
        Self {
            git: Self::check_git(),
            identity: Self::check_identity(),
            settings: Self::check_settings(config),
            scan_roots: Self::check_scan_roots(config),
            ssh: Self::check_ssh(),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, check)| check.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, check)| check)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, check)| check)
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check git installation
    fn check_git() -> CheckResult {
        match Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error("Git command failed"),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    /// Automatic commits need an author identity
    fn check_identity() -> CheckResult {
        let read = |key: &str| -> Option<String> {
            let output = Command::new("git").args(["config", "--get", key]).output().ok()?;
            let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (output.status.success() && !value.is_empty()).then_some(value)
        };

        match (read("user.name"), read("user.email")) {
            (Some(name), Some(email)) => {
                CheckResult::ok_with_details("Git identity configured", format!("{} <{}>", name, email))
            }
            (name, email) => {
                let missing: Vec<&str> = [("user.name", name.is_none()), ("user.email", email.is_none())]
                    .into_iter()
                    .filter(|(_, missing)| *missing)
                    .map(|(key, _)| key)
                    .collect();
                CheckResult::error_with_details(
                    format!("Git identity incomplete: {} not set", missing.join(", ")),
                    "Run: git config --global user.name \"Your Name\" && git config --global user.email you@example.com",
                )
            }
        }
    }

    /// Durations parse and are usable as timer periods
    fn check_settings(config: &Config) -> CheckResult {
        match config.intervals() {
            Ok(intervals) => CheckResult::ok_with_details(
                "Configuration valid",
                format!(
                    "commit check every {:?}, remote check every {:?}, rescan every {:?}",
                    intervals.watch, intervals.pull, intervals.rescan
                ),
            ),
            Err(e) => CheckResult::error_with_details("Invalid configuration", format!("{:#}", e)),
        }
    }

    /// Check every scan root exists
    fn check_scan_roots(config: &Config) -> CheckResult {
        let roots = match config.resolved_scan_paths() {
            Ok(roots) => roots,
            Err(e) => return CheckResult::error_with_details("Invalid scan path", format!("{:#}", e)),
        };

        if roots.is_empty() {
            return CheckResult::error_with_details("No scan paths configured", "Run: gitair init --scan-path ~/dev");
        }

        let missing: Vec<String> = roots
            .iter()
            .filter(|root| !root.is_dir())
            .map(|root| root.display().to_string())
            .collect();

        if missing.is_empty() {
            let listed: Vec<String> = roots.iter().map(|r| r.display().to_string()).collect();
            CheckResult::ok_with_details("Scan paths exist", listed.join(", "))
        } else {
            CheckResult::error_with_details(
                "Scan path does not exist",
                format!("Run: mkdir -p {}", missing.join(" ")),
            )
        }
    }

    /// Check SSH configuration (warning only)
    fn check_ssh() -> CheckResult {
        let ssh_dir = dirs::home_dir().unwrap_or_default().join(".ssh");
        if !ssh_dir.exists() {
            return CheckResult::warning_with_details(
                "~/.ssh directory not found",
                "Pushing to SSH remotes may not work. Run: ssh-keygen -t ed25519",
            );
        }

        let ssh_keys = ["id_rsa", "id_ed25519", "id_ecdsa"];
        let found_keys: Vec<_> = ssh_keys
            .iter()
            .filter(|key| ssh_dir.join(key).exists())
            .copied()
            .collect();

        if found_keys.is_empty() {
            CheckResult::warning_with_details(
                "No SSH keys found",
                "Pushing to SSH remotes may not work. Run: ssh-keygen -t ed25519 -C \"your_email@example.com\"",
            )
        } else {
            CheckResult::ok_with_details("SSH keys found", found_keys.join(", "))
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 5] {
        [
            ("Git Installation", &self.git),
            ("Git Identity", &self.identity),
            ("Configuration", &self.settings),
            ("Scan Paths", &self.scan_roots),
            ("SSH Configuration", &self.ssh),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn healthy() -> HealthCheck {
        HealthCheck {
            git: CheckResult::ok("Git OK"),
            identity: CheckResult::ok("Identity OK"),
            settings: CheckResult::ok("Config OK"),
            scan_roots: CheckResult::ok("Roots OK"),
            ssh: CheckResult::ok("SSH OK"),
        }
    }

    #[test]
    fn test_check_result_constructors() {
        let ok = CheckResult::ok_with_details("Test passed", "Some details");
        assert!(ok.passed);
        assert!(!ok.is_warning);
        assert_eq!(ok.details, Some("Some details".to_string()));

        let warning = CheckResult::warning_with_details("Test warning", "Warning details");
        assert!(warning.passed); // Warnings still "pass"
        assert!(warning.is_warning);

        let error = CheckResult::error("Test failed");
        assert!(!error.passed);
        assert!(error.details.is_none());
    }

    #[test]
    fn test_git_check() {
        let result = HealthCheck::check_git();
        // Git should be installed in dev environment
        assert!(result.passed);
        assert!(result.details.is_some());
    }

    #[test]
    fn test_scan_roots_existing() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.scan_paths = vec![temp.path().to_string_lossy().to_string()];

        let result = HealthCheck::check_scan_roots(&config);
        assert!(result.passed);
    }

    #[test]
    fn test_scan_roots_missing() {
        let mut config = Config::default();
        config.scan_paths = vec!["/nonexistent/path/that/does/not/exist".to_string()];

        let result = HealthCheck::check_scan_roots(&config);
        assert!(!result.passed);
        assert!(result.details.unwrap().contains("mkdir -p"));
    }

    #[test]
    fn test_scan_roots_empty() {
        let mut config = Config::default();
        config.scan_paths.clear();

        assert!(!HealthCheck::check_scan_roots(&config).passed);
    }

    #[test]
    fn test_settings_check_reports_bad_duration() {
        let mut config = Config::default();
        assert!(HealthCheck::check_settings(&config).passed);

        config.sync.watch_interval = "every now and then".to_string();
        let result = HealthCheck::check_settings(&config);
        assert!(!result.passed);
        assert!(result.details.unwrap().contains("sync.watch_interval"));
    }

    #[test]
    fn test_check_ssh() {
        let result = HealthCheck::check_ssh();
        // Result depends on system, but should not error
        assert!(result.passed || result.is_warning);
    }

    #[test]
    fn test_all_passed_with_ssh_warning() {
        let health = HealthCheck {
            ssh: CheckResult::warning_with_details("No SSH keys", "ssh-keygen"),
            ..healthy()
        };
        assert!(health.all_passed());
        assert_eq!(health.warnings().len(), 1);
        assert!(health.errors().is_empty());
    }

    #[test]
    fn test_missing_identity_fails() {
        let health = HealthCheck {
            identity: CheckResult::error("Git identity incomplete"),
            ..healthy()
        };
        assert!(!health.all_passed());
        assert_eq!(health.errors().len(), 1);
    }

    #[test]
    fn test_all_checks_order() {
        let names: Vec<&str> = healthy().all_checks().iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec!["Git Installation", "Git Identity", "Configuration", "Scan Paths", "SSH Configuration"]
        );
    }
}
