use anyhow::{Context, Result};
use dirs::config_dir;
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for Git Air
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Root directories scanned for git working trees
    #[serde(default = "default_scan_paths")]
    pub scan_paths: Vec<String>,

    /// Glob patterns matched against the final path component
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Commit message prefix, combined with the repository name and a timestamp
    #[serde(default = "default_commit_message")]
    pub commit_message: String,

    /// Upper bound on concurrently managed repositories
    #[serde(default = "default_max_repos")]
    pub max_repos: usize,

    /// Commit/push/pull behavior
    #[serde(default)]
    pub sync: SyncConfig,

    /// Repository discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Filesystem watcher settings
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Interval between periodic commit checks
    #[serde(default = "default_watch_interval")]
    pub watch_interval: String, // "30s"

    /// Interval between remote checks
    #[serde(default = "default_pull_interval")]
    pub pull_interval: String, // "60s"

    /// Quiet period after the last filesystem event before committing
    #[serde(default = "default_debounce_delay")]
    pub debounce_delay: String, // "2s"

    /// Commit local changes automatically
    #[serde(default = "default_true")]
    pub auto_commit: bool,

    /// Push to every remote after a commit
    #[serde(default = "default_true")]
    pub auto_push: bool,

    /// Pull remote changes on the pull interval
    #[serde(default = "default_true")]
    pub auto_pull: bool,

    /// Upper bound for a single git invocation
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String, // "5m"
}

/// Discovery configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DiscoveryConfig {
    /// Interval between rescans of the scan paths
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval: String, // "5m"

    /// Stop and forget workers whose working tree disappeared
    #[serde(default = "default_true")]
    pub evict_missing: bool,
}

/// Filesystem watcher configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatcherConfig {
    /// Commit shortly after edits instead of waiting for the watch interval
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Status report written after every reconcile
    #[serde(default = "default_status_file")]
    pub status_file: String,

    /// How long shutdown waits for in-flight sequences
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String, // "30s"
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact" or "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

/// Every configured duration, parsed once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub watch: Duration,
    pub pull: Duration,
    pub debounce: Duration,
    pub rescan: Duration,
    pub command_timeout: Duration,
    pub shutdown_grace: Duration,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_scan_paths() -> Vec<String> {
    vec![".".to_string()]
}
fn default_exclude_patterns() -> Vec<String> {
    ["node_modules", "*.log", "*.tmp", ".DS_Store", "vendor", "target", "build"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}
fn default_commit_message() -> String {
    "auto commit".to_string()
}
fn default_max_repos() -> usize {
    100
}
fn default_watch_interval() -> String {
    "30s".to_string()
}
fn default_pull_interval() -> String {
    "60s".to_string()
}
fn default_debounce_delay() -> String {
    "2s".to_string()
}
fn default_command_timeout() -> String {
    "5m".to_string()
}
fn default_rescan_interval() -> String {
    "5m".to_string()
}
fn default_shutdown_grace() -> String {
    "30s".to_string()
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/gitair.pid", runtime_dir)
    } else {
        "/tmp/gitair.pid".to_string()
    }
}

fn data_dir() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/gitair", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/gitair", home)
    } else {
        "/tmp/gitair".to_string()
    }
}
fn default_log_file() -> String {
    format!("{}/daemon.log", data_dir())
}
fn default_status_file() -> String {
    format!("{}/status.json", data_dir())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            watch_interval: default_watch_interval(),
            pull_interval: default_pull_interval(),
            debounce_delay: default_debounce_delay(),
            auto_commit: default_true(),
            auto_push: default_true(),
            auto_pull: default_true(),
            command_timeout: default_command_timeout(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rescan_interval: default_rescan_interval(),
            evict_missing: default_true(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            status_file: default_status_file(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_paths: default_scan_paths(),
            exclude_patterns: default_exclude_patterns(),
            commit_message: default_commit_message(),
            max_repos: default_max_repos(),
            sync: SyncConfig::default(),
            discovery: DiscoveryConfig::default(),
            watcher: WatcherConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Longest accepted period for any configured duration
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 86400);

/// Parse duration strings like "30s", "5m", "1h", "2d" or bare seconds
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let (value, unit, invalid) = if let Some(value) = duration_str.strip_suffix("ms") {
        let millis = value.trim().parse::<u64>().context("Invalid milliseconds value")?;
        return Ok(Duration::from_millis(millis));
    } else if let Some(value) = duration_str.strip_suffix('s') {
        (value, 1, "Invalid seconds value")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value, 60, "Invalid minutes value")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value, 3600, "Invalid hours value")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        (value, 86400, "Invalid days value")
    } else {
        (
            duration_str.as_str(),
            1,
            "Invalid duration format. Use format like '30s', '5m', '1h'",
        )
    };

    let value = value
        .trim()
        .parse::<u64>()
        .context(invalid)?;
    let secs = value
        .checked_mul(unit)
        .with_context(|| format!("Duration too large: {}", duration_str))?;

    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from the given path or the default location,
    /// falling back to defaults when the file is missing or unreadable.
    ///
    /// The load error, if any, is returned alongside the defaults so it can
    /// be reported once logging is set up.
    pub fn load_or_fallback(path: Option<&Path>) -> (Self, Option<anyhow::Error>) {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_config_path() {
                Ok(path) => path,
                Err(e) => return (Self::default(), Some(e)),
            },
        };

        if !path.exists() {
            return (Self::default(), None);
        }

        match Self::load(&path) {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("gitair").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        for scan_path in &mut self.scan_paths {
            *scan_path = shellexpand::full(scan_path)
                .with_context(|| format!("Failed to expand scan path: {}", scan_path))?
                .into_owned();
        }

        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        self.daemon.status_file = shellexpand::full(&self.daemon.status_file)
            .context("Failed to expand status_file path")?
            .into_owned();

        Ok(())
    }

    /// Resolve every duration string
    pub fn intervals(&self) -> Result<Intervals> {
        let intervals = Intervals {
            watch: parse_duration(&self.sync.watch_interval).context("Invalid sync.watch_interval")?,
            pull: parse_duration(&self.sync.pull_interval).context("Invalid sync.pull_interval")?,
            debounce: parse_duration(&self.sync.debounce_delay)
                .context("Invalid sync.debounce_delay")?,
            rescan: parse_duration(&self.discovery.rescan_interval)
                .context("Invalid discovery.rescan_interval")?,
            command_timeout: parse_duration(&self.sync.command_timeout)
                .context("Invalid sync.command_timeout")?,
            shutdown_grace: parse_duration(&self.daemon.shutdown_grace)
                .context("Invalid daemon.shutdown_grace")?,
        };

        // Timers cannot tick at a zero period
        for (name, value) in [
            ("sync.watch_interval", intervals.watch),
            ("sync.pull_interval", intervals.pull),
            ("discovery.rescan_interval", intervals.rescan),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        for (name, value) in [
            ("sync.watch_interval", intervals.watch),
            ("sync.pull_interval", intervals.pull),
            ("sync.debounce_delay", intervals.debounce),
            ("discovery.rescan_interval", intervals.rescan),
            ("sync.command_timeout", intervals.command_timeout),
            ("daemon.shutdown_grace", intervals.shutdown_grace),
        ] {
            if value > MAX_DURATION {
                anyhow::bail!("{} must not exceed {} days", name, MAX_DURATION.as_secs() / 86400);
            }
        }

        Ok(intervals)
    }

    /// Scan roots as absolute, normalized paths.
    ///
    /// Existing roots are canonicalized so filesystem events (which carry
    /// resolved paths) share a prefix with the registered repositories.
    pub fn resolved_scan_paths(&self) -> Result<Vec<PathBuf>> {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        let mut roots: Vec<PathBuf> = Vec::new();

        for raw in &self.scan_paths {
            let expanded = shellexpand::full(raw)
                .with_context(|| format!("Failed to expand scan path: {}", raw))?;
            let path = PathBuf::from(expanded.as_ref());
            let absolute = if path.is_absolute() { path } else { cwd.join(path) }.clean();
            let resolved = std::fs::canonicalize(&absolute).unwrap_or(absolute);

            if !roots.contains(&resolved) {
                roots.push(resolved);
            }
        }

        Ok(roots)
    }
}
