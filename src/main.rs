use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gitair::config::LoggingConfig;
use gitair::daemon::is_daemon_running;
use gitair::health::CheckResult;
use gitair::{Config, Daemon, DiscoveryReport, ExcludeMatcher, GitProvider, HealthCheck, Scanner, StatusReport};

#[derive(Parser)]
#[command(name = "gitair")]
#[command(about = "Keeps every git working tree under your scan paths committed, pushed and pulled")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch and synchronize repositories in the foreground (default)
    Run(RunArgs),

    /// List the repositories that would be managed
    Scan {
        /// Show remotes and classification for each repository
        #[arg(long)]
        details: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the last status report written by the daemon
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run as daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },

    /// Write a configuration file
    Init {
        /// Directory to scan for repositories (repeatable)
        #[arg(short, long = "scan-path")]
        scan_paths: Vec<String>,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// System health check and diagnostics
    Doctor,
}

/// Overrides applied on top of the configuration file
#[derive(Args, Default)]
struct RunArgs {
    /// Directories to scan, comma separated
    #[arg(long, value_delimiter = ',')]
    scan: Vec<String>,

    /// Interval between commit checks, e.g. 30s
    #[arg(long)]
    watch_interval: Option<String>,

    /// Interval between remote checks, e.g. 1m
    #[arg(long)]
    pull_interval: Option<String>,

    /// Never commit automatically
    #[arg(long)]
    no_commit: bool,

    /// Commit locally but never push
    #[arg(long)]
    no_push: bool,

    /// Never pull from remotes
    #[arg(long)]
    no_pull: bool,

    /// Commit on the timer only, without filesystem notifications
    #[arg(long)]
    no_watch: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if !self.scan.is_empty() {
            config.scan_paths = self.scan.clone();
        }
        if let Some(interval) = &self.watch_interval {
            config.sync.watch_interval = interval.clone();
        }
        if let Some(interval) = &self.pull_interval {
            config.sync.pull_interval = interval.clone();
        }
        if self.no_commit {
            config.sync.auto_commit = false;
        }
        if self.no_push {
            config.sync.auto_push = false;
        }
        if self.no_pull {
            config.sync.auto_pull = false;
        }
        if self.no_watch {
            config.watcher.enabled = false;
        }
    }
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start daemon in background
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Restart daemon
    Restart,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, load_error) = Config::load_or_fallback(cli.config.as_deref());
    let command = cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default()));

    if let Commands::Run(args) = &command {
        args.apply(&mut config);
    }

    // Forking has to happen before the runtime spawns its threads
    let background = matches!(
        command,
        Commands::Daemon {
            daemon_command: DaemonCommands::Start { foreground: false } | DaemonCommands::Restart
        }
    );
    if background {
        let restart = matches!(
            command,
            Commands::Daemon {
                daemon_command: DaemonCommands::Restart
            }
        );
        if !detach(&mut config, restart)? {
            return Ok(());
        }
    }

    init_logging(&config.logging, cli.verbose, background)?;
    info!("Starting gitair v{}", env!("CARGO_PKG_VERSION"));
    if let Some(e) = load_error {
        warn!("Failed to load configuration, using defaults: {:#}", e);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    runtime.block_on(async move {
        match command {
            Commands::Run(_) => cmd_run(config).await,
            Commands::Scan { details, json } => cmd_scan(details, json, &config).await,
            Commands::Status { json } => cmd_status(json, &config),
            Commands::Daemon { daemon_command } => cmd_daemon(daemon_command, config).await,
            Commands::Init { scan_paths, force } => cmd_init(scan_paths, force, cli.config.as_deref()),
            Commands::Doctor => cmd_doctor(&config),
        }
    })
}

/// Initialize logging from the configuration, `--verbose` and `RUST_LOG`
fn init_logging(logging: &LoggingConfig, verbose: bool, detached: bool) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let ansi = logging.color && !detached;

    let layer = if logging.format == "full" {
        fmt::layer().with_writer(std::io::stderr).with_ansi(ansi).boxed()
    } else {
        fmt::layer().compact().with_writer(std::io::stderr).with_ansi(ansi).boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

/// Refuse to start when the machine cannot commit unattended
fn preflight(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config);

    if !health.all_passed() {
        print_health_report(&health);
        println!();
        bail!("Cannot start - fix the errors above first");
    }

    for warning in health.warnings() {
        println!("⚠️  {}", warning.message);
        if let Some(details) = &warning.details {
            println!("   {}", details);
        }
    }

    Ok(())
}

/// Fork into the background. Returns false when nothing should run.
fn detach(config: &mut Config, restart: bool) -> Result<bool> {
    if is_daemon_running(config)? {
        if !restart {
            println!("⚠️  Daemon is already running!");
            println!("   Use 'gitair daemon stop' to stop it first");
            return Ok(false);
        }

        println!("🛑 Stopping current daemon...");
        Daemon::new(config.clone())?.stop()?;
        wait_for_exit(config, Duration::from_secs(30))?;
    }

    preflight(config)?;

    // The daemon runs from "/", so relative scan paths are pinned first
    config.scan_paths = config
        .resolved_scan_paths()?
        .iter()
        .map(|root| root.to_string_lossy().to_string())
        .collect();

    #[cfg(unix)]
    {
        println!("🚀 Starting gitair daemon...");
        println!("   PID file: {}", config.daemon.pid_file);
        println!("   Log file: {}", config.daemon.log_file);
        println!("   Scan paths: {}", config.scan_paths.join(", "));

        Daemon::new(config.clone())?.daemonize()?;
        return Ok(true);
    }

    #[cfg(not(unix))]
    {
        println!("❌ Background daemon mode not supported on this platform");
        println!("   Use 'daemon start --foreground' to run in foreground mode");
        return Ok(false);
    }
}

fn wait_for_exit(config: &Config, limit: Duration) -> Result<()> {
    let started = Instant::now();
    while is_daemon_running(config)? {
        if started.elapsed() > limit {
            bail!("Daemon did not exit within {:?}", limit);
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    Ok(())
}

/// Watch and synchronize in the foreground until Ctrl+C
async fn cmd_run(config: Config) -> Result<()> {
    if is_daemon_running(&config)? {
        println!("⚠️  A gitair daemon is already running!");
        println!("   Use 'gitair daemon stop' to stop it first");
        return Ok(());
    }

    preflight(&config)?;

    println!("🖥️  Watching {} (Ctrl+C to stop)", config.scan_paths.join(", "));
    let mut daemon = Daemon::new(config)?;
    daemon.run().await
}

/// List the repositories under the scan paths
async fn cmd_scan(details: bool, json: bool, config: &Config) -> Result<()> {
    let roots = config.resolved_scan_paths()?;
    let timeout = config.intervals()?.command_timeout;
    let scanner = Scanner::new(
        ExcludeMatcher::new(&config.exclude_patterns),
        Arc::new(GitProvider::new(timeout)),
    );

    info!("Scanning {} root(s)", roots.len());
    let report = DiscoveryReport::from_outcome(scanner.scan_detailed(&roots).await);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Repositories ({}): ", report.total_repositories);

    for repo in &report.repositories {
        if details {
            println!("📁 {}", repo.name);
            println!("   📍 {}", repo.path.display());
            if repo.is_multi_module {
                println!("   🧩 Multi-module");
            }
            if repo.remotes.is_empty() {
                println!("   ⚠️  No remotes, commits stay local");
            }
            for remote in &repo.remotes {
                println!("   🔗 {} {}", remote.name, remote.url);
            }
            println!();
        } else {
            println!("  📁 {} ({})", repo.name, repo.path.display());
        }
    }

    println!("\n📊 Summary:");
    println!("   Multi-module: {}", report.multi_module);
    println!("   Without remotes: {}", report.without_remotes);
    println!("   Unique remotes: {}", report.unique_remotes);

    if !report.shared_remotes.is_empty() {
        println!("\n🔁 Remotes checked out more than once:");
        for (url, paths) in &report.shared_remotes {
            println!("   {}", url);
            for path in paths {
                println!("      {}", path.display());
            }
        }
    }

    if !report.skipped.is_empty() {
        println!("\n⏭️  Skipped:");
        for skipped in &report.skipped {
            println!("   {}", skipped);
        }
    }

    if report.total_repositories > config.max_repos && config.max_repos > 0 {
        println!(
            "\n⚠️  Only the first {} repositories will be managed (max_repos)",
            config.max_repos
        );
    }

    Ok(())
}

/// Print the status report written by a running daemon
fn cmd_status(json: bool, config: &Config) -> Result<()> {
    let status_file = shellexpand::full(&config.daemon.status_file)?.to_string();
    let status_path = Path::new(&status_file);

    if !status_path.exists() {
        println!("⚠️  No status report at {}", status_file);
        println!("   💡 Use 'gitair daemon start' to start the daemon");
        return Ok(());
    }

    let report = StatusReport::load(status_path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let running = is_daemon_running(config)?;
    println!("📊 gitair Status");
    println!(
        "   {} Daemon: {}",
        if running { "🟢" } else { "🔴" },
        if running { "Running" } else { "Not running" }
    );
    println!("   🕒 Updated: {}", report.generated_at.format("%Y-%m-%d %H:%M:%S"));
    println!("   📁 Repositories: {}", report.total_repositories);
    println!("   ⚙️  Active workers: {}", report.active_workers);
    println!();

    for repo in &report.repositories {
        let icon = if repo.active { "✅" } else { "⏸️ " };
        let kind = if repo.is_multi_module { ", multi-module" } else { "" };
        println!(
            "  {} {} ({} remote(s){})",
            icon, repo.name, repo.remote_count, kind
        );
        println!("     {}", repo.path.display());
    }

    Ok(())
}

/// Handle daemon commands
async fn cmd_daemon(daemon_command: DaemonCommands, config: Config) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { foreground: true } => {
            println!("🚀 Starting gitair daemon...");

            if is_daemon_running(&config)? {
                println!("⚠️  Daemon is already running!");
                println!("   Use 'gitair daemon stop' to stop it first");
                return Ok(());
            }

            preflight(&config)?;

            println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
            Daemon::new(config)?.run().await?;
        }

        // Already detached by main
        DaemonCommands::Start { foreground: false } | DaemonCommands::Restart => {
            Daemon::new(config)?.run().await?;
        }

        DaemonCommands::Stop => {
            println!("🛑 Stopping gitair daemon...");

            if !is_daemon_running(&config)? {
                println!("⚠️  No daemon appears to be running");
                return Ok(());
            }

            if Daemon::new(config)?.stop()? {
                println!("✅ Daemon stop signal sent");
            }
        }

        DaemonCommands::Status => {
            println!("📊 gitair Daemon Status");

            if is_daemon_running(&config)? {
                println!("   🟢 Status: Running");
                println!("   ⏱️  Commit check: every {}", config.sync.watch_interval);
                println!("   🔄 Remote check: every {}", config.sync.pull_interval);

                if !config.daemon.log_file.is_empty() {
                    println!("   📄 Log file: {}", config.daemon.log_file);
                }
                println!("   💡 Use 'gitair status' for per-repository details");
            } else {
                println!("   🔴 Status: Not running");
                println!("   💡 Use 'gitair daemon start' to start the daemon");
            }
        }
    }

    Ok(())
}

/// Write a configuration file with defaults and the given scan paths
fn cmd_init(scan_paths: Vec<String>, force: bool, config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };

    if path.exists() && !force {
        println!("⚠️  Configuration already exists: {}", path.display());
        println!("   Use --force to overwrite it");
        return Ok(());
    }

    let mut config = Config::default();
    if !scan_paths.is_empty() {
        config.scan_paths = scan_paths;
    }
    config.save(&path)?;

    println!("✅ Configuration written to {}", path.display());
    println!("   Scan paths: {}", config.scan_paths.join(", "));
    println!("\n💡 Next steps:");
    println!("   gitair doctor        check git, identity and scan paths");
    println!("   gitair scan          list the repositories that will be managed");
    println!("   gitair daemon start  start synchronizing in the background");

    Ok(())
}

/// System health check and diagnostics
fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config);
    print_health_report(&health);
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 gitair System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
