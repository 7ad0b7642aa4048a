//! Daemon Infrastructure - running the orchestrator as a service
//!
//! PID file management, background daemonization, signal handling and the
//! shutdown broadcast that every long-running loop listens to.

use crate::config::Config;
use crate::git::GitProvider;
use crate::orchestrator::Orchestrator;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Daemon state and control
pub struct Daemon {
    config: Arc<Config>,
    shutdown_sender: broadcast::Sender<()>,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new(config: Config) -> Result<Self> {
        let (shutdown_sender, _) = broadcast::channel(1);

        let pid_file_path = expand_optional(&config.daemon.pid_file).context("Failed to expand PID file path")?;

        Ok(Self {
            config: Arc::new(config),
            shutdown_sender,
            pid_file_path,
        })
    }

    /// Sender that stops a running daemon when sent to
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    /// Run the orchestrator in the foreground until a shutdown signal
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting gitair daemon");
        let shutdown_receiver = self.shutdown_sender.subscribe();

        let mut orchestrator = Orchestrator::new(
            self.config.as_ref().clone(),
            Arc::new(GitProvider::new(self.config.intervals()?.command_timeout)),
        )
        .context("Failed to create orchestrator")?;

        let events = if self.config.watcher.enabled {
            match orchestrator.attach_watcher() {
                Ok(events) => Some(events),
                Err(e) => {
                    error!("File watcher unavailable, relying on timers only: {:#}", e);
                    None
                }
            }
        } else {
            info!("File watcher disabled, relying on timers only");
            None
        };

        self.write_pid_file().context("Failed to write PID file")?;

        let shutdown_sender = self.shutdown_sender.clone();
        let signal_task = tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            let _ = shutdown_sender.send(());
        });

        let result = Arc::new(orchestrator).run(events, shutdown_receiver).await;
        if let Err(e) = &result {
            error!("Daemon loop failed: {:#}", e);
        }

        signal_task.abort();
        self.cleanup().context("Failed to cleanup daemon")?;

        result
    }

    /// Detach from the terminal. Must run before the async runtime is built.
    #[cfg(unix)]
    pub fn daemonize(&self) -> Result<()> {
        use daemonize::Daemonize;

        let mut daemonize = Daemonize::new().working_directory("/");

        if let Some(pid_path) = &self.pid_file_path {
            if let Some(parent) = pid_path.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }
            daemonize = daemonize.pid_file(pid_path);
        }

        if let Some(log_path) = expand_optional(&self.config.daemon.log_file)? {
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            let log_file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .with_context(|| format!("Failed to open log file: {:?}", log_path))?;
            daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
        }

        daemonize.start().context("Failed to daemonize process")?;

        Ok(())
    }

    /// Stop a running daemon by sending SIGTERM to the PID in the PID file
    pub fn stop(&self) -> Result<bool> {
        let Some(pid_file) = &self.pid_file_path else {
            warn!("No PID file configured, cannot stop daemon");
            return Ok(false);
        };

        let Some(pid) = read_pid(pid_file)? else {
            warn!("PID file not found, daemon may not be running");
            return Ok(false);
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
                .context("Failed to send SIGTERM to daemon process")?;
        }

        #[cfg(not(unix))]
        {
            warn!("Daemon stop not implemented for this platform");
            return Ok(false);
        }

        info!("Shutdown signal sent to daemon process {}", pid);
        Ok(true)
    }

    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            debug!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                debug!("PID file removed: {}", pid_file.display());
            }
        }

        info!("Daemon stopped");
        Ok(())
    }
}

fn expand_optional(path: &str) -> Result<Option<PathBuf>> {
    if path.is_empty() {
        return Ok(None);
    }
    let expanded = shellexpand::full(path)?;
    Ok(Some(PathBuf::from(expanded.as_ref())))
}

/// Wait for Ctrl+C or, on Unix, SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to listen for Ctrl+C: {}", e);
                            std::future::pending::<()>().await;
                        }
                        debug!("Ctrl+C received");
                    }
                    _ = sigterm.recv() => debug!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Cannot install SIGTERM handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => debug!("Ctrl+C received"),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// PID recorded in `pid_file`, if the file exists
pub fn read_pid(pid_file: &Path) -> Result<Option<i32>> {
    if !pid_file.exists() {
        return Ok(None);
    }

    let pid_str = fs::read_to_string(pid_file).context("Failed to read PID file")?;
    let pid = pid_str.trim().parse().context("Invalid PID in PID file")?;
    Ok(Some(pid))
}

/// Check if the daemon is running, clearing a stale PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    let Some(pid_file) = expand_optional(&config.daemon.pid_file).context("Failed to expand PID file path")?
    else {
        return Ok(false);
    };

    let Some(pid) = read_pid(&pid_file)? else {
        return Ok(false);
    };

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        return match signal::kill(Pid::from_raw(pid), None) {
            Ok(_) => Ok(true),
            Err(Errno::ESRCH) => {
                // Process doesn't exist, remove stale PID file
                let _ = fs::remove_file(&pid_file);
                Ok(false)
            }
            Err(_) => Ok(true), // Assume running if we can't check
        };
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        return Ok(true);
    }
}
