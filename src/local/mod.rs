//! Local script runner.
//!
//! Runs one stage script as a privileged subprocess in its own process group,
//! with stdout and stderr merged into the stage log. The log path is also
//! exported to the script through an environment variable.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use chrono::Local;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::StageError;
use crate::stage::ScriptSpec;

#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Prefix such as `["sudo"]`; empty runs as the current user.
    pub elevate: Vec<String>,
    pub log_env_var: String,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            elevate: vec!["sudo".to_string()],
            log_env_var: "LOG_FILE".to_string(),
        }
    }
}

/// Sends SIGTERM to a process group when dropped, unless disarmed.
///
/// Stress tools fork their own workers, so killing only the direct child
/// would leave load running.
#[derive(Debug)]
pub struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    /// Guard the group led by `pid`. A `None` pid guards nothing.
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|p| p as i32),
        }
    }

    /// The group exited on its own; nothing to clean up.
    pub fn disarm(&mut self) {
        self.pgid = None;
    }

    pub fn terminate(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
            Ok(()) => debug!(pgid, "Sent SIGTERM to process group"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid, error = %e, "Failed to terminate process group"),
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Runs stage scripts on this machine.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner {
    settings: LocalSettings,
}

impl LocalRunner {
    pub fn new(settings: LocalSettings) -> Self {
        Self { settings }
    }

    /// Full argv: elevation prefix, interpreter, script and arguments.
    pub fn command_line(&self, script: &ScriptSpec) -> Vec<String> {
        let mut argv = self.settings.elevate.clone();
        argv.extend(script.argv());
        argv
    }

    /// Run `script` with its combined output written to `log_path`.
    ///
    /// Returns the exit code; a non-zero code is not an error here. A missing
    /// script fails before anything is spawned. On cancellation the whole
    /// process group is terminated.
    pub async fn run(
        &self,
        script: &ScriptSpec,
        log_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<i32, StageError> {
        if !script.path.exists() {
            return Err(StageError::ScriptNotFound {
                path: script.path.clone(),
            });
        }

        let log_error = |source| StageError::LogFile {
            path: log_path.to_path_buf(),
            source,
        };

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).map_err(log_error)?;
        }
        let mut log = File::create(log_path).map_err(log_error)?;
        writeln!(
            log,
            "=== {} - Started at {} ===",
            log_path.display(),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )
        .map_err(log_error)?;
        let stdout = log.try_clone().map_err(log_error)?;
        let stderr = log.try_clone().map_err(log_error)?;

        let argv = self.command_line(script);
        let command_line = argv.join(" ");
        info!(command = %command_line, log = %log_path.display(), "Starting local script");

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .env(&self.settings.log_env_var, log_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn()
            .map_err(|source| StageError::SpawnFailed {
                command: command_line.clone(),
                source,
            })?;

        let mut guard = ProcessGroupGuard::new(child.id());

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| StageError::SpawnFailed {
                command: command_line.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                guard.terminate();
                let _ = child.wait().await;
                let _ = writeln!(
                    log,
                    "=== Interrupted at {} ===",
                    Local::now().format("%Y-%m-%d %H:%M:%S")
                );
                return Err(StageError::Cancelled {
                    stage: script.path.display().to_string(),
                });
            }
        };
        guard.disarm();

        let exit_code = status.code().unwrap_or(-1);
        writeln!(
            log,
            "=== Completed at {} with exit code {} ===",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            exit_code
        )
        .map_err(log_error)?;

        debug!(command = %command_line, exit_code, "Local script finished");
        Ok(exit_code)
    }
}
