//! Best-effort cleanup after an interrupted run.
//!
//! Each configured command is run locally in order. Failures and timeouts
//! are logged and never stop the remaining commands.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq)]
pub enum TeardownStatus {
    Succeeded,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct TeardownReport {
    pub command: String,
    pub status: TeardownStatus,
}

pub struct Teardown {
    commands: Vec<Vec<String>>,
    timeout: Duration,
}

impl Teardown {
    pub fn new(commands: Vec<Vec<String>>) -> Self {
        Self {
            commands,
            timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.iter().all(|c| c.is_empty())
    }

    pub async fn run(&self) -> Vec<TeardownReport> {
        let mut reports = Vec::new();
        for argv in self.commands.iter().filter(|c| !c.is_empty()) {
            let command = argv.join(" ");
            let status = self.run_one(argv).await;
            match &status {
                TeardownStatus::Succeeded => info!(command = %command, "Teardown command finished"),
                TeardownStatus::Failed(reason) => {
                    warn!(command = %command, reason = %reason, "Teardown command failed")
                }
                TeardownStatus::TimedOut => {
                    warn!(command = %command, timeout_secs = self.timeout.as_secs(), "Teardown command timed out")
                }
            }
            reports.push(TeardownReport { command, status });
        }
        reports
    }

    async fn run_one(&self, argv: &[String]) -> TeardownStatus {
        let mut child = match Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return TeardownStatus::Failed(e.to_string()),
        };
        let stderr = child.stderr.take();

        match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => TeardownStatus::Succeeded,
            Ok(Ok(status)) => {
                let mut detail = format!("exit code {}", status.code().unwrap_or(-1));
                if let Some(mut stderr) = stderr {
                    use tokio::io::AsyncReadExt;
                    let mut buf = String::new();
                    if stderr.read_to_string(&mut buf).await.is_ok() && !buf.trim().is_empty() {
                        detail = format!("{}: {}", detail, buf.trim());
                    }
                }
                TeardownStatus::Failed(detail)
            }
            Ok(Err(e)) => TeardownStatus::Failed(e.to_string()),
            Err(_) => TeardownStatus::TimedOut,
        }
    }
}
