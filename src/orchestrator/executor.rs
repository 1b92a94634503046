//! Stage execution: picks the local or remote runner for a [`StageRunSpec`],
//! wraps it with artifact streaming or a completion upload, and folds the
//! outcome into an [`ExecutionResult`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::ArtifactUploader;
use crate::errors::{SessionError, StageError};
use crate::local::LocalRunner;
use crate::remote::{
    OutputSink, ReachabilitySettings, RemoteOutcome, RemoteSession, RemoteSettings, TeeSink,
    elevated_command, wait_until_reachable,
};
use crate::stage::{ExecutionTarget, StageName, StageRunSpec};
use crate::stream::ArtifactStreamer;
use crate::ui::RunUI;

/// Outcome of running one stage or one concurrent member.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub stage_name: String,
    pub succeeded: bool,
    /// `None` when the process never ran or the session dropped.
    pub exit_code: Option<i32>,
    pub captured_output_path: PathBuf,
    pub error: Option<String>,
    /// The run was interrupted while this stage was in flight.
    pub cancelled: bool,
    pub duration: Duration,
}

impl ExecutionResult {
    fn from_outcome(
        spec: &StageRunSpec,
        outcome: Result<i32, StageError>,
        duration: Duration,
    ) -> Self {
        let (succeeded, exit_code, error, cancelled) = match outcome {
            Ok(0) => (true, Some(0), None, false),
            Ok(code) => {
                let err = StageError::NonZeroExit {
                    stage: spec.name.clone(),
                    exit_code: code,
                };
                (false, Some(code), Some(err.to_string()), false)
            }
            Err(e) => {
                let cancelled = matches!(
                    e,
                    StageError::Cancelled { .. } | StageError::Session(SessionError::Cancelled { .. })
                );
                (false, None, Some(e.to_string()), cancelled)
            }
        };
        Self {
            stage_name: spec.name.clone(),
            succeeded,
            exit_code,
            captured_output_path: spec.log_artifact.clone(),
            error,
            cancelled,
            duration,
        }
    }
}

/// Runs one unit of work. The seam the orchestrator and the parallel
/// coordinator are tested through.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, spec: &StageRunSpec, cancel: &CancellationToken) -> ExecutionResult;
}

/// Run a remote command and, after a tolerated disconnect, wait for the host.
///
/// A host that does not come back in time is a hard failure.
#[allow(clippy::too_many_arguments)]
pub async fn run_remote_with_reboot(
    session: &RemoteSession,
    host: &str,
    command: &str,
    tolerate_disconnect: bool,
    sink: Box<dyn OutputSink>,
    reachability: &ReachabilitySettings,
    ui: &RunUI,
    cancel: &CancellationToken,
) -> Result<RemoteOutcome, StageError> {
    let outcome = session
        .run(host, command, tolerate_disconnect, sink, cancel)
        .await?;
    if !outcome.disconnected {
        return Ok(outcome);
    }

    ui.waiting_for_host(host);
    let back = wait_until_reachable(host, reachability, cancel, |n| ui.reachability_attempt(n)).await;
    ui.host_wait_finished(host, back);

    if cancel.is_cancelled() {
        return Err(SessionError::Cancelled {
            host: host.to_string(),
        }
        .into());
    }
    if !back {
        return Err(SessionError::ReachabilityTimeout {
            host: host.to_string(),
            timeout_secs: reachability.timeout.as_secs(),
        }
        .into());
    }
    Ok(outcome)
}

/// The production executor: real scripts, real uploads.
pub struct ScriptStageExecutor {
    device_id: String,
    host: String,
    local: LocalRunner,
    remote: RemoteSession,
    reachability: ReachabilitySettings,
    streamer: ArtifactStreamer,
    uploader: Arc<dyn ArtifactUploader>,
    ui: Arc<RunUI>,
}

impl ScriptStageExecutor {
    pub fn new(
        device_id: &str,
        host: &str,
        uploader: Arc<dyn ArtifactUploader>,
        stream_interval: Duration,
        ui: Arc<RunUI>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            host: host.to_string(),
            local: LocalRunner::default(),
            remote: RemoteSession::ssh(RemoteSettings::default()),
            reachability: ReachabilitySettings::default(),
            streamer: ArtifactStreamer::new(uploader.clone(), stream_interval).with_ui(ui.clone()),
            uploader,
            ui,
        }
    }

    pub fn with_local(mut self, local: LocalRunner) -> Self {
        self.local = local;
        self
    }

    pub fn with_remote(mut self, remote: RemoteSession, reachability: ReachabilitySettings) -> Self {
        self.remote = remote;
        self.reachability = reachability;
        self
    }

    async fn run_target(
        &self,
        spec: &StageRunSpec,
        cancel: &CancellationToken,
    ) -> Result<i32, StageError> {
        match spec.target {
            ExecutionTarget::Local => {
                self.local
                    .run(&spec.script, &spec.log_artifact, cancel)
                    .await
            }
            ExecutionTarget::Remote => {
                // Concurrent members write only to their own logs.
                let echo = spec.stage != StageName::Final;
                let sink = TeeSink::new(echo, Some(&spec.log_artifact)).map_err(|source| {
                    StageError::LogFile {
                        path: spec.log_artifact.clone(),
                        source,
                    }
                })?;
                let command = elevated_command(&spec.script);
                let outcome = run_remote_with_reboot(
                    &self.remote,
                    &self.host,
                    &command,
                    spec.tolerate_disconnect,
                    Box::new(sink),
                    &self.reachability,
                    &self.ui,
                    cancel,
                )
                .await?;
                // A tolerated reboot counts as a clean exit.
                Ok(if outcome.disconnected {
                    0
                } else {
                    outcome.exit_code.unwrap_or(-1)
                })
            }
        }
    }
}

#[async_trait]
impl StageExecutor for ScriptStageExecutor {
    async fn execute(&self, spec: &StageRunSpec, cancel: &CancellationToken) -> ExecutionResult {
        let start = Instant::now();
        let artifacts = spec.artifacts();

        let stream = spec
            .stream_key
            .as_ref()
            .map(|_| self.streamer.start(&self.device_id, spec.stage, artifacts.clone()));

        let outcome = self.run_target(spec, cancel).await;

        match stream {
            Some(handle) => {
                let report = handle.stop().await;
                self.ui.upload_result(&spec.name, report.final_upload_ok);
            }
            None => {
                let ok = self
                    .uploader
                    .upload_artifacts(&self.device_id, spec.stage, &artifacts)
                    .await;
                self.ui.upload_result(&spec.name, ok);
            }
        }

        let result = ExecutionResult::from_outcome(spec, outcome, start.elapsed());
        if result.succeeded {
            info!(stage = %spec.name, target = %spec.target, "Stage succeeded");
        } else {
            warn!(
                stage = %spec.name,
                target = %spec.target,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Stage failed"
            );
        }
        result
    }
}
