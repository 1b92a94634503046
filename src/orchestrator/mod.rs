//! The resumable stage state machine.
//!
//! A run reads the device's resume point from the backend, walks the stage
//! table from there and reports progress around every stage. The final
//! stage fans out through the [`ParallelCoordinator`].

pub mod executor;
pub mod journal;
pub mod teardown;

pub use executor::{ExecutionResult, ScriptStageExecutor, StageExecutor};
pub use journal::RunJournal;
pub use teardown::Teardown;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::ProgressStore;
use crate::gates::{ApprovalGate, GateDecision, StageGate};
use crate::parallel::ParallelCoordinator;
use crate::stage::{Stage, StageAction, StageName, StageRunSpec, StageTable};
use crate::ui::RunUI;
use journal::status;

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed {
        stage: StageName,
        /// Concurrent members that failed; empty for sequential stages.
        failed_tasks: Vec<String>,
    },
    Interrupted {
        stage: StageName,
    },
    /// The operator stopped before `stage` ran.
    Declined {
        stage: StageName,
    },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed | RunOutcome::Declined { .. } => 0,
            RunOutcome::Failed { .. } => 1,
            RunOutcome::Interrupted { .. } => 130,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

pub struct Orchestrator {
    table: StageTable,
    device_id: String,
    progress: Arc<dyn ProgressStore>,
    executor: Arc<dyn StageExecutor>,
    coordinator: ParallelCoordinator,
    journal: Option<RunJournal>,
    ui: Arc<RunUI>,
    gate: Box<dyn StageGate>,
    teardown: Teardown,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        table: StageTable,
        device_id: &str,
        progress: Arc<dyn ProgressStore>,
        executor: Arc<dyn StageExecutor>,
        ui: Arc<RunUI>,
    ) -> Self {
        Self {
            table,
            device_id: device_id.to_string(),
            progress,
            executor,
            coordinator: ParallelCoordinator::default(),
            journal: None,
            ui,
            gate: Box::new(ApprovalGate::new(true)),
            teardown: Teardown::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_coordinator(mut self, coordinator: ParallelCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_journal(mut self, journal: RunJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_gate(mut self, gate: Box<dyn StageGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_teardown(mut self, teardown: Teardown) -> Self {
        self.teardown = teardown;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the table from the resume point to the end or the first failure.
    ///
    /// `resume_override` replaces the backend lookup (`run --from`).
    pub async fn run(&mut self, resume_override: Option<StageName>) -> Result<RunOutcome> {
        let started = Instant::now();
        let resume = match resume_override {
            Some(stage) => {
                info!(device = %self.device_id, stage = %stage, "Resume point overridden");
                stage
            }
            None => self.progress.get_progress(&self.device_id).await,
        };
        if self.table.stage_by_name(resume).is_none() {
            warn!(stage = %resume, "Resume point is not in the stage table; continuing with the next configured stage");
        }

        self.ui.start_run(&self.device_id, resume, self.table.len());
        info!(device = %self.device_id, resume = %resume, "Starting QA run");

        let total = self.table.len();
        let stages: Vec<Stage> = self.table.stages_from(resume).to_vec();

        let mut ask = true;
        for stage in &stages {
            if self.cancel.is_cancelled() {
                return Ok(self.interrupted(stage.name).await);
            }

            if ask {
                match self.gate.check_stage(stage, total)? {
                    GateDecision::Approved => {}
                    GateDecision::ApprovedAll => ask = false,
                    GateDecision::Declined => {
                        self.ui.stage_declined(stage.name);
                        self.journal(stage.name, status::DECLINED);
                        return Ok(RunOutcome::Declined { stage: stage.name });
                    }
                }
            }

            let outcome = match &stage.action {
                StageAction::Script(spec) => self.run_sequential(stage, spec, total).await,
                StageAction::Parallel(members) => self.run_parallel(stage, members, total).await,
            };
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }

        self.ui.run_completed(started.elapsed());
        info!(device = %self.device_id, "QA run completed");
        Ok(RunOutcome::Completed)
    }

    /// `None` means continue with the next stage.
    ///
    /// After a pass the cursor moves to the next stage. When this is the last
    /// stage in the table (e.g. `final` skipped in `qa.toml`) nothing follows,
    /// so the cursor stays on this stage and no completion marker is written.
    async fn run_sequential(
        &self,
        stage: &Stage,
        spec: &StageRunSpec,
        total: usize,
    ) -> Option<RunOutcome> {
        self.report_progress(stage.name).await;
        self.ui
            .stage_started(stage.ordinal, total, stage.name, Some(spec.target));
        self.journal(stage.name, status::STARTED);

        let result = self.executor.execute(spec, &self.cancel).await;

        if result.cancelled || self.cancel.is_cancelled() {
            return Some(self.interrupted(stage.name).await);
        }

        if !result.succeeded {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "stage reported failure".to_string());
            error!(stage = %stage.name, reason = %reason, "Stage failed; aborting run");
            self.ui.stage_failed(stage.name, &reason);
            self.journal(stage.name, status::FAILED);
            return Some(RunOutcome::Failed {
                stage: stage.name,
                failed_tasks: Vec::new(),
            });
        }

        self.ui.stage_passed(stage.name, result.duration);
        self.journal(stage.name, status::PASSED);
        if let Some(next) = self.table.next(stage) {
            self.report_progress(next.name).await;
        }
        None
    }

    async fn run_parallel(
        &self,
        stage: &Stage,
        members: &[StageRunSpec],
        total: usize,
    ) -> Option<RunOutcome> {
        self.report_progress(stage.name).await;
        self.ui.stage_started(stage.ordinal, total, stage.name, None);
        self.journal(stage.name, status::STARTED);

        let names: Vec<String> = members.iter().map(|m| m.name.clone()).collect();
        self.ui.parallel_started(&names);

        let ui = self.ui.clone();
        let summary = self
            .coordinator
            .run_many(members, self.executor.clone(), &self.cancel, |result| {
                ui.parallel_task_finished(&result.stage_name, result.succeeded, result.duration)
            })
            .await;
        self.ui.parallel_summary(&summary);

        if summary.was_cancelled() || self.cancel.is_cancelled() {
            return Some(self.interrupted(stage.name).await);
        }

        // Terminal marker, written whatever the members did.
        self.report_progress(stage.name).await;

        if summary.success() {
            self.ui.stage_passed(stage.name, summary_duration(&summary));
            self.journal(stage.name, status::PASSED);
            return None;
        }

        let failed_tasks = summary.failed_tasks();
        let reason = format!("failed tasks: {}", failed_tasks.join(", "));
        error!(stage = %stage.name, failed = ?failed_tasks, "Concurrent stage failed");
        self.ui.stage_failed(stage.name, &reason);
        self.journal(stage.name, status::FAILED);
        Some(RunOutcome::Failed {
            stage: stage.name,
            failed_tasks,
        })
    }

    async fn report_progress(&self, stage: StageName) {
        let ok = self.progress.set_progress(&self.device_id, stage).await;
        self.ui.progress_reported(stage, ok);
    }

    async fn interrupted(&self, stage: StageName) -> RunOutcome {
        warn!(stage = %stage, "Run interrupted; running teardown");
        self.journal(stage, status::INTERRUPTED);
        self.teardown.run().await;
        self.ui.run_interrupted(stage);
        RunOutcome::Interrupted { stage }
    }

    fn journal(&self, stage: StageName, status: &str) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.record_stage(stage, status)
        {
            warn!(error = %e, "Could not write run journal");
        }
    }
}

fn summary_duration(summary: &crate::parallel::ParallelSummary) -> std::time::Duration {
    summary
        .details
        .iter()
        .map(|r| r.duration)
        .max()
        .unwrap_or_default()
}
