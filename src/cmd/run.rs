//! Resumable stage orchestration: `qarun run`.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::super::Cli;
use super::{backend_for, load_for_device, report_config_warnings, start_logging};

pub async fn cmd_run(cli: &Cli, device: &str, from: Option<&str>) -> Result<i32> {
    use qarun::gates::ApprovalGate;
    use qarun::local::LocalRunner;
    use qarun::orchestrator::{
        Orchestrator, RunJournal, RunOutcome, ScriptStageExecutor, Teardown,
    };
    use qarun::parallel::ParallelCoordinator;
    use qarun::remote::RemoteSession;
    use qarun::stage::{ExecutionTarget, StageName};
    use qarun::ui::RunUI;

    let config = load_for_device(cli, device)?;
    let resume_override = from.map(str::parse::<StageName>).transpose()?;

    config.ensure_directories()?;
    let _log_guard = start_logging(&config);
    report_config_warnings(&config);

    let table = config.validated_stage_table()?;
    let needs_secret = table
        .run_specs()
        .iter()
        .any(|s| s.target == ExecutionTarget::Remote);
    if needs_secret && config.sudo_password.is_none() {
        tracing::warn!("Remote stages configured but QARUN_SUDO_PASSWORD is not set");
    }

    let (progress, uploader) = backend_for(&config)?;
    let ui = Arc::new(RunUI::new(cli.verbose));
    let host = config.hostname(device);

    let executor = ScriptStageExecutor::new(
        device,
        &host,
        uploader,
        config.stream_interval(),
        ui.clone(),
    )
    .with_local(LocalRunner::new(config.local_settings()))
    .with_remote(
        RemoteSession::ssh(config.remote_settings()),
        config.reachability_settings(),
    );

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping the run");
            signal_token.cancel();
        }
    });

    let mut orchestrator = Orchestrator::new(table, device, progress, Arc::new(executor), ui)
        .with_coordinator(ParallelCoordinator::new(config.stagger()))
        .with_gate(Box::new(ApprovalGate::new(cli.yes)))
        .with_journal(RunJournal::new(config.journal_file()))
        .with_teardown(Teardown::new(config.teardown_commands().to_vec()))
        .with_cancel(cancel);

    let outcome = orchestrator.run(resume_override).await?;

    match &outcome {
        RunOutcome::Completed => println!("\nAll stages passed for {}", device),
        RunOutcome::Failed {
            stage,
            failed_tasks,
        } if !failed_tasks.is_empty() => {
            println!("\nStage {} failed: {}", stage, failed_tasks.join(", "));
        }
        RunOutcome::Failed { stage, .. } => {
            println!("\nStage {} failed; fix the device and run again to retry it", stage)
        }
        RunOutcome::Interrupted { stage } => {
            println!("\nInterrupted during {}; the next run starts there", stage)
        }
        RunOutcome::Declined { stage } => println!("\nStopped before {}", stage),
    }

    Ok(outcome.exit_code())
}
