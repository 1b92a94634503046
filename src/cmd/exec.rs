//! One-off remote command: `qarun exec`.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::super::Cli;
use super::{load_for_device, report_config_warnings, start_logging};

pub async fn cmd_exec(
    cli: &Cli,
    device: &str,
    tolerate_disconnect: bool,
    command: &[String],
) -> Result<i32> {
    use qarun::orchestrator::executor::run_remote_with_reboot;
    use qarun::remote::{RemoteSession, TeeSink};
    use qarun::ui::RunUI;

    let config = load_for_device(cli, device)?;
    let _log_guard = start_logging(&config);
    report_config_warnings(&config);

    let host = config.hostname(device);
    let session = RemoteSession::ssh(config.remote_settings());
    let ui = Arc::new(RunUI::new(cli.verbose));

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let command_line = command.join(" ");
    tracing::info!(host = %host, command = %command_line, "Running remote command");

    let outcome = run_remote_with_reboot(
        &session,
        &host,
        &command_line,
        tolerate_disconnect,
        Box::new(TeeSink::new(true, None)?),
        &config.reachability_settings(),
        &ui,
        &cancel,
    )
    .await?;

    if outcome.disconnected {
        println!("\nSession dropped as expected; {} is reachable again", host);
        return Ok(0);
    }
    Ok(outcome.exit_code.unwrap_or(1))
}
