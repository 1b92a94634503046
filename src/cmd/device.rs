//! Per-device progress commands: `qarun status` and `qarun reset`.

use anyhow::{Result, bail};

use super::super::Cli;
use super::load_for_device;

pub async fn cmd_status(cli: &Cli, device: &str) -> Result<i32> {
    use qarun::backend::BackendClient;
    use qarun::orchestrator::RunJournal;
    use qarun::stage::StageName;

    let config = load_for_device(cli, device)?;

    println!();
    println!("QA Status: {}", device);
    println!("==========={}", "=".repeat(device.len()));
    println!();

    match &config.backend_url {
        Some(url) => {
            let client = BackendClient::new(url, config.backend_timeout())?;
            match client.fetch_progress(device).await {
                Ok(Some(stage)) => println!("Resume point: {} ({})", stage, stage.title()),
                Ok(None) => println!(
                    "Resume point: none recorded (a run starts at {})",
                    StageName::EARLIEST
                ),
                Err(e) => println!(
                    "Resume point: backend unavailable ({}); a run would start at {}",
                    e,
                    StageName::EARLIEST
                ),
            }
        }
        None => println!("Resume point: no backend configured"),
    }

    let journal_path = config.journal_file();
    let entries = RunJournal::last_run(&journal_path)?;
    println!();
    if entries.is_empty() {
        println!("No local run recorded in {}", journal_path.display());
    } else {
        println!("Last local run ({}):", entries[0].run_id);
        for entry in &entries {
            println!(
                "  {}  {:<8} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.stage,
                entry.status
            );
        }
    }
    println!();

    Ok(0)
}

pub async fn cmd_reset(cli: &Cli, device: &str, force: bool) -> Result<i32> {
    use dialoguer::Confirm;
    use qarun::backend::BackendClient;
    use qarun::orchestrator::RunJournal;
    use qarun::stage::StageName;

    let config = load_for_device(cli, device)?;
    let Some(url) = &config.backend_url else {
        bail!("No backend configured; set backend.base_url or QARUN_BACKEND_URL");
    };

    if !force {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "This will send {} back to the first stage. Are you sure?",
                device
            ))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(0);
        }
    }

    let client = BackendClient::new(url, config.backend_timeout())?;
    client.push_progress(device, StageName::EARLIEST).await?;
    RunJournal::reset(&config.journal_file())?;

    println!("Reset complete: {} resumes at {}", device, StageName::EARLIEST);
    Ok(0)
}
