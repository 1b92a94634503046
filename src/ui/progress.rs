use crate::parallel::ParallelSummary;
use crate::stage::{ExecutionTarget, StageName};
use crate::ui::icons::{CHECK, CLOCK, CROSS, HOST, PARALLEL, RUNNING, SPARKLE, STOP, UPLOAD, WARN};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Console reporting for a qarun run.
///
/// Stage transitions are printed as plain lines. Spinners are only used for
/// quiet waits: a rebooting host and the concurrent final stage, whose
/// members log to files instead of the console.
pub struct RunUI {
    multi: MultiProgress,
    verbose: bool,
    host_spinner: Mutex<Option<ProgressBar>>,
    task_spinners: Mutex<HashMap<String, ProgressBar>>,
}

impl RunUI {
    pub fn new(verbose: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            verbose,
            host_spinner: Mutex::new(None),
            task_spinners: Mutex::new(HashMap::new()),
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` when
    /// there is no terminal to draw on.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.is_hidden() || self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn spinner(&self, prefix: &str, msg: String) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new_spinner());
        if let Ok(bar_style) =
            ProgressStyle::default_spinner().template("{prefix:.bold.dim} {spinner} {msg}")
        {
            bar.set_style(bar_style);
        }
        bar.set_prefix(prefix.to_string());
        bar.set_message(msg);
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    }

    pub fn start_run(&self, device_id: &str, resume: StageName, stage_count: usize) {
        self.print_line(format!(
            "{} QA run for {} - resuming at {} ({} stages in table)",
            SPARKLE,
            style(device_id).cyan().bold(),
            style(resume).yellow(),
            stage_count
        ));
    }

    pub fn stage_started(
        &self,
        ordinal: usize,
        total: usize,
        stage: StageName,
        target: Option<ExecutionTarget>,
    ) {
        let target = target.map(|t| format!(" [{}]", t)).unwrap_or_default();
        self.print_line(format!(
            "{} Stage {}/{}: {}{}",
            RUNNING,
            ordinal + 1,
            total,
            style(stage.title()).bold(),
            style(target).dim()
        ));
    }

    pub fn stage_passed(&self, stage: StageName, elapsed: Duration) {
        self.print_line(format!(
            "{} {} passed {}",
            CHECK,
            style(stage.title()).green(),
            style(format_elapsed(elapsed)).dim()
        ));
    }

    pub fn stage_failed(&self, stage: StageName, reason: &str) {
        self.print_line(format!(
            "{} {} failed: {}",
            CROSS,
            style(stage.title()).red().bold(),
            reason
        ));
    }

    pub fn stage_declined(&self, stage: StageName) {
        self.print_line(format!(
            "{} Stopped before {}; progress left at this stage",
            STOP,
            style(stage.title()).yellow()
        ));
    }

    pub fn progress_reported(&self, stage: StageName, ok: bool) {
        if ok {
            if self.verbose {
                self.print_line(format!(
                    "    {} progress -> {}",
                    style("→").dim(),
                    style(stage).dim()
                ));
            }
        } else {
            self.print_line(format!(
                "    {} Could not record progress '{}' with the backend",
                WARN, stage
            ));
        }
    }

    pub fn upload_result(&self, name: &str, ok: bool) {
        if ok {
            if self.verbose {
                self.print_line(format!("    {} uploaded {} artifacts", UPLOAD, name));
            }
        } else {
            self.print_line(format!(
                "    {} {}",
                WARN,
                style(format!("Artifact upload for {} did not go through", name)).yellow()
            ));
        }
    }

    pub fn waiting_for_host(&self, host: &str) {
        self.print_line(format!(
            "{} {} dropped the session; waiting for it to come back",
            HOST,
            style(host).cyan()
        ));
        let bar = self.spinner("  Host", format!("probing {}", host));
        if let Ok(mut slot) = self.host_spinner.lock() {
            *slot = Some(bar);
        }
    }

    pub fn reachability_attempt(&self, attempt: u32) {
        if let Ok(slot) = self.host_spinner.lock()
            && let Some(bar) = slot.as_ref()
        {
            let dots = ".".repeat((attempt as usize).min(30));
            bar.set_message(format!("attempt {}{}", attempt, dots));
        }
    }

    pub fn host_wait_finished(&self, host: &str, back: bool) {
        let bar = self.host_spinner.lock().ok().and_then(|mut slot| slot.take());
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        if back {
            self.print_line(format!("{} {} is back online", CHECK, style(host).cyan()));
        } else {
            self.print_line(format!("{} {} did not come back", CROSS, style(host).red()));
        }
    }

    pub fn parallel_started(&self, names: &[String]) {
        self.print_line(format!(
            "{} Launching {} concurrent tasks: {}",
            PARALLEL,
            names.len(),
            style(names.join(", ")).dim()
        ));
        if let Ok(mut spinners) = self.task_spinners.lock() {
            for name in names {
                let bar = self.spinner(&format!("  [{}]", name), "running".to_string());
                spinners.insert(name.clone(), bar);
            }
        }
    }

    pub fn parallel_task_finished(&self, name: &str, ok: bool, elapsed: Duration) {
        let bar = self
            .task_spinners
            .lock()
            .ok()
            .and_then(|mut spinners| spinners.remove(name));
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        let icon = if ok { &CHECK } else { &CROSS };
        self.print_line(format!(
            "  {} {} {}",
            icon,
            name,
            style(format_elapsed(elapsed)).dim()
        ));
    }

    pub fn parallel_summary(&self, summary: &ParallelSummary) {
        if let Ok(mut spinners) = self.task_spinners.lock() {
            for (_, bar) in spinners.drain() {
                bar.finish_and_clear();
            }
        }
        for (name, ok) in &summary.results {
            let status = if *ok {
                style("passed").green()
            } else {
                style("failed").red()
            };
            self.print_line(format!("    {}: {}", name, status));
        }
    }

    pub fn run_completed(&self, elapsed: Duration) {
        self.print_line(format!(
            "{} All stages passed {} {}",
            SPARKLE,
            CLOCK,
            format_elapsed(elapsed)
        ));
    }

    pub fn run_interrupted(&self, stage: StageName) {
        self.print_line(format!(
            "{} Interrupted during {}; it will be re-run next time",
            STOP,
            style(stage.title()).yellow()
        ));
    }
}

/// `Xs` below a minute, `Xm Ys` up to an hour, `Xh Ym` beyond.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(42)), "42s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_elapsed(Duration::from_secs(7260)), "2h 1m");
    }

    #[test]
    fn test_host_spinner_lifecycle() {
        let ui = RunUI::new(true);
        ui.waiting_for_host("truffle-0001.local");
        ui.reachability_attempt(3);
        assert!(ui.host_spinner.lock().unwrap().is_some());
        ui.host_wait_finished("truffle-0001.local", true);
        assert!(ui.host_spinner.lock().unwrap().is_none());
    }

    #[test]
    fn test_parallel_spinners_cleared_by_summary() {
        let ui = RunUI::new(false);
        ui.parallel_started(&["led-soak".to_string(), "nvme-soak".to_string()]);
        ui.parallel_task_finished("led-soak", true, Duration::from_secs(1));
        assert_eq!(ui.task_spinners.lock().unwrap().len(), 1);

        let mut summary = ParallelSummary::default();
        summary.results.insert("led-soak".to_string(), true);
        summary.results.insert("nvme-soak".to_string(), false);
        ui.parallel_summary(&summary);
        assert!(ui.task_spinners.lock().unwrap().is_empty());
    }
}
