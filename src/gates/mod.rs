use crate::stage::{Stage, StageAction};
use anyhow::Result;
use dialoguer::{Select, theme::ColorfulTheme};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    Approved,
    ApprovedAll, // User chose "yes to all"
    /// Stop the run before this stage. Progress stays where it is.
    Declined,
}

/// Asked before every stage starts.
pub trait StageGate: Send {
    fn check_stage(&mut self, stage: &Stage, total: usize) -> Result<GateDecision>;
}

/// Interactive confirmation, or blanket approval with `--yes`.
pub struct ApprovalGate {
    pub skip_all: bool,
}

impl ApprovalGate {
    pub fn new(skip_all: bool) -> Self {
        Self { skip_all }
    }

    fn prompt_user(&mut self, stage: &Stage, total: usize) -> Result<GateDecision> {
        let options = &[
            "Yes, run this stage",
            "Yes, and run the remaining stages without asking",
            "Stop here",
        ];

        let what = match &stage.action {
            StageAction::Script(spec) => {
                format!("{} on {}", spec.script.path.display(), spec.target)
            }
            StageAction::Parallel(members) => format!("{} concurrent tasks", members.len()),
        };

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Run stage {}/{} ({}: {}) now?",
                stage.ordinal + 1,
                total,
                stage.name.title(),
                what
            ))
            .items(options)
            .default(0)
            .interact()?;

        match selection {
            0 => Ok(GateDecision::Approved),
            1 => {
                self.skip_all = true;
                Ok(GateDecision::ApprovedAll)
            }
            _ => Ok(GateDecision::Declined),
        }
    }
}

impl StageGate for ApprovalGate {
    fn check_stage(&mut self, stage: &Stage, total: usize) -> Result<GateDecision> {
        // If --yes flag, auto-approve everything
        if self.skip_all {
            return Ok(GateDecision::Approved);
        }
        self.prompt_user(stage, total)
    }
}
