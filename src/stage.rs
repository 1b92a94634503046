//! Stage definitions and the ordered stage table.
//!
//! This module provides:
//! - `StageName`, the fixed wire vocabulary shared with the backend
//! - `StageRunSpec`, everything a runner needs to execute one script
//! - `Stage` / `StageAction`, a typed entry in the table
//! - `StageTable`, the static ordered catalogue consulted by the orchestrator
//! - Built-in defaults for every stage, used when `qa.toml` does not override them

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;

/// Name of a validation stage.
///
/// The lowercase string form is stored by the backend as the resume cursor.
/// Renaming a variant's wire form invalidates progress already stored for
/// every device, so the strings below are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Setup,
    Led,
    Nvme,
    Hotspot,
    Gpu,
    Final,
}

impl StageName {
    /// All stages in canonical order.
    pub const ALL: [StageName; 6] = [
        StageName::Setup,
        StageName::Led,
        StageName::Nvme,
        StageName::Hotspot,
        StageName::Gpu,
        StageName::Final,
    ];

    /// The earliest stage; resumption falls back to it whenever progress is unknown.
    pub const EARLIEST: StageName = StageName::Setup;

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Setup => "setup",
            StageName::Led => "led",
            StageName::Nvme => "nvme",
            StageName::Hotspot => "hotspot",
            StageName::Gpu => "gpu",
            StageName::Final => "final",
        }
    }

    /// Human-readable title for console output.
    pub fn title(&self) -> &'static str {
        match self {
            StageName::Setup => "System Setup",
            StageName::Led => "LED Test",
            StageName::Nvme => "NVME Test",
            StageName::Hotspot => "Thermal Hotspot Test",
            StageName::Gpu => "GPU Burn Test",
            StageName::Final => "Final Concurrent Soak",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        StageName::ALL
            .into_iter()
            .find(|name| name.as_str() == wanted)
            .ok_or_else(|| ConfigError::UnknownStage(s.to_string()))
    }
}

/// Interpreter used to launch a stage script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptRuntime {
    #[default]
    Shell,
    Python,
}

impl ScriptRuntime {
    pub fn interpreter(&self) -> &'static str {
        match self {
            ScriptRuntime::Shell => "bash",
            ScriptRuntime::Python => "python3",
        }
    }
}

/// Where a stage script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    /// On the machine running the orchestrator, as a privileged subprocess.
    #[default]
    Local,
    /// On the DUT, over a login session.
    Remote,
}

impl std::fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionTarget::Local => write!(f, "local"),
            ExecutionTarget::Remote => write!(f, "remote"),
        }
    }
}

/// An external script: path, interpreter and fixed arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub runtime: ScriptRuntime,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ScriptSpec {
    pub fn new(path: impl Into<PathBuf>, runtime: ScriptRuntime, args: Vec<String>) -> Self {
        Self {
            path: path.into(),
            runtime,
            args,
        }
    }

    /// Interpreter, script path and arguments as one argv.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            self.runtime.interpreter().to_string(),
            self.path.display().to_string(),
        ];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// A second artifact uploaded next to the stage log (e.g. a telemetry CSV).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraArtifact {
    pub path: PathBuf,
    /// Upload form field the file is sent under.
    pub field: String,
}

/// One executable unit: a script plus where it runs and where its artifacts go.
///
/// Sequential stages carry exactly one of these; the final stage carries one
/// per concurrent member.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRunSpec {
    /// Unique task name. Equal to the stage name for sequential stages.
    pub name: String,
    /// Stage this unit reports under when uploading artifacts.
    pub stage: StageName,
    pub script: ScriptSpec,
    pub target: ExecutionTarget,
    /// Absolute path of the captured combined output.
    pub log_artifact: PathBuf,
    /// Upload field for periodic streaming; `None` uploads once at completion.
    pub stream_key: Option<String>,
    /// Upload field for the one-shot completion upload.
    pub result_key: String,
    pub extra_artifact: Option<ExtraArtifact>,
    /// Treat a dropped remote session as an expected reboot.
    pub tolerate_disconnect: bool,
}

impl StageRunSpec {
    pub fn new(stage: StageName, script: ScriptSpec, log_artifact: impl Into<PathBuf>) -> Self {
        Self {
            name: stage.to_string(),
            stage,
            script,
            target: ExecutionTarget::Local,
            log_artifact: log_artifact.into(),
            stream_key: None,
            result_key: default_result_key(stage.as_str()),
            extra_artifact: None,
            tolerate_disconnect: false,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_target(mut self, target: ExecutionTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_stream_key(mut self, key: &str) -> Self {
        self.stream_key = Some(key.to_string());
        self
    }

    pub fn with_result_key(mut self, key: &str) -> Self {
        self.result_key = key.to_string();
        self
    }

    pub fn with_extra_artifact(mut self, path: impl Into<PathBuf>, field: &str) -> Self {
        self.extra_artifact = Some(ExtraArtifact {
            path: path.into(),
            field: field.to_string(),
        });
        self
    }

    pub fn tolerating_disconnect(mut self, tolerate: bool) -> Self {
        self.tolerate_disconnect = tolerate;
        self
    }

    /// Upload field and path pairs for this unit's artifacts.
    ///
    /// The log goes under the stream key when streaming, otherwise under the
    /// result key.
    pub fn artifacts(&self) -> Vec<(String, PathBuf)> {
        let field = self
            .stream_key
            .clone()
            .unwrap_or_else(|| self.result_key.clone());
        let mut files = vec![(field, self.log_artifact.clone())];
        if let Some(extra) = &self.extra_artifact {
            files.push((extra.field.clone(), extra.path.clone()));
        }
        files
    }

    /// Fail early on a local script that does not exist.
    ///
    /// Remote scripts live on the DUT and cannot be checked from here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target == ExecutionTarget::Local && !self.script.path.exists() {
            return Err(ConfigError::ScriptMissing {
                stage: self.name.clone(),
                path: self.script.path.clone(),
            });
        }
        Ok(())
    }
}

/// What a stage does when the orchestrator reaches it.
#[derive(Debug, Clone, PartialEq)]
pub enum StageAction {
    /// Run one script and wait for it.
    Script(StageRunSpec),
    /// Run several scripts concurrently; only valid for the last stage.
    Parallel(Vec<StageRunSpec>),
}

/// One entry of the stage table.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// 0-based position; defines the total order.
    pub ordinal: usize,
    pub name: StageName,
    pub action: StageAction,
}

impl Stage {
    pub fn is_parallel(&self) -> bool {
        matches!(self.action, StageAction::Parallel(_))
    }
}

/// Static ordered catalogue of stages.
///
/// Built once at startup and never mutated during a run.
#[derive(Debug, Clone)]
pub struct StageTable {
    stages: Vec<Stage>,
}

impl StageTable {
    /// Build a table from `(name, action)` pairs in execution order.
    ///
    /// Names must be unique and follow canonical order, and only the last
    /// entry may be a parallel stage.
    pub fn new(entries: Vec<(StageName, StageAction)>) -> Result<Self, ConfigError> {
        let last = entries.len().saturating_sub(1);
        let mut stages = Vec::with_capacity(entries.len());
        for (ordinal, (name, action)) in entries.into_iter().enumerate() {
            if let Some(prev) = stages.last().map(|s: &Stage| s.name)
                && prev >= name
            {
                return Err(ConfigError::InvalidValue {
                    key: format!("stages.{}", name),
                    message: format!("must come after {} and appear once", prev),
                });
            }
            if matches!(action, StageAction::Parallel(_)) && ordinal != last {
                return Err(ConfigError::InvalidValue {
                    key: format!("stages.{}", name),
                    message: "a concurrent stage must be the last stage".to_string(),
                });
            }
            stages.push(Stage {
                ordinal,
                name,
                action,
            });
        }
        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    pub fn stage_by_ordinal(&self, ordinal: usize) -> Option<&Stage> {
        self.stages.get(ordinal)
    }

    pub fn stage_by_name(&self, name: StageName) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The stage after `stage`, or `None` for the last one.
    pub fn next(&self, stage: &Stage) -> Option<&Stage> {
        self.stages.get(stage.ordinal + 1)
    }

    /// Stages starting at `name`.
    ///
    /// A name missing from the table (a skipped stage) resumes at the first
    /// later stage; nothing before it runs again. Empty when no stage follows.
    pub fn stages_from(&self, name: StageName) -> &[Stage] {
        let start = self
            .stages
            .iter()
            .position(|s| s.name >= name)
            .unwrap_or(self.stages.len());
        &self.stages[start..]
    }

    /// Every executable unit in the table, flattened.
    pub fn run_specs(&self) -> Vec<&StageRunSpec> {
        self.stages
            .iter()
            .flat_map(|s| match &s.action {
                StageAction::Script(spec) => vec![spec],
                StageAction::Parallel(members) => members.iter().collect(),
            })
            .collect()
    }

    /// Check every local script exists before a multi-hour run starts.
    pub fn validate_scripts(&self) -> Result<(), ConfigError> {
        for spec in self.run_specs() {
            spec.validate()?;
        }
        Ok(())
    }
}

/// Default upload field for a stage's completion upload, e.g. `nvmeTestFile`.
pub fn default_result_key(name: &str) -> String {
    format!("{}TestFile", name.replace(['-', '_'], ""))
}

/// Built-in settings for one stage before `qa.toml` overrides are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDefaults {
    pub script: &'static str,
    pub runtime: ScriptRuntime,
    pub args: &'static [&'static str],
    pub log: &'static str,
    pub stream_key: Option<&'static str>,
    pub extra: Option<(&'static str, &'static str)>,
    pub tolerate_disconnect: bool,
}

/// Built-in settings for each sequential stage.
///
/// Returns `None` for `final`, whose members are configured separately.
pub fn stage_defaults(name: StageName) -> Option<StageDefaults> {
    let defaults = match name {
        StageName::Setup => StageDefaults {
            script: "stage0.sh",
            runtime: ScriptRuntime::Shell,
            args: &[],
            log: "stage0_logs.txt",
            stream_key: None,
            extra: None,
            // Setup may reboot the DUT.
            tolerate_disconnect: true,
        },
        StageName::Led => StageDefaults {
            script: "led_test.sh",
            runtime: ScriptRuntime::Shell,
            args: &[],
            log: "led_test.txt",
            stream_key: Some("ledTestFile"),
            extra: None,
            tolerate_disconnect: false,
        },
        StageName::Nvme => StageDefaults {
            script: "nvme_test.sh",
            runtime: ScriptRuntime::Shell,
            args: &[],
            log: "nvme_test.txt",
            stream_key: None,
            extra: None,
            tolerate_disconnect: false,
        },
        StageName::Hotspot => StageDefaults {
            script: "hotspot_test.sh",
            runtime: ScriptRuntime::Shell,
            args: &[],
            log: "hotspot_test.txt",
            stream_key: None,
            extra: None,
            tolerate_disconnect: false,
        },
        StageName::Gpu => StageDefaults {
            script: "burn_test.py",
            runtime: ScriptRuntime::Python,
            args: &["--stage-one", "2", "--stage-two", "2"],
            log: "burn_test.txt",
            stream_key: Some("gpuTestFile"),
            extra: Some(("burn_test.csv", "gpuTestGraph")),
            tolerate_disconnect: false,
        },
        StageName::Final => return None,
    };
    Some(defaults)
}

impl StageDefaults {
    /// Materialize a run spec with scripts under `scripts_root` and logs under `log_root`.
    pub fn to_run_spec(&self, name: StageName, scripts_root: &Path, log_root: &Path) -> StageRunSpec {
        let script = ScriptSpec::new(
            scripts_root.join(self.script),
            self.runtime,
            self.args.iter().map(|a| a.to_string()).collect(),
        );
        let mut spec = StageRunSpec::new(name, script, log_root.join(self.log))
            .tolerating_disconnect(self.tolerate_disconnect);
        if let Some(key) = self.stream_key {
            spec = spec.with_stream_key(key);
        }
        if let Some((file, field)) = self.extra {
            spec = spec.with_extra_artifact(log_root.join(file), field);
        }
        spec
    }
}
