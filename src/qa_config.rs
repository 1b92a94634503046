//! `qa.toml` configuration file.
//!
//! Layered like the rest of the tool: built-in defaults, then this file, then
//! environment variables, then CLI flags (see [`crate::config::Config`]).
//!
//! # Configuration File Format
//!
//! ```toml
//! [device]
//! id_pattern = '^truffle-\d{4}$'
//! log_root = "/home/truffle/qa_logs"
//! scripts_root = "/home/truffle/qa/scripts"
//!
//! [backend]
//! base_url = "http://qa-backend.local:8000/truffle"
//! timeout_secs = 10
//!
//! [remote]
//! username = "truffle"
//! host_suffix = ".local"
//!
//! [local]
//! elevate = ["sudo"]
//!
//! [stream]
//! interval_secs = 10
//!
//! [parallel]
//! stagger_secs = 2
//!
//! [[parallel.members]]
//! name = "led-soak"
//! script = "led_test.sh"
//! args = ["--soak"]
//! log = "final_led.txt"
//!
//! [stages.setup]
//! target = "remote"
//! tolerate_disconnect = true
//!
//! [teardown]
//! commands = [["sudo", "/home/truffle/QA/led_test/ledoff"]]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::stage::{ExecutionTarget, ScriptRuntime, StageName};

/// Hard ceiling on any backend request.
pub const MAX_BACKEND_TIMEOUT_SECS: u64 = 30;

/// Device identity and on-disk locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection {
    /// Regex every device id must match.
    #[serde(default = "default_id_pattern")]
    pub id_pattern: String,
    /// Directory holding one log file per stage.
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,
    /// Directory stage scripts are resolved against.
    #[serde(default = "default_scripts_root")]
    pub scripts_root: PathBuf,
}

fn default_id_pattern() -> String {
    r"^truffle-\d{4}$".to_string()
}

fn default_log_root() -> PathBuf {
    PathBuf::from("/home/truffle/qa_logs")
}

fn default_scripts_root() -> PathBuf {
    PathBuf::from("/home/truffle/qa/scripts")
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            id_pattern: default_id_pattern(),
            log_root: default_log_root(),
            scripts_root: default_scripts_root(),
        }
    }
}

/// Backend state service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    /// Base URL; progress lives at `{base_url}/{device_id}`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-request timeout, clamped to [`MAX_BACKEND_TIMEOUT_SECS`].
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

fn default_backend_timeout() -> u64 {
    10
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_backend_timeout(),
        }
    }
}

/// Remote login sessions and reboot handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    #[serde(default = "default_username")]
    pub username: String,
    /// Appended to the device id to form the hostname.
    #[serde(default = "default_host_suffix")]
    pub host_suffix: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout_secs: u64,
    #[serde(default = "default_reachability_interval")]
    pub reachability_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_username() -> String {
    "truffle".to_string()
}

fn default_host_suffix() -> String {
    ".local".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_reachability_timeout() -> u64 {
    300
}

fn default_reachability_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            username: default_username(),
            host_suffix: default_host_suffix(),
            port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            reachability_timeout_secs: default_reachability_timeout(),
            reachability_interval_secs: default_reachability_interval(),
            probe_timeout_secs: default_probe_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Local subprocess execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSection {
    /// Privilege-elevation prefix; empty runs scripts as the current user.
    #[serde(default = "default_elevate")]
    pub elevate: Vec<String>,
    /// Environment variable carrying the destination log path.
    #[serde(default = "default_log_env_var")]
    pub log_env_var: String,
}

fn default_elevate() -> Vec<String> {
    vec!["sudo".to_string()]
}

fn default_log_env_var() -> String {
    "LOG_FILE".to_string()
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            elevate: default_elevate(),
            log_env_var: default_log_env_var(),
        }
    }
}

/// Periodic artifact streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    #[serde(default = "default_stream_interval")]
    pub interval_secs: u64,
}

fn default_stream_interval() -> u64 {
    10
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            interval_secs: default_stream_interval(),
        }
    }
}

/// One concurrent member of the final stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelMember {
    pub name: String,
    /// Relative paths resolve against `device.scripts_root`.
    pub script: PathBuf,
    #[serde(default)]
    pub runtime: ScriptRuntime,
    #[serde(default)]
    pub args: Vec<String>,
    /// Relative paths resolve against `device.log_root`. Must be unique.
    pub log: PathBuf,
    #[serde(default)]
    pub target: Option<ExecutionTarget>,
    #[serde(default)]
    pub stream_key: Option<String>,
    #[serde(default)]
    pub result_key: Option<String>,
}

/// Final-stage fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSection {
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,
    #[serde(default = "default_parallel_members")]
    pub members: Vec<ParallelMember>,
}

fn default_stagger_secs() -> u64 {
    2
}

fn default_parallel_members() -> Vec<ParallelMember> {
    vec![
        ParallelMember {
            name: "led-soak".to_string(),
            script: PathBuf::from("led_test.sh"),
            runtime: ScriptRuntime::Shell,
            args: vec!["--soak".to_string()],
            log: PathBuf::from("final_led.txt"),
            target: None,
            stream_key: None,
            result_key: Some("finalLedFile".to_string()),
        },
        ParallelMember {
            name: "nvme-soak".to_string(),
            script: PathBuf::from("nvme_test.sh"),
            runtime: ScriptRuntime::Shell,
            args: vec!["--soak".to_string()],
            log: PathBuf::from("final_nvme.txt"),
            target: None,
            stream_key: None,
            result_key: Some("finalNvmeFile".to_string()),
        },
    ]
}

impl Default for ParallelSection {
    fn default() -> Self {
        Self {
            stagger_secs: default_stagger_secs(),
            members: default_parallel_members(),
        }
    }
}

/// Per-stage override; unset fields keep the built-in stage defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub runtime: Option<ScriptRuntime>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub log: Option<PathBuf>,
    #[serde(default)]
    pub target: Option<ExecutionTarget>,
    #[serde(default)]
    pub tolerate_disconnect: Option<bool>,
    #[serde(default)]
    pub stream_key: Option<String>,
    #[serde(default)]
    pub result_key: Option<String>,
    #[serde(default)]
    pub extra_path: Option<PathBuf>,
    #[serde(default)]
    pub extra_key: Option<String>,
    /// Drop this stage from the table entirely.
    #[serde(default)]
    pub skip: bool,
}

/// Run-wide execution defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Target for stages that do not set one.
    #[serde(default)]
    pub default_target: ExecutionTarget,
}

/// Best-effort cleanup after an operator interrupt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownSection {
    /// Each entry is an argv run locally, in order.
    #[serde(default = "default_teardown_commands")]
    pub commands: Vec<Vec<String>>,
}

fn default_teardown_commands() -> Vec<Vec<String>> {
    vec![vec![
        "sudo".to_string(),
        "/home/truffle/QA/led_test/ledoff".to_string(),
    ]]
}

impl Default for TeardownSection {
    fn default() -> Self {
        Self {
            commands: default_teardown_commands(),
        }
    }
}

/// The complete qa.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QaToml {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub local: LocalSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub parallel: ParallelSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    /// Keyed by stage name; unknown names are reported by [`QaToml::validate`].
    #[serde(default)]
    pub stages: BTreeMap<String, StageOverride>,
    #[serde(default)]
    pub teardown: TeardownSection,
}

impl QaToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse qa.toml")
    }

    /// Load `path` if given and present, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize qa.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Override block for `name`, if any.
    pub fn stage_override(&self, name: StageName) -> Option<&StageOverride> {
        self.stages.get(name.as_str())
    }

    /// Backend timeout after clamping.
    pub fn backend_timeout_secs(&self) -> u64 {
        self.backend.timeout_secs.clamp(1, MAX_BACKEND_TIMEOUT_SECS)
    }

    /// Validate configuration and return warnings.
    ///
    /// Only soft problems; anything that would make the stage table unsafe
    /// to run is an error from `Config::build_stage_table` instead.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = regex::Regex::new(&self.device.id_pattern) {
            warnings.push(format!("device.id_pattern is not a valid regex: {}", e));
        }

        if self.backend.base_url.is_none() {
            warnings.push(
                "backend.base_url is not set; progress will not be reported (set QARUN_BACKEND_URL)"
                    .to_string(),
            );
        }

        if self.backend.timeout_secs > MAX_BACKEND_TIMEOUT_SECS {
            warnings.push(format!(
                "backend.timeout_secs = {} exceeds {}s and will be clamped",
                self.backend.timeout_secs, MAX_BACKEND_TIMEOUT_SECS
            ));
        }

        if self.stream.interval_secs == 0 {
            warnings.push("stream.interval_secs must be at least 1".to_string());
        }

        if self.remote.reachability_interval_secs == 0 {
            warnings.push("remote.reachability_interval_secs must be at least 1".to_string());
        }

        if self.stage_override(StageName::Final).is_some_and(|o| o.script.is_some()) {
            warnings.push(
                "stages.final.script is ignored; configure [[parallel.members]] instead"
                    .to_string(),
            );
        }

        warnings
    }
}
