use anyhow::{Context, Result, bail};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::local::LocalSettings;
use crate::qa_config::QaToml;
use crate::remote::RemoteSettings;
use crate::remote::reachability::ReachabilitySettings;
use crate::stage::{
    ScriptSpec, StageAction, StageName, StageRunSpec, StageTable, default_result_key,
    stage_defaults,
};

/// Name of the config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "qa.toml";

/// Runtime configuration for a qarun invocation.
///
/// Bridges `qa.toml` with environment variables and CLI flags. Precedence,
/// lowest first: built-in defaults, `qa.toml`, `.env` and `QARUN_*`
/// variables, CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// The file the settings came from; `None` when running on defaults.
    pub config_path: Option<PathBuf>,
    pub toml: QaToml,
    pub log_root: PathBuf,
    pub scripts_root: PathBuf,
    pub backend_url: Option<String>,
    /// Secret fed to remote privilege-elevation prompts. Environment only.
    pub sudo_password: Option<String>,
    pub verbose: bool,
    /// Skip the per-stage confirmation prompt.
    pub yes: bool,
}

impl Config {
    /// Load configuration for this process.
    pub fn load(explicit: Option<&Path>, verbose: bool, yes: bool) -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();

        let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
        let config_path = Self::locate(explicit, &cwd, dirs::config_dir())?;
        Self::from_parts(config_path, |key| std::env::var(key).ok(), verbose, yes)
    }

    /// Build a config from an optional file and an environment lookup.
    pub fn from_parts(
        config_path: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
        verbose: bool,
        yes: bool,
    ) -> Result<Self> {
        let mut toml = QaToml::load_or_default(config_path.as_deref())?;

        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = env("QARUN_BACKEND_URL") {
            toml.backend.base_url = Some(url);
        }
        if let Some(root) = env("QARUN_LOG_ROOT") {
            toml.device.log_root = PathBuf::from(root);
        }
        if let Some(root) = env("QARUN_SCRIPTS_ROOT") {
            toml.device.scripts_root = PathBuf::from(root);
        }
        if let Some(user) = env("QARUN_REMOTE_USER") {
            toml.remote.username = user;
        }

        Ok(Self {
            config_path,
            log_root: toml.device.log_root.clone(),
            scripts_root: toml.device.scripts_root.clone(),
            backend_url: toml.backend.base_url.clone(),
            sudo_password: env("QARUN_SUDO_PASSWORD"),
            verbose,
            yes,
            toml,
        })
    }

    /// Find the config file: explicit path, then `./qa.toml`, then the user config dir.
    pub fn locate(
        explicit: Option<&Path>,
        cwd: &Path,
        config_dir: Option<PathBuf>,
    ) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            return Ok(Some(path.to_path_buf()));
        }

        let local = cwd.join(CONFIG_FILE_NAME);
        if local.exists() {
            return Ok(Some(local));
        }

        Ok(config_dir
            .map(|dir| dir.join("qarun").join(CONFIG_FILE_NAME))
            .filter(|p| p.exists()))
    }

    /// Reject device ids that do not match `device.id_pattern`.
    pub fn validate_device_id(&self, device_id: &str) -> Result<(), ConfigError> {
        let pattern = &self.toml.device.id_pattern;
        let re = regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidValue {
            key: "device.id_pattern".to_string(),
            message: e.to_string(),
        })?;
        if !re.is_match(device_id) {
            return Err(ConfigError::InvalidDeviceId {
                id: device_id.to_string(),
                pattern: pattern.clone(),
            });
        }
        Ok(())
    }

    /// Network hostname of the DUT.
    pub fn hostname(&self, device_id: &str) -> String {
        format!("{}{}", device_id, self.toml.remote.host_suffix)
    }

    /// Assemble the stage table from built-in defaults and `[stages.*]` overrides.
    ///
    /// Does not touch the filesystem; see [`Config::validated_stage_table`].
    pub fn build_stage_table(&self) -> Result<StageTable, ConfigError> {
        let default_target = self.toml.execution.default_target;
        let mut entries = Vec::new();

        if let Some(unknown) = self
            .toml
            .stages
            .keys()
            .find(|key| key.parse::<StageName>().is_err())
        {
            return Err(ConfigError::InvalidValue {
                key: format!("stages.{}", unknown),
                message: "not a known stage (setup, led, nvme, hotspot, gpu, final)".to_string(),
            });
        }

        for name in StageName::ALL {
            let ov = self.toml.stage_override(name).cloned().unwrap_or_default();
            if ov.skip {
                continue;
            }

            let Some(defaults) = stage_defaults(name) else {
                entries.push((name, StageAction::Parallel(self.parallel_members()?)));
                continue;
            };

            let mut spec = defaults
                .to_run_spec(name, &self.scripts_root, &self.log_root)
                .with_target(ov.target.unwrap_or(default_target));

            if let Some(script) = &ov.script {
                spec.script.path = resolve(&self.scripts_root, script);
            }
            if let Some(runtime) = ov.runtime {
                spec.script.runtime = runtime;
            }
            if let Some(args) = ov.args {
                spec.script.args = args;
            }
            if let Some(log) = &ov.log {
                spec.log_artifact = resolve(&self.log_root, log);
            }
            if let Some(tolerate) = ov.tolerate_disconnect {
                spec.tolerate_disconnect = tolerate;
            }
            if let Some(key) = &ov.stream_key {
                spec = spec.with_stream_key(key);
            }
            if let Some(key) = &ov.result_key {
                spec = spec.with_result_key(key);
            }
            match (&ov.extra_path, &ov.extra_key) {
                (Some(path), Some(key)) => {
                    spec = spec.with_extra_artifact(resolve(&self.log_root, path), key);
                }
                (Some(path), None) => {
                    let Some(existing) = spec.extra_artifact.as_mut() else {
                        return Err(ConfigError::InvalidValue {
                            key: format!("stages.{}.extra_key", name),
                            message: "required when extra_path is set".to_string(),
                        });
                    };
                    existing.path = resolve(&self.log_root, path);
                }
                (None, Some(key)) => {
                    let Some(existing) = spec.extra_artifact.as_mut() else {
                        return Err(ConfigError::InvalidValue {
                            key: format!("stages.{}.extra_path", name),
                            message: "required when extra_key is set".to_string(),
                        });
                    };
                    existing.field = key.clone();
                }
                (None, None) => {}
            }

            entries.push((name, StageAction::Script(spec)));
        }

        StageTable::new(entries)
    }

    /// [`Config::build_stage_table`] plus a check that every local script exists.
    pub fn validated_stage_table(&self) -> Result<StageTable, ConfigError> {
        let table = self.build_stage_table()?;
        table.validate_scripts()?;
        Ok(table)
    }

    /// Concurrent members of the final stage.
    ///
    /// Members run side by side, so each needs its own name and log file.
    fn parallel_members(&self) -> Result<Vec<StageRunSpec>, ConfigError> {
        let default_target = self.toml.execution.default_target;
        let members: Vec<StageRunSpec> = self
            .toml
            .parallel
            .members
            .iter()
            .map(|m| {
                let script = ScriptSpec::new(
                    resolve(&self.scripts_root, &m.script),
                    m.runtime,
                    m.args.clone(),
                );
                let result_key = m
                    .result_key
                    .clone()
                    .unwrap_or_else(|| default_result_key(&m.name));
                let mut spec =
                    StageRunSpec::new(StageName::Final, script, resolve(&self.log_root, &m.log))
                        .named(&m.name)
                        .with_target(m.target.unwrap_or(default_target))
                        .with_result_key(&result_key);
                if let Some(key) = &m.stream_key {
                    spec = spec.with_stream_key(key);
                }
                spec
            })
            .collect();

        let mut names = HashSet::new();
        let mut logs = HashSet::new();
        for member in &members {
            if !names.insert(member.name.clone()) {
                return Err(ConfigError::InvalidValue {
                    key: "parallel.members".to_string(),
                    message: format!("member '{}' is declared twice", member.name),
                });
            }
            if !logs.insert(member.log_artifact.clone()) {
                return Err(ConfigError::InvalidValue {
                    key: "parallel.members".to_string(),
                    message: format!(
                        "member '{}' shares log file {} with another member",
                        member.name,
                        member.log_artifact.display()
                    ),
                });
            }
        }
        Ok(members)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_root).with_context(|| {
            format!("Failed to create log directory: {}", self.log_root.display())
        })?;
        Ok(())
    }

    pub fn journal_file(&self) -> PathBuf {
        self.log_root.join("qarun.journal")
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.backend_timeout_secs())
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_secs(self.toml.stream.interval_secs.max(1))
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.toml.parallel.stagger_secs)
    }

    pub fn teardown_commands(&self) -> &[Vec<String>] {
        &self.toml.teardown.commands
    }

    pub fn remote_settings(&self) -> RemoteSettings {
        let remote = &self.toml.remote;
        RemoteSettings {
            username: remote.username.clone(),
            password: self.sudo_password.clone(),
            port: remote.port,
            connect_timeout: Duration::from_secs(remote.connect_timeout_secs),
            poll_interval: Duration::from_millis(remote.poll_interval_ms.max(1)),
        }
    }

    pub fn reachability_settings(&self) -> ReachabilitySettings {
        let remote = &self.toml.remote;
        ReachabilitySettings {
            port: remote.port,
            timeout: Duration::from_secs(remote.reachability_timeout_secs),
            interval: Duration::from_secs(remote.reachability_interval_secs.max(1)),
            probe_timeout: Duration::from_secs(remote.probe_timeout_secs.max(1)),
        }
    }

    pub fn local_settings(&self) -> LocalSettings {
        LocalSettings {
            elevate: self.toml.local.elevate.clone(),
            log_env_var: self.toml.local.log_env_var.clone(),
        }
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{ExecutionTarget, ScriptRuntime};
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn config_from(content: &str) -> Config {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, content).unwrap();
        Config::from_parts(Some(path), no_env, false, false).unwrap()
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::from_parts(None, no_env, true, false).unwrap();
        assert!(config.verbose);
        assert!(config.config_path.is_none());
        assert_eq!(config.log_root, PathBuf::from("/home/truffle/qa_logs"));
        assert!(config.backend_url.is_none());
        assert!(config.sudo_password.is_none());
        assert_eq!(config.journal_file(), PathBuf::from("/home/truffle/qa_logs/qarun.journal"));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "[backend]\nbase_url = \"http://from-file\"\n[device]\nlog_root = \"/file/logs\"\n",
        )
        .unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("QARUN_BACKEND_URL", "http://from-env"),
            ("QARUN_SUDO_PASSWORD", "hunter2"),
            ("QARUN_REMOTE_USER", "qa"),
            ("QARUN_SCRIPTS_ROOT", ""),
        ]);
        let config = Config::from_parts(
            Some(path),
            |k| env.get(k).map(|v| v.to_string()),
            false,
            true,
        )
        .unwrap();

        assert_eq!(config.backend_url.as_deref(), Some("http://from-env"));
        assert_eq!(config.log_root, PathBuf::from("/file/logs"));
        assert_eq!(config.sudo_password.as_deref(), Some("hunter2"));
        assert_eq!(config.remote_settings().username, "qa");
        // Empty values are ignored.
        assert_eq!(config.scripts_root, PathBuf::from("/home/truffle/qa/scripts"));
    }

    #[test]
    fn test_locate_precedence() {
        let cwd = tempdir().unwrap();
        let cfg_dir = tempdir().unwrap();
        let user_file = cfg_dir.path().join("qarun").join(CONFIG_FILE_NAME);
        fs::create_dir_all(user_file.parent().unwrap()).unwrap();
        fs::write(&user_file, "").unwrap();

        let found =
            Config::locate(None, cwd.path(), Some(cfg_dir.path().to_path_buf())).unwrap();
        assert_eq!(found, Some(user_file));

        let local_file = cwd.path().join(CONFIG_FILE_NAME);
        fs::write(&local_file, "").unwrap();
        let found =
            Config::locate(None, cwd.path(), Some(cfg_dir.path().to_path_buf())).unwrap();
        assert_eq!(found, Some(local_file.clone()));

        let found = Config::locate(Some(&local_file), cwd.path(), None).unwrap();
        assert_eq!(found, Some(local_file));

        let missing = cwd.path().join("nope.toml");
        assert!(Config::locate(Some(&missing), cwd.path(), None).is_err());
    }

    #[test]
    fn test_validate_device_id() {
        let config = Config::from_parts(None, no_env, false, false).unwrap();
        assert!(config.validate_device_id("truffle-0042").is_ok());
        assert!(matches!(
            config.validate_device_id("truffle-42"),
            Err(ConfigError::InvalidDeviceId { .. })
        ));
        assert!(config.validate_device_id("TRUFFLE-0042").is_err());
    }

    #[test]
    fn test_invalid_pattern_is_a_config_error() {
        let config = config_from("[device]\nid_pattern = \"([\"\n");
        assert!(matches!(
            config.validate_device_id("truffle-0001"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_hostname_uses_suffix() {
        let config = Config::from_parts(None, no_env, false, false).unwrap();
        assert_eq!(config.hostname("truffle-0007"), "truffle-0007.local");
    }

    #[test]
    fn test_default_stage_table() {
        let config = Config::from_parts(None, no_env, false, false).unwrap();
        let table = config.build_stage_table().unwrap();
        let names: Vec<StageName> = table.iter().map(|s| s.name).collect();
        assert_eq!(names, StageName::ALL.to_vec());

        let Some(StageAction::Script(gpu)) =
            table.stage_by_name(StageName::Gpu).map(|s| &s.action)
        else {
            panic!("gpu should be a script stage");
        };
        assert_eq!(gpu.script.runtime, ScriptRuntime::Python);
        assert_eq!(gpu.stream_key.as_deref(), Some("gpuTestFile"));
        assert_eq!(
            gpu.extra_artifact.as_ref().map(|e| e.path.clone()),
            Some(PathBuf::from("/home/truffle/qa_logs/burn_test.csv"))
        );

        let Some(StageAction::Parallel(members)) =
            table.stage_by_name(StageName::Final).map(|s| &s.action)
        else {
            panic!("final should be concurrent");
        };
        let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["led-soak", "nvme-soak"]);
        assert_eq!(members[0].result_key, "finalLedFile");
        assert_eq!(
            members[1].log_artifact,
            PathBuf::from("/home/truffle/qa_logs/final_nvme.txt")
        );
    }

    #[test]
    fn test_stage_overrides_apply() {
        let config = config_from(
            r#"
[execution]
default_target = "remote"

[stages.setup]
tolerate_disconnect = false

[stages.nvme]
script = "/opt/nvme.sh"
args = ["--quick"]
log = "nvme_quick.txt"
target = "local"
result_key = "nvmeQuick"

[stages.hotspot]
skip = true
"#,
        );
        let table = config.build_stage_table().unwrap();
        assert!(table.stage_by_name(StageName::Hotspot).is_none());

        let Some(StageAction::Script(setup)) =
            table.stage_by_name(StageName::Setup).map(|s| &s.action)
        else {
            panic!("setup missing");
        };
        assert_eq!(setup.target, ExecutionTarget::Remote);
        assert!(!setup.tolerate_disconnect);

        let Some(StageAction::Script(nvme)) =
            table.stage_by_name(StageName::Nvme).map(|s| &s.action)
        else {
            panic!("nvme missing");
        };
        assert_eq!(nvme.target, ExecutionTarget::Local);
        assert_eq!(nvme.script.path, PathBuf::from("/opt/nvme.sh"));
        assert_eq!(nvme.script.args, vec!["--quick"]);
        assert_eq!(
            nvme.log_artifact,
            PathBuf::from("/home/truffle/qa_logs/nvme_quick.txt")
        );
        assert_eq!(nvme.result_key, "nvmeQuick");
    }

    #[test]
    fn test_extra_path_without_key_needs_existing_extra() {
        let config = config_from("[stages.led]\nextra_path = \"led.csv\"\n");
        assert!(matches!(
            config.build_stage_table(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let config = config_from("[stages.gpu]\nextra_path = \"/tmp/gpu.csv\"\n");
        let table = config.build_stage_table().unwrap();
        let Some(StageAction::Script(gpu)) =
            table.stage_by_name(StageName::Gpu).map(|s| &s.action)
        else {
            panic!("gpu missing");
        };
        let extra = gpu.extra_artifact.as_ref().unwrap();
        assert_eq!(extra.path, PathBuf::from("/tmp/gpu.csv"));
        assert_eq!(extra.field, "gpuTestGraph");
    }

    #[test]
    fn test_validated_stage_table_catches_missing_scripts() {
        let scripts = tempdir().unwrap();
        let config = config_from(&format!(
            "[device]\nscripts_root = \"{}\"\n",
            scripts.path().display()
        ));
        assert!(matches!(
            config.validated_stage_table(),
            Err(ConfigError::ScriptMissing { .. })
        ));
    }

    #[test]
    fn test_unknown_stage_section_is_rejected() {
        let config = config_from("[stages.stage0]\nskip = true\n");
        let err = config.build_stage_table().unwrap_err();
        assert!(err.to_string().contains("stages.stage0"), "{}", err);
    }

    #[test]
    fn test_duplicate_member_names_are_rejected() {
        let config = config_from(
            r#"
[[parallel.members]]
name = "soak"
script = "a.sh"
log = "a.txt"

[[parallel.members]]
name = "soak"
script = "b.sh"
log = "b.txt"
"#,
        );
        let err = config.build_stage_table().unwrap_err();
        assert!(err.to_string().contains("declared twice"), "{}", err);
    }

    #[test]
    fn test_members_sharing_a_log_are_rejected() {
        let config = config_from(
            r#"
[[parallel.members]]
name = "a"
script = "a.sh"
log = "same.txt"

[[parallel.members]]
name = "b"
script = "b.sh"
log = "same.txt"
"#,
        );
        let err = config.build_stage_table().unwrap_err();
        assert!(err.to_string().contains("shares log file"), "{}", err);
    }

    #[test]
    fn test_skipped_final_still_accepts_distinct_members() {
        let config = config_from("[stages.hotspot]\nskip = true\n");
        let table = config.build_stage_table().unwrap();
        assert!(table.stage_by_name(StageName::Hotspot).is_none());
        assert!(table.stage_by_name(StageName::Final).unwrap().is_parallel());
    }

    #[test]
    fn test_remote_scripts_are_not_checked_locally() {
        let config = config_from("[execution]\ndefault_target = \"remote\"\n");
        assert!(config.validated_stage_table().is_ok());
    }

    #[test]
    fn test_settings_builders() {
        let config = config_from(
            "[backend]\ntimeout_secs = 90\n[stream]\ninterval_secs = 0\n[local]\nelevate = []\n",
        );
        assert_eq!(config.backend_timeout(), Duration::from_secs(30));
        assert_eq!(config.stream_interval(), Duration::from_secs(1));
        assert!(config.local_settings().elevate.is_empty());
        assert_eq!(config.reachability_settings().timeout, Duration::from_secs(300));
        assert_eq!(config.stagger(), Duration::from_secs(2));
        assert_eq!(config.teardown_commands().len(), 1);
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let mut config = Config::from_parts(None, no_env, false, false).unwrap();
        config.log_root = dir.path().join("qa_logs");
        config.ensure_directories().unwrap();
        assert!(config.log_root.exists());
    }
}
