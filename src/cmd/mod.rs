//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled    |
//! |-----------|---------------------|
//! | `run`     | `Run`               |
//! | `device`  | `Status`, `Reset`   |
//! | `stages`  | `Stages`            |
//! | `config`  | `Config`            |
//! | `exec`    | `Exec`              |

pub mod config;
pub mod device;
pub mod exec;
pub mod run;
pub mod stages;

pub use config::cmd_config;
pub use device::{cmd_reset, cmd_status};
pub use exec::cmd_exec;
pub use run::cmd_run;
pub use stages::cmd_stages;

use anyhow::Result;
use qarun::backend::{ArtifactUploader, BackendClient, OfflineBackend, ProgressStore};
use qarun::config::Config;
use qarun::logging::{LoggingGuard, init_logging};
use std::sync::Arc;

use super::Cli;

/// Load config and check the device id before any command touches the device.
pub fn load_for_device(cli: &Cli, device: &str) -> Result<Config> {
    let config = Config::load(cli.config.as_deref(), cli.verbose, cli.yes)?;
    config.validate_device_id(device)?;
    Ok(config)
}

/// Start diagnostics logging under the log root.
///
/// A log root we cannot write to is reported and the command carries on
/// without a log file.
pub fn start_logging(config: &Config) -> Option<LoggingGuard> {
    match init_logging(&config.log_root, config.verbose) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!(
                "Warning: could not open log directory {}: {}",
                config.log_root.display(),
                e
            );
            None
        }
    }
}

/// Log `qa.toml` warnings once logging is up.
pub fn report_config_warnings(config: &Config) {
    for warning in config.toml.validate() {
        tracing::warn!(config = ?config.config_path, "{}", warning);
    }
}

/// The configured backend, or the offline stand-in when no URL is set.
pub fn backend_for(
    config: &Config,
) -> Result<(Arc<dyn ProgressStore>, Arc<dyn ArtifactUploader>)> {
    match &config.backend_url {
        Some(url) => {
            let client = Arc::new(BackendClient::new(url, config.backend_timeout())?);
            Ok((client.clone(), client))
        }
        None => Ok((Arc::new(OfflineBackend), Arc::new(OfflineBackend))),
    }
}
