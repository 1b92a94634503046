//! Configuration view and validation commands: `qarun config`.

use anyhow::Result;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<i32> {
    use qarun::config::{CONFIG_FILE_NAME, Config};
    use qarun::qa_config::QaToml;

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = Config::load(cli.config.as_deref(), cli.verbose, cli.yes)?;

            println!();
            println!("qarun Configuration");
            println!("===================");
            println!();

            match &config.config_path {
                Some(path) => println!("Config file: {}", path.display()),
                None => {
                    println!("No {} found; using defaults.", CONFIG_FILE_NAME);
                    println!("Run 'qarun config init' to create one.");
                }
            }
            println!();

            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();

            // Show effective values (including env overrides)
            println!("Effective values (with env/CLI overrides):");
            println!(
                "  backend_url = \"{}\"",
                config.backend_url.as_deref().unwrap_or("(offline)")
            );
            println!("  log_root = \"{}\"", config.log_root.display());
            println!("  scripts_root = \"{}\"", config.scripts_root.display());
            println!(
                "  sudo_password = {}",
                if config.sudo_password.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!();
            Ok(0)
        }
        Some(ConfigCommands::Validate) => {
            let config = Config::load(cli.config.as_deref(), cli.verbose, cli.yes)?;

            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.toml.validate();
            if !warnings.is_empty() {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                println!();
            }

            match config.validated_stage_table() {
                Ok(table) => {
                    println!("Configuration is valid ({} stages).", table.len());
                    println!();
                    Ok(0)
                }
                Err(e) => {
                    println!("Configuration error: {}", e);
                    println!();
                    Ok(1)
                }
            }
        }
        Some(ConfigCommands::Init) => {
            let config_path = cli
                .config
                .clone()
                .unwrap_or_else(|| std::path::PathBuf::from(CONFIG_FILE_NAME));

            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(0);
            }

            QaToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [device] id_pattern, log_root, scripts_root");
            println!("  - [backend] base_url, timeout_secs");
            println!("  - [stages.<name>] for stage-specific settings");
            println!("  - [[parallel.members]] for the final concurrent stage");
            println!();
            Ok(0)
        }
    }
}
