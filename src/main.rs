use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "qarun")]
#[command(version, about = "Resumable multi-stage QA runner for truffle devices")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run every stage without asking for confirmation
    #[arg(long, global = true)]
    pub yes: bool,

    /// Path to qa.toml. Defaults to ./qa.toml, then the user config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the QA stages for a device, resuming where the backend says it stopped
    Run {
        /// Device id, e.g. truffle-0042
        #[arg(short, long)]
        device: String,

        /// Start from this stage instead of the backend resume point
        #[arg(long)]
        from: Option<String>,
    },
    /// Show the backend resume point and the last local run
    Status {
        #[arg(short, long)]
        device: String,
    },
    /// Set the device's progress back to the first stage
    Reset {
        #[arg(short, long)]
        device: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// List the stage table
    Stages,
    /// Show, validate or create qa.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Run one command on the device over SSH
    Exec {
        #[arg(short, long)]
        device: String,

        /// Treat a dropped session as success and wait for the host to return
        #[arg(long)]
        tolerate_disconnect: bool,

        /// Command to run, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default qa.toml
    Init,
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::Run { device, from } => cmd::cmd_run(cli, device, from.as_deref()).await,
        Commands::Status { device } => cmd::cmd_status(cli, device).await,
        Commands::Reset { device, force } => cmd::cmd_reset(cli, device, *force).await,
        Commands::Stages => cmd::cmd_stages(cli),
        Commands::Config { command } => cmd::cmd_config(cli, command.clone()),
        Commands::Exec {
            device,
            tolerate_disconnect,
            command,
        } => cmd::cmd_exec(cli, device, *tolerate_disconnect, command).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let code = dispatch(&cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
