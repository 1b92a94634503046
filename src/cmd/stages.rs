//! Stage table listing: `qarun stages`.

use anyhow::Result;
use console::style;

use super::super::Cli;

pub fn cmd_stages(cli: &Cli) -> Result<i32> {
    use qarun::config::Config;
    use qarun::stage::{StageAction, StageRunSpec};

    let config = Config::load(cli.config.as_deref(), cli.verbose, cli.yes)?;
    let table = config.build_stage_table()?;

    println!();
    println!("{}", style("Stage table").bold());
    println!();

    for stage in table.iter() {
        println!(
            "  {}. {} ({})",
            stage.ordinal + 1,
            style(stage.name).cyan().bold(),
            stage.name.title()
        );
        match &stage.action {
            StageAction::Script(spec) => print_spec(spec, "     "),
            StageAction::Parallel(members) => {
                println!("     concurrent tasks: {}", members.len());
                for member in members {
                    println!("     - {}", style(&member.name).bold());
                    print_spec(member, "       ");
                }
            }
        }
        println!();
    }

    fn print_spec(spec: &StageRunSpec, indent: &str) {
        let missing = if spec.validate().is_err() {
            format!(" {}", style("(missing)").red())
        } else {
            String::new()
        };
        println!(
            "{}script: {}{} [{}]",
            indent,
            spec.script.argv().join(" "),
            missing,
            spec.target
        );
        println!("{}log:    {}", indent, spec.log_artifact.display());
        let artifacts: Vec<String> = spec
            .artifacts()
            .iter()
            .map(|(field, path)| format!("{}={}", field, path.display()))
            .collect();
        let mode = if spec.stream_key.is_some() {
            "streamed"
        } else {
            "on completion"
        };
        println!("{}upload: {} ({})", indent, artifacts.join(", "), mode);
        if spec.tolerate_disconnect {
            println!("{}reboots: tolerated", indent);
        }
    }

    Ok(0)
}
