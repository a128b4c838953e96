mod commands;
mod daemon;

use anyhow::Result;
use console::style;
use std::path::Path;

use crate::core::config::Config;
use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Daemon")
        .command("run", "Start the daemon in the foreground")
        .command("init", "Write a default config file")
        .print();

    GuideSection::new("Backlog")
        .command("task add <title>", "Queue a task (--type T, --priority N)")
        .command("task list", "Show recent tasks")
        .command("task resume <id>", "Requeue a blocked or failed task")
        .command("commitments", "Show open commitments")
        .command("status", "Task counts, commitments and spend")
        .print();

    GuideSection::new("Options")
        .command("--config <path>", "Config file (default ~/.nightshift/config.toml, or $NIGHTSHIFT_CONFIG)")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("nightshift").green()
    );
}

/// Removes `--config <path>` from the argument list and returns the path.
pub(crate) fn take_config_flag(args: &mut Vec<String>) -> Option<String> {
    let i = args.iter().position(|a| a == "--config" || a == "-c")?;
    if i + 1 < args.len() {
        let value = args.remove(i + 1);
        args.remove(i);
        Some(value)
    } else {
        args.remove(i);
        None
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)?;
    config.validate()?;
    Ok(config)
}

pub async fn run_main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().collect();
    let explicit = take_config_flag(&mut args);
    let config_path = Config::resolve_path(explicit.as_deref());

    let cmd = args.get(1).map(String::as_str).unwrap_or("help");
    match cmd {
        "run" => {
            let config = load_config(&config_path)?;
            daemon::run(config).await
        }
        "init" => commands::init(&config_path),
        "task" => {
            let config = Config::load(&config_path)?;
            let sub = args.get(2).map(String::as_str).unwrap_or("");
            match sub {
                "add" => commands::task_add(&config, &args[3..]).await,
                "list" => commands::task_list(&config).await,
                "resume" => match args.get(3) {
                    Some(id) => commands::task_resume(&config, id).await,
                    None => {
                        print_error("Usage: nightshift task resume <id>");
                        Ok(())
                    }
                },
                _ => {
                    print_error("Unknown or missing task command. Expected: add, list, resume");
                    print_help();
                    Ok(())
                }
            }
        }
        "status" => commands::status(&Config::load(&config_path)?).await,
        "commitments" => commands::commitments(&Config::load(&config_path)?).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command: {}", other));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn config_flag_is_removed_wherever_it_appears() {
        let mut args = argv(&["nightshift", "task", "--config", "/tmp/n.toml", "list"]);
        assert_eq!(take_config_flag(&mut args).as_deref(), Some("/tmp/n.toml"));
        assert_eq!(args, argv(&["nightshift", "task", "list"]));

        let mut args = argv(&["nightshift", "run", "--config"]);
        assert_eq!(take_config_flag(&mut args), None);
        assert_eq!(args, argv(&["nightshift", "run"]));

        let mut args = argv(&["nightshift", "status"]);
        assert_eq!(take_config_flag(&mut args), None);
        assert_eq!(args.len(), 2);
    }
}
