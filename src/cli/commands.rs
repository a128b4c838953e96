use anyhow::{Result, anyhow};
use console::style;
use std::path::Path;

use crate::core::budget::spend_to_date;
use crate::core::commitments::CommitmentStore;
use crate::core::config::Config;
use crate::core::ledger::{NewTask, TaskLedger, TaskStatus, TaskType};
use crate::core::store::Datastore;
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_warn};

pub fn init(path: &Path) -> Result<()> {
    if path.exists() {
        print_warn(&format!("{} already exists, leaving it alone.", path.display()));
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, Config::default().to_toml()?)?;
    print_success(&format!("Wrote default config to {}", path.display()));
    print_info("Set ANTHROPIC_API_KEY (or pick another backend), then run 'nightshift run'.");
    Ok(())
}

pub(crate) fn parse_task_args(args: &[String]) -> Result<(String, TaskType, i64)> {
    let mut task_type = TaskType::General;
    let mut priority = 0;
    let mut title = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--type" | "-t" => {
                let value = args.get(i + 1).ok_or_else(|| anyhow!("--type needs a value"))?;
                task_type = TaskType::parse(value).ok_or_else(|| anyhow!("unknown task type '{}'", value))?;
                i += 2;
            }
            "--priority" | "-p" => {
                let value = args.get(i + 1).ok_or_else(|| anyhow!("--priority needs a value"))?;
                priority = value
                    .parse()
                    .map_err(|_| anyhow!("priority must be a number, got '{}'", value))?;
                i += 2;
            }
            word => {
                title.push(word.to_string());
                i += 1;
            }
        }
    }
    if title.is_empty() {
        return Err(anyhow!("usage: nightshift task add [--type T] [--priority N] <title>"));
    }
    Ok((title.join(" "), task_type, priority))
}

async fn ledger(config: &Config) -> Result<TaskLedger> {
    let store = Datastore::open(&config.data_dir).await?;
    Ok(TaskLedger::new(store.get_db()))
}

pub async fn task_add(config: &Config, args: &[String]) -> Result<()> {
    let (title, task_type, priority) = match parse_task_args(args) {
        Ok(parsed) => parsed,
        Err(e) => {
            print_error(&e.to_string());
            return Ok(());
        }
    };
    let task = ledger(config)
        .await?
        .create(NewTask::new(title, task_type).priority(priority))
        .await?;
    print_success(&format!("Queued {} ({})", task.title, style(&task.id).dim()));
    Ok(())
}

pub async fn task_list(config: &Config) -> Result<()> {
    let tasks = ledger(config).await?.list_recent(20).await?;
    if tasks.is_empty() {
        print_info("No tasks yet.");
        return Ok(());
    }
    let mut section = GuideSection::new("Recent tasks");
    for task in &tasks {
        let status = match task.status {
            TaskStatus::Done => style(task.status.as_str()).green(),
            TaskStatus::Failed => style(task.status.as_str()).red(),
            TaskStatus::Blocked => style(task.status.as_str()).yellow(),
            _ => style(task.status.as_str()).cyan(),
        };
        section = section.text(&format!(
            "{:<8} {} {} {}",
            status,
            task.title,
            style(format!("p{}", task.priority)).dim(),
            style(&task.id).dim()
        ));
        if let Some(reason) = task.status_reason() {
            section = section.text(&format!("         {}", style(reason).dim()));
        }
    }
    section.print();
    println!();
    Ok(())
}

pub async fn task_resume(config: &Config, id: &str) -> Result<()> {
    match ledger(config).await?.resume(id).await? {
        Some(task) => print_success(&format!("Requeued {}", task.title)),
        None => print_warn(&format!("No blocked or failed task with id {}", id)),
    }
    Ok(())
}

pub async fn status(config: &Config) -> Result<()> {
    let store = Datastore::open(&config.data_dir).await?;
    let counts = TaskLedger::new(store.get_db()).status_counts().await?;
    let commitments = CommitmentStore::new(store.get_db(), config.timezone()?)
        .list_open()
        .await?;
    let spent = spend_to_date(&store.get_db()).await?;

    let mut section = GuideSection::new("nightshift");
    for s in TaskStatus::ALL {
        section = section.status(
            &format!("Tasks {}", s.as_str()),
            &counts.get(&s).copied().unwrap_or(0).to_string(),
        );
    }
    section
        .status("Open commitments", &commitments.len().to_string())
        .status(
            "Spend to date",
            &match config.budget.global_cap_usd {
                Some(cap) => format!("${:.2} of ${:.2}", spent, cap),
                None => format!("${:.2}", spent),
            },
        )
        .status(
            "Active hours",
            &format!(
                "{:02}:00-{:02}:00 {}",
                config.schedule.active_start_hour, config.schedule.active_end_hour, config.schedule.timezone
            ),
        )
        .print();
    println!();
    Ok(())
}

pub async fn commitments(config: &Config) -> Result<()> {
    let store = Datastore::open(&config.data_dir).await?;
    let open = CommitmentStore::new(store.get_db(), config.timezone()?)
        .list_open()
        .await?;
    if open.is_empty() {
        print_info("No open commitments.");
        return Ok(());
    }
    let mut section = GuideSection::new("Open commitments");
    for c in &open {
        section = section.status(
            &c.action_description,
            &format!(
                "{} {} next {}",
                c.status.as_str(),
                c.schedule.as_deref().unwrap_or("once"),
                c.when()
            ),
        );
    }
    section.print();
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn task_arguments() {
        let (title, task_type, priority) =
            parse_task_args(&args(&["-t", "research", "compare", "vps", "prices", "--priority", "4"])).unwrap();
        assert_eq!(title, "compare vps prices");
        assert_eq!(task_type, TaskType::Research);
        assert_eq!(priority, 4);
        assert!(parse_task_args(&args(&["--priority"])).is_err());
        assert!(parse_task_args(&[]).is_err());
    }

    #[tokio::test]
    async fn tasks_added_offline_land_in_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        task_add(&config, &args(&["--type", "coding", "fix", "ci"])).await.unwrap();
        let task = ledger(&config).await.unwrap().next_queued().await.unwrap().unwrap();
        assert_eq!(task.title, "fix ci");
        assert_eq!(task.task_type, TaskType::Coding);
    }

    #[test]
    fn init_writes_a_loadable_config_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        init(&path).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(Config::load(&path).is_ok());
        init(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }
}
