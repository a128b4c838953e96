use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::blockers::BlockerMemory;
use crate::core::budget::BudgetTracker;
use crate::core::chat::{ChatPort, ChatProgress, LogChat};
use crate::core::commitments::{
    CommitmentScheduler, CommitmentStore, CronClock, DEFAULT_POLL_INTERVAL, PipelineCommitmentExecutor,
};
use crate::core::config::Config;
use crate::core::control::ControlHandler;
use crate::core::gates::GateRunner;
use crate::core::ledger::TaskLedger;
use crate::core::lifecycle::LifecycleManager;
use crate::core::llm::{BackendClient, MeteredModel, ModelClient, ModelTaskExecutor};
use crate::core::pipeline::{ChangePersistence, GitPersistence, NoPersistence, Pipeline};
use crate::core::scheduler::Scheduler;
use crate::core::store::Datastore;
use crate::core::terminal::{GuideSection, print_warn};
use crate::core::tools::ToolRegistry;
use crate::core::tools::builtins::{BrowserFetch, CodeEdit, ListDir, ReadFile, Shell, WebFetch, WriteFile};
use crate::core::worker::HeartbeatWorker;
use crate::core::workspace::GitWorkspace;
use crate::interfaces::telegram::{TelegramChat, TelegramInterface};
use crate::logging;

/// A panic anywhere turns into an orderly shutdown instead of a half-dead
/// daemon.
fn install_panic_hook(shutdown: Arc<Notify>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("Panic: {}", info);
        shutdown.notify_one();
        default_hook(info);
    }));
}

async fn wait_for_shutdown(panicked: Arc<Notify>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to register SIGHUP")?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            info!("Received Ctrl-C");
        }
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sighup.recv() => info!("Received SIGHUP"),
        _ = panicked.notified() => warn!("Shutting down after a panic"),
    }
    Ok(())
}

fn tool_registry(config: &Config, model: Arc<dyn ModelClient>) -> Result<ToolRegistry> {
    let root = config.work_root();
    let mut tools = ToolRegistry::new(Duration::from_secs(config.tools.timeout_secs));
    tools.register(Arc::new(WebFetch::new()?));
    tools.register(Arc::new(BrowserFetch::new(config.tools.browser_command.clone())));
    tools.register(Arc::new(Shell::new(root.clone())));
    tools.register(Arc::new(ReadFile::new(root.clone())));
    tools.register(Arc::new(WriteFile::new(root.clone())));
    tools.register(Arc::new(ListDir::new(root.clone())));
    tools.register(Arc::new(CodeEdit::new(Arc::new(ModelTaskExecutor::new(model, root)))));
    Ok(tools)
}

pub async fn run(config: Config) -> Result<()> {
    let log_tail = logging::init(&config.log_level);
    info!("Starting nightshift (data dir {:?})", config.data_dir);

    let tz = config.timezone()?;
    let store = Datastore::open(&config.data_dir).await?;
    let db = store.get_db();
    std::fs::create_dir_all(config.work_root())?;

    let budget = Arc::new(BudgetTracker::new(db.clone(), config.budget_settings()).await?);
    let backend: Arc<dyn ModelClient> = Arc::new(BackendClient::new(
        config.model_backend()?,
        config.model.model.clone(),
        config.tier_models()?,
        config.model.max_tokens,
    )?);
    let model: Arc<dyn ModelClient> = Arc::new(MeteredModel::new(backend, budget.clone()));

    let chat: Arc<dyn ChatPort> = match (config.chat.enabled, config.chat.authorized_chat_id) {
        (true, Some(chat_id)) => {
            let token = std::env::var(&config.chat.token_env)
                .with_context(|| format!("{} is not set", config.chat.token_env))?;
            Arc::new(TelegramChat::new(&token, chat_id))
        }
        _ => Arc::new(LogChat),
    };

    let persistence: Arc<dyn ChangePersistence> = match &config.workspace.repo_path {
        Some(repo) => Arc::new(GitPersistence::new(
            Arc::new(GitWorkspace::new(repo.clone())),
            GateRunner::new(Duration::from_secs(config.workspace.gate_timeout_secs)),
            config.workspace.branch.clone(),
        )),
        None => Arc::new(NoPersistence),
    };

    let ledger = Arc::new(TaskLedger::new(db.clone()));
    let pipeline = Arc::new(Pipeline::new(
        ledger.clone(),
        Arc::new(tool_registry(&config, model.clone())?),
        Arc::new(BlockerMemory::new(db.clone())),
        model.clone(),
        persistence,
        Arc::new(ChatProgress::new(chat.clone())),
    ));

    let interrupted = ledger.block_interrupted().await?;
    if !interrupted.is_empty() {
        let titles: Vec<&str> = interrupted.iter().map(|t| t.title.as_str()).collect();
        let text = format!(
            "⚠️ {} task(s) were interrupted by the last shutdown and are blocked: {}. Use /resume <id> to retry.",
            interrupted.len(),
            titles.join(", ")
        );
        if let Err(e) = chat.send(&text).await {
            warn!("Chat notification failed: {}", e);
        }
    }

    let cancel = CancellationToken::new();
    let commitments = Arc::new(CommitmentScheduler::new(
        Arc::new(CommitmentStore::new(db.clone(), tz)),
        Arc::new(PipelineCommitmentExecutor::new(
            pipeline.clone(),
            budget.clone(),
            cancel.child_token(),
        )),
        Arc::new(CronClock::new(tz)),
        chat.clone(),
        DEFAULT_POLL_INTERVAL,
    ));
    let heartbeat = Arc::new(Scheduler::new(config.active_hours()?, config.heartbeat_interval()));
    heartbeat.on_task(Arc::new(HeartbeatWorker::new(
        pipeline.clone(),
        budget.clone(),
        chat.clone(),
        cancel.child_token(),
    )));

    let mut lifecycle = LifecycleManager::new();
    lifecycle.register(commitments.clone());
    lifecycle.register(heartbeat.clone());
    if config.chat.enabled
        && let Some(chat_id) = config.chat.authorized_chat_id
    {
        let token = std::env::var(&config.chat.token_env)
            .with_context(|| format!("{} is not set", config.chat.token_env))?;
        let control = Arc::new(ControlHandler::new(
            ledger.clone(),
            budget.clone(),
            heartbeat.clone(),
            commitments.clone(),
            model.clone(),
            log_tail,
        ));
        lifecycle.register(Arc::new(TelegramInterface::new(token, chat_id, control)));
    } else {
        print_warn("Chat is disabled: progress goes to the log only.");
    }

    let panicked = Arc::new(Notify::new());
    install_panic_hook(panicked.clone());
    lifecycle.start_all().await?;

    GuideSection::new("nightshift is running")
        .status(
            "Active hours",
            &format!(
                "{:02}:00-{:02}:00 {}",
                config.schedule.active_start_hour, config.schedule.active_end_hour, tz
            ),
        )
        .status("Heartbeat", &format!("every {} min", config.schedule.heartbeat_minutes))
        .status("Workspace", &config.work_root().display().to_string())
        .blank()
        .text("Press Ctrl+C to stop.")
        .print();
    println!();

    let waited = wait_for_shutdown(panicked).await;
    info!("Shutting down");
    cancel.cancel();
    if let Err(e) = lifecycle.stop_all().await {
        warn!("Shutdown error: {}", e);
    }
    crate::core::terminal::print_goodbye();
    waited
}
