use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::chat::{ChatPort, error_report};
use crate::core::control::ControlHandler;
use crate::core::lifecycle::Module;

/// Outbound messages to the one authorized chat.
pub struct TelegramChat {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramChat {
    pub fn new(token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(token),
            chat_id: ChatId(chat_id),
        }
    }
}

#[async_trait]
impl ChatPort for TelegramChat {
    async fn send(&self, text: &str) -> Result<()> {
        self.bot.send_message(self.chat_id, text).await?;
        Ok(())
    }
}

/// Inbound side: routes messages from the authorized chat to the control
/// handler and drops everything else.
pub struct TelegramInterface {
    token: String,
    authorized_chat_id: i64,
    control: Arc<ControlHandler>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramInterface {
    pub fn new(token: String, authorized_chat_id: i64, control: Arc<ControlHandler>) -> Self {
        Self {
            token,
            authorized_chat_id,
            control,
            listener: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Module for TelegramInterface {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<()> {
        let bot = Bot::new(&self.token);
        let commands = vec![
            teloxide::types::BotCommand::new("help", "Show all commands"),
            teloxide::types::BotCommand::new("status", "Backlog, budget and scheduler state"),
            teloxide::types::BotCommand::new("tasks", "Recent tasks"),
            teloxide::types::BotCommand::new("add", "Queue a task"),
            teloxide::types::BotCommand::new("resume", "Requeue blocked or failed work"),
            teloxide::types::BotCommand::new("commitments", "Open commitments"),
            teloxide::types::BotCommand::new("cancel", "Cancel a commitment"),
            teloxide::types::BotCommand::new("budget", "Spend so far"),
            teloxide::types::BotCommand::new("logs", "Last log lines"),
            teloxide::types::BotCommand::new("pause", "Stop picking new work"),
            teloxide::types::BotCommand::new("unpause", "Resume picking work"),
        ];
        if let Err(e) = bot.set_my_commands(commands).await {
            warn!("Failed to set telegram bot commands: {}", e);
        }

        let authorized = self.authorized_chat_id;
        let control = self.control.clone();
        let handle = tokio::spawn(async move {
            teloxide::repl(bot, move |bot: Bot, msg: Message| {
                let control = control.clone();
                async move {
                    if msg.chat.id.0 != authorized {
                        warn!("Ignoring telegram message from unauthorized chat {}", msg.chat.id.0);
                        return Ok(());
                    }
                    let Some(text) = msg.text() else {
                        return Ok(());
                    };

                    let typing_bot = bot.clone();
                    let typing_chat = msg.chat.id;
                    let (typing_stop_tx, mut typing_stop_rx) = tokio::sync::oneshot::channel::<()>();
                    let typing_task = tokio::spawn(async move {
                        loop {
                            let _ = typing_bot
                                .send_chat_action(typing_chat, teloxide::types::ChatAction::Typing)
                                .await;
                            tokio::select! {
                                _ = &mut typing_stop_rx => break,
                                _ = tokio::time::sleep(Duration::from_secs(4)) => {}
                            }
                        }
                    });

                    let result = control.handle(text).await;
                    let _ = typing_stop_tx.send(());
                    let _ = typing_task.await;

                    let reply = match result {
                        Ok(reply) => reply,
                        Err(e) => {
                            error!("Control command failed: {:#}", e);
                            error_report("Command failed", None, &format!("{:#}", e))
                        }
                    };
                    if let Err(e) = bot.send_message(msg.chat.id, reply).await {
                        error!("Failed to send telegram reply: {}", e);
                    }
                    respond(())
                }
            })
            .await;
        });
        *self.listener.lock().await = Some(handle);
        info!("Telegram interface listening for chat {}", self.authorized_chat_id);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
            info!("Telegram interface stopped");
        }
        Ok(())
    }
}
