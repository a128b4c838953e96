//! Runs commitments on time: one timer per recurring commitment plus a
//! periodic poll for due one-time commitments.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::CommitmentExecutor;
use super::clock::ScheduleClock;
use super::store::CommitmentStore;
use super::types::{Commitment, CommitmentStatus, CommitmentType, NewCommitment};
use crate::core::chat::{ChatPort, error_report};
use crate::core::lifecycle::Module;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    /// Not runnable right now (already running, retired, or missing).
    Skipped,
}

struct Armed {
    root: CancellationToken,
    timers: HashMap<String, CancellationToken>,
}

struct Inner {
    store: Arc<CommitmentStore>,
    executor: Arc<dyn CommitmentExecutor>,
    clock: Arc<dyn ScheduleClock>,
    chat: Arc<dyn ChatPort>,
    poll_interval: Duration,
    armed: Mutex<Option<Armed>>,
}

pub struct CommitmentScheduler {
    inner: Arc<Inner>,
}

impl Inner {
    async fn notify(&self, text: &str) {
        if let Err(e) = self.chat.send(text).await {
            warn!("Could not deliver commitment notice: {}", e);
        }
    }

    async fn execute(&self, id: &str) -> Result<RunOutcome> {
        let Some(commitment) = self.store.mark_executing(id).await? else {
            return Ok(RunOutcome::Skipped);
        };
        info!(
            "Executing commitment {}: {}",
            commitment.id, commitment.action_description
        );

        match self.executor.execute(&commitment).await {
            Ok(summary) => {
                self.store.mark_completed(id).await?;
                self.notify(&format!(
                    "✅ Kept my promise: {}\n{}",
                    commitment.action_description, summary
                ))
                .await;
                Ok(RunOutcome::Completed)
            }
            Err(e) => {
                let reason = e.to_string();
                self.store.mark_failed(id, &reason).await?;
                let what = format!("Commitment failed: {}", commitment.action_description);
                self.notify(&error_report(&what, None, &reason)).await;
                Ok(RunOutcome::Failed(reason))
            }
        }
    }

    async fn run_due(&self) -> Result<usize> {
        let due = self.store.get_due(Utc::now()).await?;
        let mut ran = 0;
        // Recurring commitments are driven by their own timers.
        for commitment in due
            .iter()
            .filter(|c| c.commitment_type == CommitmentType::OneTime)
        {
            if self.execute(&commitment.id).await? != RunOutcome::Skipped {
                ran += 1;
            }
        }
        Ok(ran)
    }

    /// Park a commitment whose schedule the clock rejects and tell the
    /// operator, so it is not left looking armed.
    async fn unschedulable(&self, commitment: &Commitment, reason: &str) -> Result<Commitment> {
        let failed = self.store.mark_unschedulable(&commitment.id, reason).await?;
        let what = format!("Commitment cannot be scheduled: {}", commitment.action_description);
        self.notify(&error_report(&what, None, reason)).await;
        Ok(failed.unwrap_or_else(|| commitment.clone()))
    }

    /// Whether a timer should stop for good after a skipped run.
    async fn retired(&self, id: &str) -> Result<bool> {
        Ok(match self.store.get(id).await? {
            None => true,
            Some(c) => matches!(
                c.status,
                CommitmentStatus::Cancelled | CommitmentStatus::Completed
            ),
        })
    }
}

fn spawn_timer(inner: Arc<Inner>, commitment: Commitment, token: CancellationToken) {
    let Some(schedule) = commitment.schedule.clone() else {
        return;
    };
    tokio::spawn(async move {
        loop {
            let next = match inner.clock.next_fire(&schedule, Utc::now()) {
                Ok(next) => next,
                Err(e) => {
                    error!("Commitment {} has an unusable schedule: {}", commitment.id, e);
                    if let Err(e) = inner.unschedulable(&commitment, &format!("{:#}", e)).await {
                        error!("Could not park commitment {}: {}", commitment.id, e);
                    }
                    return;
                }
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            match inner.execute(&commitment.id).await {
                Ok(RunOutcome::Skipped) => match inner.retired(&commitment.id).await {
                    Ok(true) => {
                        info!("Timer for commitment {} retired", commitment.id);
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Commitment {} lookup failed: {}", commitment.id, e),
                },
                Ok(_) => {}
                Err(e) => error!("Commitment {} run failed: {}", commitment.id, e),
            }
        }
    });
}

impl CommitmentScheduler {
    pub fn new(
        store: Arc<CommitmentStore>,
        executor: Arc<dyn CommitmentExecutor>,
        clock: Arc<dyn ScheduleClock>,
        chat: Arc<dyn ChatPort>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                clock,
                chat,
                poll_interval,
                armed: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CommitmentStore> {
        &self.inner.store
    }

    pub async fn is_running(&self) -> bool {
        self.inner.armed.lock().await.is_some()
    }

    pub async fn armed_count(&self) -> usize {
        self.inner
            .armed
            .lock()
            .await
            .as_ref()
            .map_or(0, |a| a.timers.len())
    }

    fn arm(&self, armed: &mut Armed, commitment: Commitment) {
        if armed.timers.contains_key(&commitment.id) {
            return;
        }
        let token = armed.root.child_token();
        armed.timers.insert(commitment.id.clone(), token.clone());
        spawn_timer(self.inner.clone(), commitment, token);
    }

    pub async fn start(&self) -> Result<()> {
        let mut slot = self.inner.armed.lock().await;
        if slot.is_some() {
            return Err(anyhow!("commitment scheduler is already running"));
        }
        self.inner.store.fail_interrupted().await?;

        let mut armed = Armed {
            root: CancellationToken::new(),
            timers: HashMap::new(),
        };
        for commitment in self.inner.store.list_open().await? {
            if commitment.commitment_type == CommitmentType::Recurring {
                self.arm(&mut armed, commitment);
            }
        }

        let inner = self.inner.clone();
        let poll_token = armed.root.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = poll_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.run_due().await {
                            error!("Commitment poll failed: {}", e);
                        }
                    }
                }
            }
        });

        info!(
            "Commitment scheduler started ({} recurring timer(s), poll every {}s)",
            armed.timers.len(),
            self.inner.poll_interval.as_secs()
        );
        *slot = Some(armed);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(armed) = self.inner.armed.lock().await.take() {
            armed.root.cancel();
            info!("Commitment scheduler stopped");
        }
        Ok(())
    }

    /// Store a detected commitment and, if the scheduler is running and the
    /// commitment recurs, arm its timer. A schedule the clock rejects leaves
    /// the commitment failed instead of armed.
    pub async fn register(&self, new: NewCommitment) -> Result<Commitment> {
        let commitment = self.inner.store.create(new).await?;
        let Some(schedule) = commitment.schedule.as_deref().filter(|_| commitment.is_recurring()) else {
            return Ok(commitment);
        };
        if let Err(e) = self.inner.clock.next_fire(schedule, Utc::now()) {
            return self.inner.unschedulable(&commitment, &format!("{:#}", e)).await;
        }
        if let Some(armed) = self.inner.armed.lock().await.as_mut() {
            self.arm(armed, commitment.clone());
        }
        Ok(commitment)
    }

    fn disarm(armed: &mut Armed, id: &str) {
        if let Some(token) = armed.timers.remove(id) {
            token.cancel();
        }
    }

    pub async fn cancel(&self, id: &str) -> Result<Option<Commitment>> {
        let cancelled = self.inner.store.cancel(id).await?;
        if let Some(armed) = self.inner.armed.lock().await.as_mut() {
            Self::disarm(armed, id);
        }
        Ok(cancelled)
    }

    pub async fn cancel_by_description(&self, text: &str) -> Result<Option<Commitment>> {
        let cancelled = self.inner.store.cancel_by_description(text).await?;
        if let Some(c) = &cancelled
            && let Some(armed) = self.inner.armed.lock().await.as_mut()
        {
            Self::disarm(armed, &c.id);
        }
        Ok(cancelled)
    }

    /// Run a single commitment now, regardless of its schedule.
    pub async fn execute(&self, id: &str) -> Result<RunOutcome> {
        self.inner.execute(id).await
    }

    /// One poll pass: run every due one-time commitment. Returns how many ran.
    pub async fn run_due(&self) -> Result<usize> {
        self.inner.run_due().await
    }
}

#[async_trait]
impl Module for CommitmentScheduler {
    fn name(&self) -> &str {
        "commitments"
    }

    async fn start(&self) -> Result<()> {
        CommitmentScheduler::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        CommitmentScheduler::stop(self).await
    }
}
