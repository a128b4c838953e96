//! Heartbeat: a recurring timer that only does work inside the active-hours
//! window, and never overlaps itself.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::core::lifecycle::Module;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15 * 60);

/// Work done on each heartbeat inside active hours.
#[async_trait]
pub trait HeartbeatTask: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// `start == end` means always active; `start > end` wraps past midnight.
pub fn is_within_active_hours(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        true
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveHours {
    pub tz: Tz,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl ActiveHours {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = at.with_timezone(&self.tz).hour();
        is_within_active_hours(hour, self.start_hour, self.end_hour)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    OutsideWindow,
    Paused,
    /// The previous run is still going; this tick is dropped.
    Busy,
    /// No task registered.
    Idle,
    Ran,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub paused: bool,
    pub busy: bool,
    pub in_window: bool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    hours: ActiveHours,
    task: StdMutex<Option<Arc<dyn HeartbeatTask>>>,
    in_flight: AtomicBool,
    paused: AtomicBool,
}

impl Inner {
    async fn tick_at(&self, now: DateTime<Utc>) -> TickOutcome {
        if !self.hours.contains(now) {
            debug!("Heartbeat outside active hours, skipping");
            return TickOutcome::OutsideWindow;
        }
        if self.paused.load(Ordering::SeqCst) {
            debug!("Heartbeat paused, skipping");
            return TickOutcome::Paused;
        }
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(task) = task else {
            return TickOutcome::Idle;
        };
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Heartbeat dropped: previous run still in progress");
            return TickOutcome::Busy;
        }
        let _guard = InFlight(&self.in_flight);

        match task.run().await {
            Ok(()) => TickOutcome::Ran,
            Err(e) => {
                error!("Heartbeat task failed: {:#}", e);
                TickOutcome::Failed
            }
        }
    }
}

pub struct Scheduler {
    inner: Arc<Inner>,
    interval: Duration,
    jobs: Mutex<Option<JobScheduler>>,
}

impl Scheduler {
    pub fn new(hours: ActiveHours, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                hours,
                task: StdMutex::new(None),
                in_flight: AtomicBool::new(false),
                paused: AtomicBool::new(false),
            }),
            interval,
            jobs: Mutex::new(None),
        }
    }

    pub fn on_task(&self, task: Arc<dyn HeartbeatTask>) {
        *self.inner.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.store(paused, Ordering::SeqCst);
        info!("Heartbeat {}", if paused { "paused" } else { "unpaused" });
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickOutcome {
        self.inner.tick_at(now).await
    }

    pub async fn tick(&self) -> TickOutcome {
        self.tick_at(Utc::now()).await
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.jobs.lock().await.is_some(),
            paused: self.inner.paused.load(Ordering::SeqCst),
            busy: self.inner.in_flight.load(Ordering::SeqCst),
            in_window: self.inner.hours.contains(Utc::now()),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut slot = self.jobs.lock().await;
        if slot.is_some() {
            return Err(anyhow!("heartbeat is already armed"));
        }
        let jobs = JobScheduler::new().await?;
        let inner = self.inner.clone();
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.tick_at(Utc::now()).await;
            })
        })?;
        jobs.add(job).await?;
        jobs.start().await?;
        info!(
            "Heartbeat armed every {}s (active {:02}:00-{:02}:00 {})",
            self.interval.as_secs(),
            self.inner.hours.start_hour,
            self.inner.hours.end_hour,
            self.inner.hours.tz
        );
        *slot = Some(jobs);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(mut jobs) = self.jobs.lock().await.take() {
            jobs.shutdown().await?;
            info!("Heartbeat disarmed");
        }
        Ok(())
    }
}

#[async_trait]
impl Module for Scheduler {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn start(&self) -> Result<()> {
        Scheduler::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        Scheduler::stop(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Berlin;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl HeartbeatTask for Counting {
        async fn run(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail { Err(anyhow!("boom")) } else { Ok(()) }
        }
    }

    struct Gated {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl HeartbeatTask for Gated {
        async fn run(&self) -> Result<()> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn night_shift() -> Scheduler {
        Scheduler::new(
            ActiveHours {
                tz: Berlin,
                start_hour: 23,
                end_hour: 7,
            },
            DEFAULT_HEARTBEAT,
        )
    }

    fn counting(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[test]
    fn window_rules() {
        assert!(!is_within_active_hours(14, 23, 7));
        assert!(is_within_active_hours(23, 23, 7));
        assert!(is_within_active_hours(2, 23, 7));
        assert!(!is_within_active_hours(7, 23, 7));
        assert!(is_within_active_hours(9, 9, 17));
        assert!(!is_within_active_hours(17, 9, 17));
        assert!(is_within_active_hours(13, 5, 5));
    }

    #[tokio::test]
    async fn afternoon_tick_outside_night_window_does_nothing() {
        let scheduler = night_shift();
        let task = counting(false);
        scheduler.on_task(task.clone());

        // 14:00 in Berlin.
        let outcome = scheduler.tick_at(at("2026-03-10T13:00:00Z")).await;
        assert_eq!(outcome, TickOutcome::OutsideWindow);
        assert_eq!(task.calls.load(Ordering::SeqCst), 0);

        // 01:00 in Berlin.
        assert_eq!(scheduler.tick_at(at("2026-03-11T00:00:00Z")).await, TickOutcome::Ran);
        assert_eq!(task.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlapping_tick_is_dropped() {
        let scheduler = Arc::new(night_shift());
        let gated = Arc::new(Gated {
            started: Notify::new(),
            release: Notify::new(),
        });
        scheduler.on_task(gated.clone());
        let night = at("2026-03-11T00:00:00Z");

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.tick_at(night).await })
        };
        gated.started.notified().await;
        assert_eq!(scheduler.tick_at(night).await, TickOutcome::Busy);
        assert!(scheduler.status().await.busy);

        gated.release.notify_one();
        assert_eq!(first.await.unwrap(), TickOutcome::Ran);
        assert!(!scheduler.status().await.busy);
    }

    #[tokio::test]
    async fn failures_do_not_wedge_the_heartbeat() {
        let scheduler = night_shift();
        let task = counting(true);
        scheduler.on_task(task.clone());
        let night = at("2026-03-11T00:00:00Z");
        assert_eq!(scheduler.tick_at(night).await, TickOutcome::Failed);
        assert_eq!(scheduler.tick_at(night).await, TickOutcome::Failed);
        assert_eq!(task.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pause_and_idle() {
        let scheduler = night_shift();
        let night = at("2026-03-11T00:00:00Z");
        assert_eq!(scheduler.tick_at(night).await, TickOutcome::Idle);

        scheduler.on_task(counting(false));
        scheduler.set_paused(true);
        assert_eq!(scheduler.tick_at(night).await, TickOutcome::Paused);
        scheduler.set_paused(false);
        assert_eq!(scheduler.tick_at(night).await, TickOutcome::Ran);
    }

    #[tokio::test]
    async fn start_and_stop() {
        let scheduler = night_shift();
        scheduler.start().await.unwrap();
        assert!(scheduler.status().await.running);
        assert!(scheduler.start().await.is_err());
        scheduler.stop().await.unwrap();
        assert!(!scheduler.status().await.running);
        scheduler.stop().await.unwrap();
    }
}
