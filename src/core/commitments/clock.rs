use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;

/// Source of fire times for recurring commitments.
pub trait ScheduleClock: Send + Sync {
    /// First fire time of a five-field schedule strictly after `after`.
    fn next_fire(&self, schedule: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>>;
}

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

const WEEKDAYS: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Five-field (Sunday = 0) to the seconds-first form the `cron` crate reads,
/// where numeric weekdays start at Sunday = 1.
fn to_cron_expression(schedule: &str) -> Result<String> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(anyhow!("schedule '{}' must have five fields", schedule));
    }
    let weekday = if fields[4].contains('/') {
        fields[4].to_string()
    } else {
        NUMBER_RE
            .replace_all(fields[4], |c: &regex::Captures| {
                c[0].parse::<usize>()
                    .ok()
                    .and_then(|n| WEEKDAYS.get(n))
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| c[0].to_string())
            })
            .into_owned()
    };
    Ok(format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], weekday))
}

/// Real cron semantics evaluated in the daemon's timezone.
pub struct CronClock {
    tz: Tz,
}

impl CronClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl ScheduleClock for CronClock {
    fn next_fire(&self, schedule: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let expression = to_cron_expression(schedule)?;
        let parsed = cron::Schedule::from_str(&expression)
            .with_context(|| format!("invalid schedule '{}'", schedule))?;
        parsed
            .after(&after.with_timezone(&self.tz))
            .next()
            .map(|d| d.with_timezone(&Utc))
            .ok_or_else(|| anyhow!("schedule '{}' never fires", schedule))
    }
}
