//! Finds promises about future work in model output. Pure pattern matching:
//! no model calls, and at most one commitment per response.

use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use regex::{Captures, Regex};
use std::sync::LazyLock;

use super::types::{CommitmentKind, ExecuteAt, NewCommitment};

const DEFAULT_MORNING_HOUR: u32 = 9;
const DEFAULT_EVENING_HOUR: u32 = 18;

static SENTENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[!?\n]+|\.(?:\s+|$)").unwrap());
static PROMISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:i['’]ll|i\s+will|i['’]m\s+going\s+to|i\s+am\s+going\s+to|let\s+me)\s+(.+)$").unwrap()
});
static FILLER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:(?:also|then|just|definitely|go\s+ahead\s+and)\s+)+").unwrap());

static DAILY_AT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:every\s*day|daily)\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").unwrap()
});
static EVERY_N_HOURS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bevery\s+(\d+)\s+(?:hours?|hrs?)\b").unwrap());
static EVERY_N_MINUTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bevery\s+(\d+)\s+(?:minutes?|mins?)\b").unwrap());
static EVERY_HOUR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:every\s+hour|hourly)\b").unwrap());
static EVERY_MORNING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bevery\s+morning\b").unwrap());
static EVERY_EVENING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bevery\s+(?:evening|night)\b").unwrap());
static EVERY_WEEK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:every\s+week|weekly)\b").unwrap());

static TOMORROW_AT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\btomorrow\s+(?:morning\s+)?at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").unwrap()
});
static TOMORROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\btomorrow(?:\s+morning)?\b").unwrap());
static IN_N_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bin\s+(\d+)\s+(minutes?|mins?|hours?|hrs?)\b").unwrap()
});
// A bare "at 7" is too ambiguous; require minutes or am/pm.
static AT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bat\s+(\d{1,2})(?::(\d{2})\s*(am|pm)?|\s*(am|pm))\b").unwrap()
});
static RIGHT_NOW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:right\s+now|right\s+away|immediately|now)\b").unwrap());

static ACTION_VERBS: &[&str] = &[
    "analyze", "analyse", "back", "book", "build", "check", "clean", "collect", "compile", "create",
    "deploy", "download", "draft", "email", "fetch", "find", "fix", "follow", "gather", "generate",
    "get", "investigate", "look", "make", "message", "monitor", "notify", "order", "ping", "post",
    "prepare", "publish", "read", "remind", "report", "research", "review", "run", "scan", "schedule",
    "send", "set", "share", "summarise", "summarize", "sync", "test", "text", "track", "translate",
    "update", "upload", "verify", "watch", "write",
];

struct Promise<'a> {
    sentence: &'a str,
    clause: &'a str,
}

fn promises(text: &str) -> Vec<Promise<'_>> {
    SENTENCE_RE
        .split(text)
        .filter_map(|sentence| {
            let clause = PROMISE_RE.captures(sentence)?.get(1)?.as_str();
            let rest = &clause[FILLER_RE.find(clause).map_or(0, |m| m.end())..];
            let verb = rest
                .split(|c: char| !c.is_alphabetic())
                .next()
                .unwrap_or("")
                .to_lowercase();
            ACTION_VERBS.contains(&verb.as_str()).then_some(Promise {
                sentence: sentence.trim(),
                clause: rest,
            })
        })
        .collect()
}

/// 12h/24h clock reading to (hour, minute) on a 24h clock.
fn clock(hour: &str, minute: Option<&str>, meridiem: Option<&str>) -> Option<(u32, u32)> {
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.map_or(Some(0), |m| m.parse().ok())?;
    if minute > 59 {
        return None;
    }
    let hour = match meridiem.map(str::to_lowercase).as_deref() {
        Some("am") if (1..=12).contains(&hour) => hour % 12,
        Some("pm") if (1..=12).contains(&hour) => hour % 12 + 12,
        Some(_) => return None,
        None if hour <= 23 => hour,
        None => return None,
    };
    Some((hour, minute))
}

fn cap<'t>(c: &Captures<'t>, i: usize) -> Option<&'t str> {
    c.get(i).map(|m| m.as_str())
}

/// What a sentence says about repetition.
#[derive(Debug, PartialEq)]
enum Recurrence<'a> {
    /// Five-field cron pattern plus the phrase it came from.
    Cron(String, &'a str),
    /// Repetition a five-field step cannot express, e.g. "every 90 minutes".
    Unschedulable,
    Once,
}

/// `*/n` only divides evenly within its field; a full cycle is the next
/// field up.
fn minutes_schedule(n: u64) -> Option<String> {
    match n {
        1..=59 => Some(format!("*/{} * * * *", n)),
        60 => Some("0 * * * *".to_string()),
        _ => None,
    }
}

fn hours_schedule(n: u64) -> Option<String> {
    match n {
        1..=23 => Some(format!("0 */{} * * *", n)),
        24 => Some("0 0 * * *".to_string()),
        _ => None,
    }
}

fn recurring(sentence: &str) -> Recurrence<'_> {
    let every_n: [(&LazyLock<Regex>, fn(u64) -> Option<String>); 2] = [
        (&EVERY_N_HOURS_RE, hours_schedule),
        (&EVERY_N_MINUTES_RE, minutes_schedule),
    ];
    if let Some(c) = DAILY_AT_RE.captures(sentence) {
        return match (cap(&c, 1).and_then(|h| clock(h, cap(&c, 2), cap(&c, 3))), cap(&c, 0)) {
            (Some((h, m)), Some(phrase)) => Recurrence::Cron(format!("{} {} * * *", m, h), phrase),
            _ => Recurrence::Unschedulable,
        };
    }
    for (re, schedule) in every_n {
        if let Some(c) = re.captures(sentence) {
            let parsed = cap(&c, 1).and_then(|n| n.parse::<u64>().ok()).and_then(schedule);
            return match (parsed, cap(&c, 0)) {
                (Some(cron), Some(phrase)) => Recurrence::Cron(cron, phrase),
                _ => Recurrence::Unschedulable,
            };
        }
    }
    let fixed: [(&LazyLock<Regex>, &str); 4] = [
        (&EVERY_HOUR_RE, "0 * * * *"),
        (&EVERY_MORNING_RE, "0 9 * * *"),
        (&EVERY_EVENING_RE, "0 18 * * *"),
        (&EVERY_WEEK_RE, "0 9 * * 1"),
    ];
    fixed
        .iter()
        .find_map(|(re, schedule)| re.find(sentence).map(|m| Recurrence::Cron(schedule.to_string(), m.as_str())))
        .unwrap_or(Recurrence::Once)
}

fn local(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&date.and_hms_opt(hour, minute, 0)?)
        .earliest()
        .map(|d| d.with_timezone(&Utc))
}

/// `now` plus N hours or minutes, or `None` when that leaves chrono's range.
fn offset_from(now: DateTime<Utc>, n: &str, unit: &str) -> Option<DateTime<Utc>> {
    let n: i64 = n.parse().ok()?;
    let offset = if unit.to_lowercase().starts_with('h') {
        TimeDelta::try_hours(n)?
    } else {
        TimeDelta::try_minutes(n)?
    };
    now.checked_add_signed(offset)
}

/// When a one-time promise should run, and the phrase that said so. `None`
/// when the stated time cannot be represented.
fn one_time<'a>(clause: &'a str, now: DateTime<Tz>) -> Option<(ExecuteAt, Option<&'a str>)> {
    let tz = now.timezone();
    let today = now.date_naive();
    let tomorrow = today.succ_opt().unwrap_or(today);

    if let Some(c) = TOMORROW_AT_RE.captures(clause)
        && let Some((h, m)) = cap(&c, 1).and_then(|h| clock(h, cap(&c, 2), cap(&c, 3)))
        && let Some(at) = local(tz, tomorrow, h, m)
    {
        return Some((ExecuteAt::At(at), cap(&c, 0)));
    }
    if let Some(found) = TOMORROW_RE.find(clause)
        && let Some(at) = local(tz, tomorrow, DEFAULT_MORNING_HOUR, 0)
    {
        return Some((ExecuteAt::At(at), Some(found.as_str())));
    }
    if let Some(c) = IN_N_RE.captures(clause) {
        let at = offset_from(now.with_timezone(&Utc), cap(&c, 1)?, cap(&c, 2)?)?;
        return Some((ExecuteAt::At(at), cap(&c, 0)));
    }
    if let Some(c) = AT_RE.captures(clause)
        && let Some((h, m)) = cap(&c, 1).and_then(|h| clock(h, cap(&c, 2), cap(&c, 3).or(cap(&c, 4))))
        && let Some(today_at) = local(tz, today, h, m)
    {
        let at = if today_at > now.with_timezone(&Utc) {
            Some(today_at)
        } else {
            local(tz, tomorrow, h, m)
        };
        if let Some(at) = at {
            return Some((ExecuteAt::At(at), cap(&c, 0)));
        }
    }
    if let Some(found) = RIGHT_NOW_RE.find(clause) {
        return Some((ExecuteAt::Now, Some(found.as_str())));
    }
    Some((ExecuteAt::Now, None))
}

fn describe(clause: &str, phrase: Option<&str>) -> String {
    let text = match phrase {
        Some(p) => clause.replacen(p, " ", 1),
        None => clause.to_string(),
    };
    let mut text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    loop {
        let trimmed = text
            .trim_end_matches([',', ';', ':', ' '])
            .trim_end_matches(" and")
            .trim_end_matches(" then")
            .to_string();
        if trimmed == text {
            break;
        }
        text = trimmed;
    }
    text
}

/// The first commitment promised in `text`, evaluated against `now` in the
/// daemon's timezone. Recurring phrasing wins over one-time phrasing. A
/// promise whose timing cannot be scheduled yields nothing rather than a
/// run at the wrong time.
pub fn detect(text: &str, now: DateTime<Tz>) -> Option<NewCommitment> {
    let found = promises(text);

    for promise in &found {
        match recurring(promise.sentence) {
            Recurrence::Cron(schedule, phrase) => {
                return Some(NewCommitment {
                    kind: CommitmentKind::Recurring { schedule },
                    promise_text: promise.sentence.to_string(),
                    action_description: describe(promise.clause, Some(phrase)),
                });
            }
            Recurrence::Unschedulable => return None,
            Recurrence::Once => {}
        }
    }

    let promise = found.first()?;
    let (execute_at, phrase) = one_time(promise.clause, now)?;
    Some(NewCommitment {
        kind: CommitmentKind::OneTime { execute_at },
        promise_text: promise.sentence.to_string(),
        action_description: describe(promise.clause, phrase),
    })
}
