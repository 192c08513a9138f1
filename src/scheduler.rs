//! Recurring execution from schedule strings.
//!
//! Accepted forms, all in UTC:
//!
//! ```text
//! every 30 seconds            every minute          every 2 hours
//! every day at 12h30m         every 3 days at 8h:30m
//! every week day 1,5          every 2 weeks day 7 at 6h
//! every month day 1           every month day 5 at 8h:50m
//! ```
//!
//! Weekdays count from Monday (`1`) to Sunday (`7`). For the plain interval
//! forms `at` is an offset into each period, so `every hour at 15m` fires at
//! a quarter past every hour.

use crate::error::SpinError;
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as TimeDelta, NaiveDate, Utc};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static SCHEDULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^every\s+(?:(?P<n>\d*)\s*(?P<unit>second|minute|hour|day)s?|(?P<cn>\d*)\s*(?P<cal>week|month)s?\s+day\s+(?P<days>\d+(?:\s*,\s*\d+)*))(?:\s+at\s+(?P<at>\S+))?$",
    )
    .expect("schedule pattern")
});

static TIME_OF_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<h>\d+)h)?:?(?:(?P<m>\d+)m)?:?(?:(?P<s>\d+)s)?$").expect("time pattern")
});

/// Recurrence part of a schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Period {
    /// Every `n` units of `unit_secs` seconds.
    Interval { n: u32, unit_secs: i64 },
    /// Every `n` weeks on the listed weekdays (1 = Monday).
    Weeks { n: u32, days: Vec<u32> },
    /// Every `n` months on the listed days of the month.
    Months { n: u32, days: Vec<u32> },
}

/// A parsed schedule string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub period: Period,
    /// Offset into the period (interval forms) or time of day (calendar forms).
    pub at: Option<TimeDelta>,
}

fn count(raw: Option<&str>) -> Result<u32> {
    match raw.filter(|s| !s.is_empty()) {
        None => Ok(1),
        Some(s) => match s.parse::<u32>() {
            Ok(0) | Err(_) => Err(SpinError::Configuration(format!("invalid repeat count `{s}`")).into()),
            Ok(n) => Ok(n),
        },
    }
}

fn parse_at(raw: &str) -> Result<TimeDelta> {
    let invalid = || SpinError::Configuration(format!("invalid time `{raw}`, expected forms like 8h30m or 8h:30m"));
    let caps = TIME_OF_DAY.captures(raw).ok_or_else(invalid)?;
    if caps.name("h").is_none() && caps.name("m").is_none() && caps.name("s").is_none() {
        return Err(invalid().into());
    }
    let part = |name: &str| -> Result<i64> {
        caps.name(name)
            .map_or(Ok(0), |m| m.as_str().parse::<i64>().map_err(|_| invalid().into()))
    };
    Ok(TimeDelta::hours(part("h")?) + TimeDelta::minutes(part("m")?) + TimeDelta::seconds(part("s")?))
}

fn unit_seconds(unit: &str) -> i64 {
    match unit {
        "second" => 1,
        "minute" => 60,
        "hour" => 3600,
        _ => 86_400,
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

impl Schedule {
    /// Parse a schedule string.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] for strings outside the accepted
    /// forms, zero counts, weekdays outside 1..=7, month days outside
    /// 1..=31, or an `at` that does not fit inside the period.
    pub fn parse(text: &str) -> Result<Self> {
        let normalized = text.trim().to_ascii_lowercase();
        let caps = SCHEDULE
            .captures(&normalized)
            .ok_or_else(|| SpinError::Configuration(format!("unsupported schedule `{text}`")))?;
        let at = caps.name("at").map(|m| parse_at(m.as_str())).transpose()?;

        let (period, limit) = if let Some(unit) = caps.name("unit") {
            let unit_secs = unit_seconds(unit.as_str());
            let n = count(caps.name("n").map(|m| m.as_str()))?;
            (Period::Interval { n, unit_secs }, unit_secs)
        } else {
            let n = count(caps.name("cn").map(|m| m.as_str()))?;
            let days = caps
                .name("days")
                .map_or("", |m| m.as_str())
                .split(',')
                .map(|d| d.trim().parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SpinError::Configuration(format!("invalid day list in `{text}`: {e}")))?;
            let period = if caps.name("cal").is_some_and(|m| m.as_str() == "week") {
                if let Some(bad) = days.iter().find(|d| !(1..=7).contains(*d)) {
                    return Err(SpinError::Configuration(format!("weekday {bad} out of range 1..=7")).into());
                }
                Period::Weeks { n, days }
            } else {
                if let Some(bad) = days.iter().find(|d| !(1..=31).contains(*d)) {
                    return Err(SpinError::Configuration(format!("month day {bad} out of range 1..=31")).into());
                }
                Period::Months { n, days }
            };
            (period, 86_400)
        };
        if let Some(offset) = at
            && offset.num_seconds() >= limit
        {
            return Err(SpinError::Configuration(format!("`at` in `{text}` does not fit in the period")).into());
        }
        Ok(Self { period, at })
    }

    /// First fire time strictly after `after`, for a schedule started at `anchor`.
    ///
    /// Interval schedules count whole periods from `anchor` (aligned to the
    /// unit boundary when `at` is set); week and month schedules count
    /// periods from the week or month containing `anchor`.
    #[must_use]
    pub fn next_after(&self, anchor: DateTime<Utc>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let at = self.at.unwrap_or_else(TimeDelta::zero);
        match &self.period {
            Period::Interval { n, unit_secs } => {
                let step = i64::from(*n) * unit_secs;
                let start = match self.at {
                    None => anchor,
                    Some(offset) => {
                        let ts = anchor.timestamp();
                        DateTime::from_timestamp(ts - ts.rem_euclid(*unit_secs), 0)? + offset
                    }
                };
                if after < start {
                    return Some(start);
                }
                let elapsed = (after - start).num_seconds();
                Some(start + TimeDelta::seconds((elapsed / step + 1) * step))
            }
            Period::Weeks { n, days } => {
                let week_start = anchor.date_naive()
                    - TimeDelta::days(i64::from(anchor.weekday().num_days_from_monday()));
                let horizon = 7 * (i64::from(*n) + 1);
                (0..=horizon).find_map(|offset| {
                    let date = after.date_naive() + TimeDelta::days(offset);
                    let week = (date - week_start).num_days().div_euclid(7);
                    let fire = midnight(date) + at;
                    (days.contains(&date.weekday().number_from_monday())
                        && week.rem_euclid(i64::from(*n)) == 0
                        && fire > after)
                        .then_some(fire)
                })
            }
            Period::Months { n, days } => {
                let month_index = |d: NaiveDate| i64::from(d.year()) * 12 + i64::from(d.month0());
                let first = month_index(anchor.date_naive());
                let horizon = 31 * (i64::from(*n) + 1) * 2;
                (0..=horizon).find_map(|offset| {
                    let date = after.date_naive() + TimeDelta::days(offset);
                    let fire = midnight(date) + at;
                    (days.contains(&date.day())
                        && (month_index(date) - first).rem_euclid(i64::from(*n)) == 0
                        && fire > after)
                        .then_some(fire)
                })
            }
        }
    }
}

/// Cooperative stop flag shared between the scheduler loop and its owner.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type Callback = Box<dyn FnMut() -> Result<()> + Send>;

struct Job {
    label: String,
    schedule: Schedule,
    anchor: DateTime<Utc>,
    next: Option<DateTime<Utc>>,
    callback: Callback,
}

/// Owns `(schedule, callback)` pairs and runs due callbacks from one loop.
pub struct Scheduler {
    jobs: Vec<Job>,
    tick: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Scheduler {
    /// `tick` is how long the loop sleeps between checks.
    #[must_use]
    pub fn new(tick: Duration) -> Self {
        Self { jobs: Vec::new(), tick }
    }

    /// Register `callback` under a schedule string, anchored at the current time.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] if the schedule does not parse.
    pub fn add<F>(&mut self, label: &str, schedule: &str, callback: F) -> Result<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let schedule = Schedule::parse(schedule)?;
        self.add_at(label, schedule, Utc::now(), callback);
        Ok(())
    }

    /// Register `callback` with an explicit anchor time.
    pub fn add_at<F>(&mut self, label: &str, schedule: Schedule, anchor: DateTime<Utc>, callback: F)
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let next = schedule.next_after(anchor, anchor);
        tracing::info!(job = %label, next = ?next, "job scheduled");
        self.jobs.push(Job {
            label: label.to_string(),
            schedule,
            anchor,
            next,
            callback: Box::new(callback),
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Earliest pending fire time.
    #[must_use]
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.jobs.iter().filter_map(|j| j.next).min()
    }

    /// Run every job due at `now` once and reschedule it. A failing callback
    /// is logged and stays scheduled. Returns the number of callbacks run.
    pub fn run_pending(&mut self, now: DateTime<Utc>) -> usize {
        let mut ran = 0;
        for job in &mut self.jobs {
            let Some(due) = job.next else { continue };
            if due > now {
                continue;
            }
            tracing::debug!(job = %job.label, %due, "running job");
            if let Err(err) = (job.callback)() {
                tracing::error!(job = %job.label, error = %format!("{err:#}"), "scheduled job failed");
            }
            ran += 1;
            job.next = job.schedule.next_after(job.anchor, now.max(due));
        }
        ran
    }

    /// Loop until `stop` is raised.
    pub fn run(&mut self, stop: &StopSignal) {
        tracing::info!(jobs = self.jobs.len(), "scheduler started");
        while !stop.is_stopped() {
            self.run_pending(Utc::now());
            std::thread::sleep(self.tick);
        }
        tracing::info!("scheduler stopped");
    }
}
