//! Cron schedules and the single reconciliation job.
//!
//! Accepts classic five-field expressions (minute first) and six-field
//! expressions with a leading seconds field, with `*`, `a`, `a-b`,
//! lists, and `/step` on any of them. One [`ScheduledJob`] owns the
//! reconcile task; replacing its schedule re-arms the timer atomically
//! from the runner's point of view.

use crate::error::{ControllerError, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use futures_util::future::BoxFuture;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    expression: String,
    seconds: Vec<u32>,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_any: bool,
    dow_any: bool,
}

fn parse_field(expression: &str, field: &str, min: u32, max: u32) -> Result<Vec<u32>> {
    let mut values = BTreeSet::new();
    for part in field.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    ControllerError::invalid_schedule(expression, format!("bad step in '{}'", part))
                })?;
                if step == 0 {
                    return Err(ControllerError::invalid_schedule(
                        expression,
                        format!("zero step in '{}'", part),
                    ));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let stepped = part.contains('/');
        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let lo: u32 = a.parse().map_err(|_| {
                ControllerError::invalid_schedule(expression, format!("bad range in '{}'", part))
            })?;
            let hi: u32 = b.parse().map_err(|_| {
                ControllerError::invalid_schedule(expression, format!("bad range in '{}'", part))
            })?;
            (lo, hi)
        } else {
            let v: u32 = range_part.parse().map_err(|_| {
                ControllerError::invalid_schedule(expression, format!("bad value '{}'", part))
            })?;
            // `a/n` means "from a, every n" and runs to the field max.
            if stepped {
                (v, max)
            } else {
                (v, v)
            }
        };

        if lo < min || hi > max || lo > hi {
            return Err(ControllerError::invalid_schedule(
                expression,
                format!("'{}' outside {}..={}", part, min, max),
            ));
        }

        let mut v = lo;
        while v <= hi {
            values.insert(v);
            v += step;
        }
    }
    Ok(values.into_iter().collect())
}

impl FromStr for Schedule {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let (sec, min, hour, dom, month, dow) = match fields.as_slice() {
            [min, hour, dom, month, dow] => ("0", *min, *hour, *dom, *month, *dow),
            [sec, min, hour, dom, month, dow] => (*sec, *min, *hour, *dom, *month, *dow),
            other => {
                return Err(ControllerError::invalid_schedule(
                    trimmed,
                    format!("expected 5 or 6 fields, got {}", other.len()),
                ))
            }
        };

        // Day-of-week 7 is an alias for Sunday.
        let days_of_week = parse_field(trimmed, dow, 0, 7)?
            .into_iter()
            .map(|d| d % 7)
            .collect::<BTreeSet<u32>>()
            .into_iter()
            .collect();

        Ok(Self {
            expression: trimmed.to_string(),
            seconds: parse_field(trimmed, sec, 0, 59)?,
            minutes: parse_field(trimmed, min, 0, 59)?,
            hours: parse_field(trimmed, hour, 0, 23)?,
            days_of_month: parse_field(trimmed, dom, 1, 31)?,
            months: parse_field(trimmed, month, 1, 12)?,
            days_of_week,
            dom_any: dom == "*",
            dow_any: dow == "*",
        })
    }
}

impl Schedule {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, day_of_month: u32, day_of_week: u32) -> bool {
        let dom = self.days_of_month.contains(&day_of_month);
        let dow = self.days_of_week.contains(&day_of_week);
        // Standard cron: when both day fields are restricted, either
        // one matching fires the job.
        match (self.dom_any, self.dow_any) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    fn next_time_of_day(&self, not_before: (u32, u32, u32)) -> Option<(u32, u32, u32)> {
        for &h in &self.hours {
            for &m in &self.minutes {
                for &s in &self.seconds {
                    if (h, m, s) >= not_before {
                        return Some((h, m, s));
                    }
                }
            }
        }
        None
    }

    /// First fire time strictly after `after`. Scans at most four
    /// years of days, which covers any satisfiable date expression.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (after + ChronoDuration::seconds(1)).with_nanosecond(0)?;
        for _ in 0..(4 * 366) {
            if self.months.contains(&t.month())
                && self.day_matches(t.day(), t.weekday().num_days_from_sunday())
            {
                if let Some((h, m, s)) =
                    self.next_time_of_day((t.hour(), t.minute(), t.second()))
                {
                    let fire = t.date_naive().and_hms_opt(h, m, s)?;
                    return Some(Utc.from_utc_datetime(&fire));
                }
            }
            let midnight = (t.date_naive() + chrono::Days::new(1)).and_hms_opt(0, 0, 0)?;
            t = Utc.from_utc_datetime(&midnight);
        }
        None
    }
}

/// The job body: one reconcile pass.
pub type JobTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Exactly one scheduled job, with an atomically replaceable schedule.
pub struct ScheduledJob {
    schedule: Mutex<Schedule>,
    changed: tokio::sync::Notify,
    task: JobTask,
}

impl ScheduledJob {
    pub fn new(schedule: Schedule, task: JobTask) -> Arc<Self> {
        Arc::new(Self {
            schedule: Mutex::new(schedule),
            changed: tokio::sync::Notify::new(),
            task,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Schedule> {
        self.schedule
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The currently active expression.
    pub fn expression(&self) -> String {
        self.lock().expression().to_string()
    }

    /// Swap in a new schedule and re-arm the timer. `notify_one`
    /// stores a permit, so a runner that is between reading the
    /// schedule and parking on the timer still picks up the change.
    pub fn set_schedule(&self, schedule: Schedule) {
        debug!(expression = schedule.expression(), "replacing job schedule");
        *self.lock() = schedule;
        self.changed.notify_one();
    }

    /// Drive the job until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            let next = self.lock().next_after(Utc::now());
            let Some(next) = next else {
                warn!("schedule has no future fire time; waiting for a new expression");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = self.changed.notified() => continue,
                }
            };
            let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = self.changed.notified() => continue,
                _ = tokio::time::sleep(delay) => {
                    (self.task)().await;
                }
            }
        }
    }
}
