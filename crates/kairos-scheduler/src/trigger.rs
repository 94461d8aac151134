use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use kairos_core::{config::parse_timezone, TriggerKind};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

const INTERVAL_FIELDS: [&str; 5] = ["seconds", "minutes", "hours", "days", "weeks"];
const DAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
/// Largest random delay added to a fire, whatever the job asks for.
pub const MAX_JITTER_SECS: u64 = 86_400;

/// Cron fields in expression order. `None` means unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronFields {
    pub second: Option<String>,
    pub minute: Option<String>,
    pub hour: Option<String>,
    pub day: Option<String>,
    pub month: Option<String>,
    /// 0 = Monday ... 6 = Sunday, or three-letter names.
    pub day_of_week: Option<String>,
    pub year: Option<String>,
}

/// Split `second minute hour day month day_of_week [year]`.
///
/// `*` and `?` become `None`. Field contents are checked later, when the
/// fields are compiled into a schedule.
pub fn parse_cron_expression(expression: &str) -> Result<CronFields> {
    let tokens: Vec<&str> = expression.split_whitespace().collect();
    if tokens.len() != 6 && tokens.len() != 7 {
        return Err(SchedulerError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: format!("expected 6 or 7 fields, got {}", tokens.len()),
        });
    }
    let field = |i: usize| {
        tokens
            .get(i)
            .filter(|t| **t != "*" && **t != "?")
            .map(|t| t.to_string())
    };
    Ok(CronFields {
        second: field(0),
        minute: field(1),
        hour: field(2),
        day: field(3),
        month: field(4),
        day_of_week: field(5),
        year: field(6),
    })
}

impl CronFields {
    /// Render as a seven-field expression for the `cron` crate.
    ///
    /// Unconstrained fields less significant than the least significant
    /// explicit field take their minimum; the rest stay `*`, so an expression
    /// with no explicit field fires every second. Day-of-week is
    /// translated from Monday-first numbering to the crate's Sunday-first one.
    pub fn to_schedule_expression(&self) -> Result<String> {
        let invalid = |reason: String| SchedulerError::InvalidCronExpression {
            expression: self.to_string(),
            reason,
        };

        let day_of_week = match &self.day_of_week {
            Some(dow) => Some(
                translate_day_of_week(dow)
                    .ok_or_else(|| invalid(format!("bad day_of_week {dow:?}")))?,
            ),
            None => None,
        };

        // most significant first, each with its minimum
        let ordered: [(Option<&str>, &str); 7] = [
            (self.year.as_deref(), "*"),
            (self.month.as_deref(), "1"),
            (self.day.as_deref(), "1"),
            (day_of_week.as_deref(), "*"),
            (self.hour.as_deref(), "0"),
            (self.minute.as_deref(), "0"),
            (self.second.as_deref(), "0"),
        ];
        let least_explicit = ordered.iter().rposition(|(v, _)| v.is_some());
        let [year, month, day, dow, hour, minute, second]: [&str; 7] =
            std::array::from_fn(|i| match ordered[i] {
                (Some(v), _) => v,
                (None, minimum) if least_explicit.is_some_and(|l| i > l) => minimum,
                (None, _) => "*",
            });
        Ok(format!("{second} {minute} {hour} {day} {month} {dow} {year}"))
    }

    pub fn to_schedule(&self) -> Result<cron::Schedule> {
        let expression = self.to_schedule_expression()?;
        cron::Schedule::from_str(&expression).map_err(|e| SchedulerError::InvalidCronExpression {
            expression: self.to_string(),
            reason: e.to_string(),
        })
    }
}

impl std::fmt::Display for CronFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "*".to_string());
        write!(
            f,
            "{} {} {} {} {} {} {}",
            show(&self.second),
            show(&self.minute),
            show(&self.hour),
            show(&self.day),
            show(&self.month),
            show(&self.day_of_week),
            show(&self.year)
        )
    }
}

fn day_index(token: &str) -> Option<usize> {
    if let Ok(n) = token.parse::<usize>() {
        return (n < 7).then_some(n);
    }
    let lower = token.to_ascii_lowercase();
    DAY_NAMES.iter().position(|d| *d == lower)
}

/// Expand a Monday-first day-of-week field into the `cron` crate's
/// Sunday-first (1 = Sunday) numeric list.
fn translate_day_of_week(field: &str) -> Option<String> {
    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (day_index(a)?, day_index(b)?)
        } else {
            let d = day_index(range)?;
            (d, if step > 1 { 6 } else { d })
        };
        if lo > hi {
            return None;
        }
        days.extend((lo..=hi).step_by(step).map(|d| (d + 1) % 7 + 1));
    }
    let list: Vec<String> = days.iter().map(|d| d.to_string()).collect();
    Some(list.join(","))
}

/// `seconds minutes hours days weeks`; `*` counts as zero.
///
/// An all-zero interval runs every second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalFields {
    pub seconds: u64,
    pub minutes: u64,
    pub hours: u64,
    pub days: u64,
    pub weeks: u64,
}

impl IntervalFields {
    pub fn total_seconds(&self) -> u64 {
        self.seconds
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.hours.saturating_mul(3_600))
            .saturating_add(self.days.saturating_mul(86_400))
            .saturating_add(self.weeks.saturating_mul(604_800))
    }

    /// Length of one period in seconds, never less than one.
    pub fn period_seconds(&self) -> u64 {
        self.total_seconds().max(1)
    }
}

pub fn parse_interval_expression(expression: &str) -> Result<IntervalFields> {
    let tokens: Vec<&str> = expression.split_whitespace().collect();
    if tokens.len() != INTERVAL_FIELDS.len() {
        return Err(SchedulerError::InvalidIntervalExpression {
            expression: expression.to_string(),
            reason: format!("expected 5 fields, got {}", tokens.len()),
        });
    }

    let mut values = [0u64; 5];
    for (i, token) in tokens.iter().enumerate() {
        if *token == "*" {
            continue;
        }
        values[i] = token
            .parse::<u64>()
            .map_err(|_| SchedulerError::InvalidIntervalField {
                field: INTERVAL_FIELDS[i],
                value: token.to_string(),
            })?;
    }
    let [seconds, minutes, hours, days, weeks] = values;
    Ok(IntervalFields {
        seconds,
        minutes,
        hours,
        days,
        weeks,
    })
}

/// Parse an absolute instant. Values without an offset are read in `tz`.
pub fn parse_date_expression(expression: &str, tz: Tz) -> Result<DateTime<Utc>> {
    let raw = expression.trim();
    let invalid = || SchedulerError::InvalidDateExpression {
        expression: expression.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(invalid)?;

    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(invalid)
}

/// Serialisable trigger description, persisted with every registered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub kind: TriggerKind,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    pub timezone: String,
    /// Upper bound, in seconds, of the random delay added to each fire.
    #[serde(default)]
    pub jitter: Option<u64>,
}

/// Optional knobs shared by the interval and cron add paths.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Falls back to the engine's configured zone.
    pub timezone: Option<Tz>,
    pub jitter: Option<u64>,
}

#[derive(Debug, Clone)]
enum Rule {
    Cron(cron::Schedule),
    Interval {
        anchor: DateTime<Utc>,
        period_ms: i64,
    },
    Date(DateTime<Utc>),
}

/// A live trigger: computes fire instants for one job.
#[derive(Debug, Clone)]
pub struct Trigger {
    rule: Rule,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    tz: Tz,
    jitter: Option<u64>,
}

impl Trigger {
    /// Build the trigger described by `spec`.
    ///
    /// Interval triggers without a start are anchored one period after `now`
    /// and `once` triggers at `now`; the anchor is written back into `spec`
    /// so a rehydrated job keeps its phase.
    pub fn from_spec(spec: &mut TriggerSpec, now: DateTime<Utc>) -> Result<Self> {
        let tz = parse_timezone(&spec.timezone)?;
        let expression = || {
            spec.expression
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .ok_or(SchedulerError::MissingExpression { kind: spec.kind })
        };

        let rule = match spec.kind {
            TriggerKind::Cron => Rule::Cron(parse_cron_expression(expression()?)?.to_schedule()?),
            TriggerKind::Interval => {
                let fields = parse_interval_expression(expression()?)?;
                let too_long = || SchedulerError::InvalidIntervalExpression {
                    expression: spec.expression.clone().unwrap_or_default(),
                    reason: "interval too long".to_string(),
                };
                let period = i64::try_from(fields.period_seconds())
                    .ok()
                    .and_then(Duration::try_seconds)
                    .ok_or_else(too_long)?;
                let anchor = match spec.start {
                    Some(start) => start,
                    None => now.checked_add_signed(period).ok_or_else(too_long)?,
                };
                spec.start = Some(anchor);
                Rule::Interval {
                    anchor,
                    period_ms: period.num_milliseconds(),
                }
            }
            TriggerKind::Date => Rule::Date(parse_date_expression(expression()?, tz)?),
            TriggerKind::Once => {
                let at = spec.start.unwrap_or(now);
                spec.start = Some(at);
                Rule::Date(at)
            }
        };

        Ok(Self {
            rule,
            start: spec.start,
            end: spec.end,
            tz,
            jitter: spec.jitter.filter(|j| *j > 0),
        })
    }

    /// Next instant this trigger fires, or `None` once it is exhausted.
    ///
    /// With no previous fire the first instant at or after `now` is returned
    /// (a past one-shot instant is returned as is, so it still runs).
    /// Afterwards the first instant strictly after both `prev` and `now` is
    /// returned, which folds any run of missed fires into a single catch-up.
    pub fn next_fire_time(
        &self,
        prev: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let (bound, inclusive) = match prev {
            None => (now, true),
            Some(prev) => (now.max(prev), false),
        };
        let (bound, inclusive) = match self.start {
            Some(start) if start > bound => (start, true),
            _ => (bound, inclusive),
        };

        let next = match &self.rule {
            Rule::Date(at) => prev.is_none().then_some(*at),
            Rule::Interval { anchor, period_ms } => next_tick(*anchor, *period_ms, bound, inclusive),
            Rule::Cron(schedule) => {
                // `after` is exclusive on whole seconds
                let from = if inclusive {
                    bound - Duration::milliseconds(1)
                } else {
                    bound
                };
                schedule
                    .after(&from.with_timezone(&self.tz))
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }?;

        if self.end.is_some_and(|end| next > end) {
            return None;
        }
        Some(self.apply_jitter(next))
    }

    fn apply_jitter(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let Some(max) = self.jitter else {
            return at;
        };
        let delay = fastrand::u64(0..=max.min(MAX_JITTER_SECS));
        i64::try_from(delay)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|d| at.checked_add_signed(d))
            .unwrap_or(at)
    }
}

/// First grid point `anchor + k * period` at or after `bound`. `None` when
/// it falls outside the representable range.
fn next_tick(
    anchor: DateTime<Utc>,
    period_ms: i64,
    bound: DateTime<Utc>,
    inclusive: bool,
) -> Option<DateTime<Utc>> {
    let elapsed = (bound - anchor).num_milliseconds();
    if elapsed < 0 || (elapsed == 0 && inclusive) {
        return Some(anchor);
    }
    let mut k = elapsed / period_ms;
    if !(inclusive && elapsed % period_ms == 0) {
        k += 1;
    }
    let offset = Duration::try_milliseconds(k.checked_mul(period_ms)?)?;
    anchor.checked_add_signed(offset)
}
