//! Schedule expressions: presets and cron.

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::error::{EngineError, EngineResult};

/// Parsed schedule.
///
/// `@once` yields a single tick at the pipeline start. Everything else is
/// backed by a `cron` expression, evaluated in UTC.
#[derive(Debug, Clone)]
pub enum Schedule {
    Once,
    Cron {
        expression: String,
        schedule: cron::Schedule,
    },
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression() == other.expression()
    }
}

/// Preset name to a 6-field (seconds-first) cron expression.
fn preset(expression: &str) -> Option<&'static str> {
    match expression {
        "@hourly" => Some("0 0 * * * *"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@weekly" => Some("0 0 0 * * Sun"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        _ => None,
    }
}

impl Schedule {
    /// Parse a preset (`@daily`, ...) or a 5-field cron expression.
    ///
    /// Six and seven field expressions (with seconds, optional year) are
    /// passed to the cron parser unchanged.
    pub fn parse(expression: &str) -> EngineResult<Self> {
        let expression = expression.trim();
        if expression == "@once" {
            return Ok(Self::Once);
        }

        let cron_expr = match preset(expression) {
            Some(expr) => expr.to_string(),
            None if expression.starts_with('@') => {
                return Err(EngineError::Schedule(format!("unknown preset '{}'", expression)));
            }
            None => match expression.split_whitespace().count() {
                5 => format!("0 {}", expression),
                6 | 7 => expression.to_string(),
                n => {
                    return Err(EngineError::Schedule(format!(
                        "'{}' has {} fields, expected 5",
                        expression, n
                    )));
                }
            },
        };

        let schedule = cron::Schedule::from_str(&cron_expr)
            .map_err(|e| EngineError::Schedule(format!("'{}': {}", expression, e)))?;
        Ok(Self::Cron {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The expression as written.
    pub fn expression(&self) -> &str {
        match self {
            Self::Once => "@once",
            Self::Cron { expression, .. } => expression,
        }
    }

    /// First tick strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once => None,
            Self::Cron { schedule, .. } => schedule.after(&t).next(),
        }
    }

    /// Ticks `t` with `from <= t <= until`.
    ///
    /// For `@once`, `from` is the single tick.
    pub fn ticks_between(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        if from > until {
            return Vec::new();
        }
        match self {
            Self::Once => vec![from],
            Self::Cron { schedule, .. } => schedule
                .after(&(from - Duration::seconds(1)))
                .take_while(|t| *t <= until)
                .collect(),
        }
    }

    /// Most recent tick at or before `now`, not earlier than `from`.
    pub fn latest_tick(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.ticks_between(from, now).pop()
    }

    /// Ticks that should run now.
    ///
    /// Considers ticks from the start date (or strictly after the last run)
    /// up to `now`. With catchup every missed tick is returned, oldest first;
    /// without it only the most recent one.
    pub fn due_runs(
        &self,
        start_date: NaiveDate,
        last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        catchup: bool,
    ) -> Vec<DateTime<Utc>> {
        let start = start_of_day(start_date);
        if let Self::Once = self {
            return match last_run {
                None if start <= now => vec![start],
                _ => Vec::new(),
            };
        }

        let from = match last_run {
            Some(last) if last >= start => last + Duration::seconds(1),
            _ => start,
        };
        let mut ticks = self.ticks_between(from, now);
        if !catchup && ticks.len() > 1 {
            ticks = ticks.split_off(ticks.len() - 1);
        }
        ticks
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expression())
    }
}

/// Midnight UTC of a date.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}
