//! Timer calculator: ISO 8601 durations, dates and repeating cycles to
//! absolute fire timestamps (epoch ms).
//!
//! All functions are pure; "now" is always passed in by the caller.

use chrono::{DateTime, Days, Months, NaiveDateTime, TimeZone, Utc};
use nom::{
    branch::alt,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, recognize},
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};

use crate::error::TimerSpecError;
use crate::types::{TimerDefinition, Timestamp};

/// Upper bound on the number of timestamps a single cycle may expand to.
pub const MAX_CYCLE_FIRES: usize = 10_000;

/// Parsed `PnYnMnWnDTnHnMnS` duration. Months and years stay calendar units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsoDuration {
    pub months: u32,
    pub days: u64,
    pub millis: u64,
}

impl IsoDuration {
    pub fn parse(spec: &str) -> Result<Self, TimerSpecError> {
        let trimmed = spec.trim();
        let (_, fields) = all_consuming(duration)(trimmed)
            .map_err(|_| TimerSpecError::new(spec, "not an ISO 8601 duration"))?;
        let DurationFields {
            years,
            months,
            weeks,
            days,
            time,
        } = fields;

        if let Some((None, None, None)) = time {
            return Err(TimerSpecError::new(spec, "'T' must be followed by a time component"));
        }
        let (hours, minutes, seconds) = time.unwrap_or_default();

        let months = years
            .unwrap_or(0)
            .checked_mul(12)
            .and_then(|m| m.checked_add(months.unwrap_or(0)))
            .and_then(|m| u32::try_from(m).ok())
            .ok_or_else(|| TimerSpecError::new(spec, "month count overflows"))?;
        let days = weeks
            .unwrap_or(0)
            .checked_mul(7)
            .and_then(|d| d.checked_add(days.unwrap_or(0)))
            .ok_or_else(|| TimerSpecError::new(spec, "day count overflows"))?;
        let millis = hours
            .unwrap_or(0)
            .checked_mul(3_600_000)
            .and_then(|ms| ms.checked_add(minutes.unwrap_or(0).checked_mul(60_000)?))
            .and_then(|ms| ms.checked_add(seconds.unwrap_or(0)))
            .ok_or_else(|| TimerSpecError::new(spec, "time component overflows"))?;

        let parsed = Self {
            months,
            days,
            millis,
        };
        if parsed.is_zero() {
            return Err(TimerSpecError::new(spec, "duration must be strictly positive"));
        }
        Ok(parsed)
    }

    pub fn is_zero(&self) -> bool {
        self.months == 0 && self.days == 0 && self.millis == 0
    }

    /// Add this duration to an instant; `None` on calendar overflow.
    pub fn add_to(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let at = if self.months > 0 {
            at.checked_add_months(Months::new(self.months))?
        } else {
            at
        };
        let at = if self.days > 0 {
            at.checked_add_days(Days::new(self.days))?
        } else {
            at
        };
        at.checked_add_signed(chrono::Duration::milliseconds(
            i64::try_from(self.millis).ok()?,
        ))
    }
}

struct DurationFields {
    years: Option<u64>,
    months: Option<u64>,
    weeks: Option<u64>,
    days: Option<u64>,
    time: Option<(Option<u64>, Option<u64>, Option<u64>)>,
}

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse::<u64>)(input)
}

fn component<'a>(unit: char) -> impl FnMut(&'a str) -> IResult<&'a str, u64> {
    terminated(number, char(unit))
}

/// Seconds with an optional fraction, returned in milliseconds.
fn seconds_ms(input: &str) -> IResult<&str, u64> {
    map_res(
        terminated(
            recognize(pair(digit1, opt(pair(alt((char('.'), char(','))), digit1)))),
            char('S'),
        ),
        |text: &str| {
            let text = text.replace(',', ".");
            text.parse::<f64>()
                .map(|secs| (secs * 1000.0).round() as u64)
        },
    )(input)
}

fn duration(input: &str) -> IResult<&str, DurationFields> {
    let (input, (years, months, weeks, days, time)) = preceded(
        char('P'),
        tuple((
            opt(component('Y')),
            opt(component('M')),
            opt(component('W')),
            opt(component('D')),
            opt(preceded(
                char('T'),
                tuple((opt(component('H')), opt(component('M')), opt(seconds_ms))),
            )),
        )),
    )(input)?;
    Ok((
        input,
        DurationFields {
            years,
            months,
            weeks,
            days,
            time,
        },
    ))
}

fn from_ms(spec: &str, ms: Timestamp) -> Result<DateTime<Utc>, TimerSpecError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| TimerSpecError::new(spec, format!("timestamp {ms} out of range")))
}

/// `now + duration`, in epoch milliseconds.
pub fn calc_duration(now: Timestamp, spec: &str) -> Result<Timestamp, TimerSpecError> {
    let duration = IsoDuration::parse(spec)?;
    let start = from_ms(spec, now)?;
    duration
        .add_to(start)
        .map(|at| at.timestamp_millis())
        .ok_or_else(|| TimerSpecError::new(spec, "fire time out of range"))
}

/// Absolute timestamp of an ISO 8601 date-time; no offset means UTC.
pub fn calc_date(spec: &str) -> Result<Timestamp, TimerSpecError> {
    let trimmed = spec.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(at.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    Err(TimerSpecError::new(spec, "not an ISO 8601 date-time"))
}

/// Parsed `R[n]/<duration>[/<end>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleSpec {
    /// `None` = unbounded (`R/…`).
    pub repetitions: Option<i64>,
    pub interval: IsoDuration,
    pub end: Option<Timestamp>,
}

impl CycleSpec {
    pub fn parse(spec: &str) -> Result<Self, TimerSpecError> {
        let parts: Vec<&str> = spec.trim().split('/').collect();
        let (repeat, interval, end) = match parts.as_slice() {
            [repeat, interval] => (*repeat, *interval, None),
            [repeat, interval, end] => (*repeat, *interval, Some(*end)),
            _ => {
                return Err(TimerSpecError::new(
                    spec,
                    "expected R<n>/<duration> or R<n>/<duration>/<end>",
                ))
            }
        };

        let count = repeat
            .strip_prefix('R')
            .ok_or_else(|| TimerSpecError::new(spec, "cycle must start with 'R'"))?;
        let repetitions = if count.is_empty() {
            None
        } else {
            Some(
                count
                    .parse::<i64>()
                    .map_err(|_| TimerSpecError::new(spec, "invalid repetition count"))?,
            )
        };
        let interval = IsoDuration::parse(interval)?;
        let end = end.map(calc_date).transpose()?;

        Ok(Self {
            repetitions,
            interval,
            end,
        })
    }

    /// `R/<duration>` without an end date: only the next fire time is known.
    pub fn is_open_ended(&self) -> bool {
        self.repetitions.is_none() && self.end.is_none()
    }

    pub fn fire_times(&self, spec: &str, now: Timestamp) -> Result<Vec<Timestamp>, TimerSpecError> {
        let limit = match (self.repetitions, self.end) {
            (Some(n), _) if n <= 0 => return Ok(Vec::new()),
            (Some(n), _) => usize::try_from(n).unwrap_or(usize::MAX),
            (None, Some(_)) => usize::MAX,
            (None, None) => 1,
        };
        if matches!(self.end, Some(end) if end < now) {
            return Ok(Vec::new());
        }

        let mut fires = Vec::new();
        let mut cursor = from_ms(spec, now)?;
        while fires.len() < limit {
            if fires.len() == MAX_CYCLE_FIRES {
                tracing::warn!(
                    spec,
                    cap = MAX_CYCLE_FIRES,
                    "timer cycle truncated at maximum fire count"
                );
                break;
            }
            cursor = self
                .interval
                .add_to(cursor)
                .ok_or_else(|| TimerSpecError::new(spec, "fire time out of range"))?;
            let at = cursor.timestamp_millis();
            if matches!(self.end, Some(end) if at > end) {
                break;
            }
            fires.push(at);
        }
        Ok(fires)
    }
}

/// Fire timestamps of a repeating cycle, starting at `now + interval`.
pub fn calc_cycle(now: Timestamp, spec: &str) -> Result<Vec<Timestamp>, TimerSpecError> {
    CycleSpec::parse(spec)?.fire_times(spec, now)
}

/// Fire plan of a timer definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerSchedule {
    pub fire_at: Vec<Timestamp>,
    /// Caller must compute the next fire time again after each firing.
    pub rearm: bool,
}

impl TimerDefinition {
    pub fn spec(&self) -> &str {
        match self {
            TimerDefinition::Duration(spec)
            | TimerDefinition::Date(spec)
            | TimerDefinition::Cycle(spec) => spec,
        }
    }

    pub fn schedule(&self, now: Timestamp) -> Result<TimerSchedule, TimerSpecError> {
        match self {
            TimerDefinition::Duration(spec) => Ok(TimerSchedule {
                fire_at: vec![calc_duration(now, spec)?],
                rearm: false,
            }),
            TimerDefinition::Date(spec) => Ok(TimerSchedule {
                fire_at: vec![calc_date(spec)?],
                rearm: false,
            }),
            TimerDefinition::Cycle(spec) => {
                let cycle = CycleSpec::parse(spec)?;
                Ok(TimerSchedule {
                    fire_at: cycle.fire_times(spec, now)?,
                    rearm: cycle.is_open_ended(),
                })
            }
        }
    }

    /// Syntax check used at deployment.
    pub fn validate(&self) -> Result<(), TimerSpecError> {
        match self {
            TimerDefinition::Duration(spec) => IsoDuration::parse(spec).map(|_| ()),
            TimerDefinition::Date(spec) => calc_date(spec).map(|_| ()),
            TimerDefinition::Cycle(spec) => CycleSpec::parse(spec).map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: Timestamp = 1_365_525_248_000;

    #[test]
    fn duration_minutes() {
        assert_eq!(calc_duration(T0, "PT1M").unwrap(), T0 + 60_000);
    }

    #[test]
    fn duration_mixed_time_components() {
        assert_eq!(
            calc_duration(T0, "PT2H1M10S").unwrap(),
            T0 + 2 * 3_600_000 + 60_000 + 10_000
        );
    }

    #[test]
    fn duration_days_weeks_and_fraction() {
        assert_eq!(calc_duration(T0, "P1D").unwrap(), T0 + 86_400_000);
        assert_eq!(calc_duration(T0, "P1W").unwrap(), T0 + 7 * 86_400_000);
        assert_eq!(calc_duration(T0, "PT1.5S").unwrap(), T0 + 1_500);
        assert_eq!(
            calc_duration(T0, "P1DT1H").unwrap(),
            T0 + 86_400_000 + 3_600_000
        );
    }

    #[test]
    fn duration_months_are_calendar_months() {
        // 2013-01-31 + P1M clamps to the end of February.
        let jan_31 = calc_date("2013-01-31T00:00:00Z").unwrap();
        let feb_28 = calc_date("2013-02-28T00:00:00Z").unwrap();
        assert_eq!(calc_duration(jan_31, "P1M").unwrap(), feb_28);
    }

    #[test]
    fn duration_rejects_zero_and_garbage() {
        for bad in ["PT0S", "P", "PT", "1M", "PT1X", "-PT1M", "P1H", ""] {
            assert!(calc_duration(T0, bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn date_with_zone() {
        assert_eq!(calc_date("2013-04-09T16:34:08Z").unwrap(), 1_365_525_248_000);
        assert_eq!(
            calc_date("2013-04-09T18:34:08+02:00").unwrap(),
            1_365_525_248_000
        );
        assert_eq!(calc_date("2013-04-09T16:34:08").unwrap(), 1_365_525_248_000);
        assert!(calc_date("yesterday").is_err());
    }

    #[test]
    fn bounded_cycle() {
        let fires = calc_cycle(T0, "R5/PT1M").unwrap();
        assert_eq!(fires.len(), 5);
        for (k, at) in fires.iter().enumerate() {
            assert_eq!(*at, T0 + 60_000 * (k as i64 + 1));
        }
    }

    #[test]
    fn unbounded_cycle_yields_next_fire_only() {
        assert_eq!(calc_cycle(T0, "R/PT1M").unwrap(), vec![T0 + 60_000]);
        let schedule = TimerDefinition::Cycle("R/PT1M".into()).schedule(T0).unwrap();
        assert!(schedule.rearm);
    }

    #[test]
    fn cycle_until_end_date_is_inclusive() {
        // End exactly on the third step.
        let fires = calc_cycle(T0, "R/PT1M/2013-04-09T16:37:08Z").unwrap();
        assert_eq!(fires, vec![T0 + 60_000, T0 + 120_000, T0 + 180_000]);
        let schedule = TimerDefinition::Cycle("R/PT1M/2013-04-09T16:37:08Z".into())
            .schedule(T0)
            .unwrap();
        assert!(!schedule.rearm);
    }

    #[test]
    fn cycle_bounded_by_both_count_and_end() {
        let fires = calc_cycle(T0, "R2/PT1M/2013-04-09T16:37:08Z").unwrap();
        assert_eq!(fires.len(), 2);
    }

    #[test]
    fn cycle_edge_cases_are_empty() {
        assert!(calc_cycle(T0, "R0/PT1M").unwrap().is_empty());
        assert!(calc_cycle(T0, "R-3/PT1M").unwrap().is_empty());
        assert!(calc_cycle(T0, "R/PT1M/2000-01-01T00:00:00Z")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn cycle_rejects_malformed() {
        for bad in ["5/PT1M", "R5", "Rx/PT1M", "R5/PT0S", "R5/PT1M/never"] {
            assert!(calc_cycle(T0, bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn huge_cycle_is_capped() {
        let fires = calc_cycle(T0, "R/PT1S/2100-01-01T00:00:00Z").unwrap();
        assert_eq!(fires.len(), MAX_CYCLE_FIRES);
    }
}
