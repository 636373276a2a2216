//! Cron recurrence: 6-field expressions and next-fire computation.
//!
//! Fields: second minute hour day-of-month month day-of-week. Each field is
//! `*`, a literal, a list (`a,b,c`), a range (`a-b`), or a step (`*/n`,
//! `a-b/n`, `a/n`). Day-of-week accepts 0-7 with 7 normalised to 0
//! (Sunday). Day-of-month and day-of-week OR-combine when both are
//! restricted, matching conventional cron.
//!
//! All computation is UTC; there is no timezone handling by design.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

use crate::error::SpoolError;

/// Next-fire searches give up past this horizon and report the expression
/// as unsatisfiable (e.g. `0 0 0 30 2 *`).
const HORIZON_DAYS: i64 = 366 * 5;

/// The set of calendar values one field admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    /// Bitmask over 0..=59; bit v set means value v is admitted.
    allowed: u64,
    /// False when the field was written `*`. Only relevant for the
    /// day-of-month / day-of-week OR rule.
    restricted: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.allowed & (1 << value) != 0
    }
}

/// A parsed recurrence expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    second: FieldSet,
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
    source: String,
}

impl CronExpression {
    /// Parse a 6-field expression. Malformed fields and out-of-range values
    /// fail with `InvalidExpression`; nothing is persisted past this point.
    pub fn parse(expression: &str) -> Result<Self, SpoolError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(SpoolError::InvalidExpression(format!(
                "expected 6 fields (sec min hour dom month dow), got {}",
                fields.len()
            )));
        }

        Ok(Self {
            second: parse_field(fields[0], "second", 0, 59, false)?,
            minute: parse_field(fields[1], "minute", 0, 59, false)?,
            hour: parse_field(fields[2], "hour", 0, 23, false)?,
            day_of_month: parse_field(fields[3], "day-of-month", 1, 31, false)?,
            month: parse_field(fields[4], "month", 1, 12, false)?,
            day_of_week: parse_field(fields[5], "day-of-week", 0, 7, true)?,
            source: expression.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Does this instant (at whole-second resolution) satisfy every field?
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.second.contains(t.second())
            && self.minute.contains(t.minute())
            && self.hour.contains(t.hour())
            && self.month.contains(t.month())
            && self.day_matches(t.date_naive())
    }

    /// Day-of-month and day-of-week OR-combine when both are restricted.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_ok = self.day_of_month.contains(date.day());
        let dow_ok = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.day_of_month.restricted, self.day_of_week.restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// Earliest instant strictly after `after` satisfying every field.
    ///
    /// Classic field-wise candidate search: test the coarsest unsatisfied
    /// unit, advance the candidate to that unit's next boundary (resetting
    /// everything below), repeat. Bounded by the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, SpoolError> {
        use chrono::SubsecRound;

        let mut t = after.trunc_subsecs(0) + Duration::seconds(1);
        let horizon = after + Duration::days(HORIZON_DAYS);

        loop {
            if t > horizon {
                return Err(SpoolError::UnsatisfiableSchedule);
            }
            if !self.month.contains(t.month()) {
                t = start_of_next_month(t).ok_or(SpoolError::UnsatisfiableSchedule)?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = start_of_day(t) + Duration::days(1);
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t - Duration::minutes(t.minute() as i64)
                    - Duration::seconds(t.second() as i64)
                    + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t = t - Duration::seconds(t.second() as i64) + Duration::minutes(1);
                continue;
            }
            if !self.second.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Ok(t);
        }
    }
}

fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&t.date_naive().and_time(NaiveTime::MIN))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
}

fn parse_field(
    spec: &str,
    name: &str,
    min: u32,
    max: u32,
    dow: bool,
) -> Result<FieldSet, SpoolError> {
    let mut allowed: u64 = 0;
    let mut insert = |value: u32| {
        // Day-of-week 7 is an alias for Sunday.
        let value = if dow && value == 7 { 0 } else { value };
        allowed |= 1 << value;
    };

    if spec.is_empty() {
        return Err(SpoolError::InvalidExpression(format!("empty {name} field")));
    }

    for term in spec.split(',') {
        let (base, step) = match term.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    SpoolError::InvalidExpression(format!("bad step '{step}' in {name} field"))
                })?;
                if step == 0 {
                    return Err(SpoolError::InvalidExpression(format!(
                        "step 0 in {name} field"
                    )));
                }
                (base, Some(step))
            }
            None => (term, None),
        };

        let (lo, hi) = match base {
            "*" => (min, max),
            _ => match base.split_once('-') {
                Some((a, b)) => {
                    let a = parse_value(a, name, min, max)?;
                    let b = parse_value(b, name, min, max)?;
                    if a > b {
                        return Err(SpoolError::InvalidExpression(format!(
                            "reversed range {a}-{b} in {name} field"
                        )));
                    }
                    (a, b)
                }
                // A bare literal with a step means "from here to the top".
                None => {
                    let v = parse_value(base, name, min, max)?;
                    if step.is_some() { (v, max) } else { (v, v) }
                }
            },
        };

        let step = step.unwrap_or(1);
        let mut v = lo;
        while v <= hi {
            insert(v);
            v += step;
        }
    }

    Ok(FieldSet {
        allowed,
        restricted: spec != "*",
    })
}

fn parse_value(raw: &str, name: &str, min: u32, max: u32) -> Result<u32, SpoolError> {
    let value: u32 = raw.parse().map_err(|_| {
        SpoolError::InvalidExpression(format!("bad value '{raw}' in {name} field"))
    })?;
    if value < min || value > max {
        return Err(SpoolError::InvalidExpression(format!(
            "{name} value {value} out of range {min}-{max}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("*/5 * * * * *", "2026-03-01T12:00:02Z", "2026-03-01T12:00:05Z")]
    #[case("*/5 * * * * *", "2026-03-01T12:00:05Z", "2026-03-01T12:00:10Z")] // strictly after
    #[case("0 30 9 * * *", "2026-03-01T09:29:59Z", "2026-03-01T09:30:00Z")]
    #[case("0 30 9 * * *", "2026-03-01T10:00:00Z", "2026-03-02T09:30:00Z")] // hour carry into next day
    #[case("0 0 0 1 1 *", "2026-03-01T00:00:00Z", "2027-01-01T00:00:00Z")] // month carry into next year
    #[case("0 0 12 * * 1", "2026-03-05T00:00:00Z", "2026-03-09T12:00:00Z")] // next Monday
    #[case("0 0 12 * * 7", "2026-03-05T00:00:00Z", "2026-03-08T12:00:00Z")] // 7 == Sunday
    #[case("30 15 8,20 * * *", "2026-03-01T08:15:30Z", "2026-03-01T20:15:30Z")]
    #[case("0 0 0 29 2 *", "2026-01-01T00:00:00Z", "2028-02-29T00:00:00Z")] // waits for the leap year
    #[case("0-10/2 * * * * *", "2026-03-01T12:00:08Z", "2026-03-01T12:00:10Z")]
    #[case("0 */15 * * * *", "2026-03-01T12:46:00Z", "2026-03-01T13:00:00Z")]
    fn next_fire(#[case] expr: &str, #[case] from: &str, #[case] expected: &str) {
        let cron = CronExpression::parse(expr).unwrap();
        assert_eq!(cron.next_after(at(from)).unwrap(), at(expected));
    }

    #[test]
    fn result_is_strictly_later_and_satisfies_the_expression() {
        let cron = CronExpression::parse("15 0,30 6-18 * * *").unwrap();
        let mut t = at("2026-03-01T00:00:00Z");
        for _ in 0..50 {
            let next = cron.next_after(t).unwrap();
            assert!(next > t);
            assert!(cron.matches(next), "{next} does not satisfy the expression");
            t = next;
        }
    }

    #[test]
    fn dom_and_dow_or_combine_when_both_restricted() {
        // Fires on the 13th of the month OR on any Friday.
        let cron = CronExpression::parse("0 0 12 13 * 5").unwrap();
        // 2026-03-05 is a Thursday; the next hit is Friday the 6th.
        let first = cron.next_after(at("2026-03-05T13:00:00Z")).unwrap();
        assert_eq!(first, at("2026-03-06T12:00:00Z"));
        // From Saturday the 7th: the 13th (a Friday) comes before the next
        // non-13th Friday would even matter.
        let second = cron.next_after(at("2026-03-07T00:00:00Z")).unwrap();
        assert_eq!(second, at("2026-03-13T12:00:00Z"));
        // Sunday the 15th: next Friday is the 20th, well before the next 13th.
        let third = cron.next_after(at("2026-03-15T00:00:00Z")).unwrap();
        assert_eq!(third, at("2026-03-20T12:00:00Z"));
    }

    #[rstest]
    #[case("* * * * *")] // 5 fields
    #[case("* * * * * * *")] // 7 fields
    #[case("60 * * * * *")] // second out of range
    #[case("* * 24 * * *")] // hour out of range
    #[case("* * * 0 * *")] // day-of-month out of range
    #[case("* * * * 13 *")] // month out of range
    #[case("* * * * * 8")] // day-of-week out of range
    #[case("5-2 * * * * *")] // reversed range
    #[case("*/0 * * * * *")] // zero step
    #[case("a * * * * *")] // not a number
    #[case("1,,2 * * * * *")] // empty list entry
    fn rejects_malformed_expressions(#[case] expr: &str) {
        let err = CronExpression::parse(expr).unwrap_err();
        assert!(matches!(err, SpoolError::InvalidExpression(_)), "{expr}");
    }

    #[rstest]
    #[case("0 0 0 30 2 *")] // February 30th
    #[case("0 0 0 31 2,4 *")] // 31st of 30-day-or-shorter months
    fn impossible_dates_are_unsatisfiable(#[case] expr: &str) {
        let cron = CronExpression::parse(expr).unwrap();
        let err = cron.next_after(at("2026-01-01T00:00:00Z")).unwrap_err();
        assert!(matches!(err, SpoolError::UnsatisfiableSchedule));
    }

    #[test]
    fn every_second_fires_every_second() {
        let cron = CronExpression::parse("* * * * * *").unwrap();
        let t = at("2026-12-31T23:59:59Z");
        assert_eq!(cron.next_after(t).unwrap(), at("2027-01-01T00:00:00Z"));
    }
}
