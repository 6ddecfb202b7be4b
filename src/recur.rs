//! RRULE parsing and candidate generation.
//!
//! Candidates are produced in local wall-clock time. Placing them onto a time
//! zone is left to the caller, so that a rule keeps its local time of day
//! across daylight saving transitions.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{bail, format_err, Context, Error};
use chrono::{
    DateTime, Datelike, Days, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Timelike,
    Utc, Weekday,
};
use itertools::{iproduct, Itertools};
use regex::Regex;

use crate::error::RecurrenceError;
use crate::timezone::Offseter;

/// The Gregorian calendar repeats every 400 years, which is this many days.
const CYCLE_DAYS: u64 = 146_097;

static BYDAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([+-]?[0-9]{1,2})?(MO|TU|WE|TH|FR|SA|SU)$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndCondition {
    Count(u64),
    /// Inclusive bound in floating local time.
    Until(NaiveDateTime),
    /// Inclusive bound on the whole day.
    UntilDate(NaiveDate),
    UntilUtc(DateTime<Utc>),
    Infinite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecurRule {
    pub frequency: Frequency,
    /// As written. Zero is accepted here and treated as one when iterating.
    pub interval: u32,
    pub end_condition: EndCondition,
    pub by_second: Vec<u8>,
    pub by_minute: Vec<u8>,
    pub by_hour: Vec<u8>,
    pub by_day: Vec<(Option<i8>, Weekday)>,
    pub by_month_day: Vec<i8>,
    pub by_year_day: Vec<i16>,
    pub by_week_number: Vec<i8>,
    pub by_month: Vec<u8>,
    pub by_set_pos: Vec<i16>,
    pub week_start: Weekday,
}

impl RecurRule {
    /// Iterate over the recurrence set starting at `dtstart`, which is always
    /// the first item.
    ///
    /// `offseter` resolves a UTC `UNTIL` into local time. Iteration also stops
    /// once a whole period starts at or after `horizon`.
    pub fn from_date(
        &self,
        dtstart: NaiveDateTime,
        offseter: &dyn Offseter,
        horizon: Option<NaiveDateTime>,
    ) -> RecurIter {
        let (max_count, until) = match self.end_condition {
            EndCondition::Count(c) => (Some(c), None),
            EndCondition::Until(t) => (None, Some(t)),
            EndCondition::UntilDate(d) => (None, d.and_hms_opt(23, 59, 59)),
            EndCondition::UntilUtc(t) => (None, Some(offseter.from_instance(t.into()))),
            EndCondition::Infinite => (None, None),
        };

        RecurIter {
            recur: self.clone(),
            dtstart,
            period: 0,
            queue: VecDeque::new(),
            count: 0,
            max_count,
            until,
            horizon,
            budget: None,
            started: false,
            done: false,
        }
    }

    fn interval(&self) -> u32 {
        self.interval.max(1)
    }

    /// The first instant of the `n`th period after the one holding `dtstart`.
    fn period_start(&self, dtstart: NaiveDateTime, n: u64) -> Option<NaiveDateTime> {
        let step = n.checked_mul(u64::from(self.interval()))?;
        let date = dtstart.date();
        let seconds =
            |unit: i64| Duration::try_seconds(i64::try_from(step).ok()?.checked_mul(unit)?);

        let start = match self.frequency {
            Frequency::Yearly => {
                NaiveDate::from_ymd_opt(date.year().checked_add(i32::try_from(step).ok()?)?, 1, 1)?
                    .and_hms_opt(0, 0, 0)?
            }
            Frequency::Monthly => date
                .with_day(1)?
                .checked_add_months(Months::new(u32::try_from(step).ok()?))?
                .and_hms_opt(0, 0, 0)?,
            Frequency::Weekly => get_start_of_week(self.week_start, date)
                .checked_add_days(Days::new(step.checked_mul(7)?))?
                .and_hms_opt(0, 0, 0)?,
            Frequency::Daily => date
                .checked_add_days(Days::new(step))?
                .and_hms_opt(0, 0, 0)?,
            Frequency::Hourly => date
                .and_hms_opt(dtstart.hour(), 0, 0)?
                .checked_add_signed(seconds(3600)?)?,
            Frequency::Minutely => date
                .and_hms_opt(dtstart.hour(), dtstart.minute(), 0)?
                .checked_add_signed(seconds(60)?)?,
            Frequency::Secondly => date
                .and_hms_opt(dtstart.hour(), dtstart.minute(), dtstart.second())?
                .checked_add_signed(seconds(1)?)?,
        };

        Some(start)
    }

    /// The index of the last period starting at or before `at`.
    fn period_index(&self, dtstart: NaiveDateTime, at: NaiveDateTime) -> Option<u64> {
        let first = self.period_start(dtstart, 0)?;
        if at < first {
            return None;
        }

        let months = |d: NaiveDateTime| i64::from(d.year()) * 12 + i64::from(d.month0());
        let units = match self.frequency {
            Frequency::Yearly => i64::from(at.year() - first.year()),
            Frequency::Monthly => months(at) - months(first),
            Frequency::Weekly => (at.date() - first.date()).num_days() / 7,
            Frequency::Daily => (at.date() - first.date()).num_days(),
            Frequency::Hourly => (at - first).num_hours(),
            Frequency::Minutely => (at - first).num_minutes(),
            Frequency::Secondly => (at - first).num_seconds(),
        };

        u64::try_from(units / i64::from(self.interval())).ok()
    }

    /// The index of the first period starting at or after `at`.
    fn first_period_from(&self, dtstart: NaiveDateTime, at: NaiveDateTime) -> Option<u64> {
        let n = self.period_index(dtstart, at).unwrap_or(0);
        if self.period_start(dtstart, n)? < at {
            n.checked_add(1)
        } else {
            Some(n)
        }
    }

    /// For rules finer than a day, the next time worth trying when the day,
    /// hour or minute of the period starting at `start` already rules it out.
    fn skip_barren(&self, start: NaiveDateTime, dtstart: NaiveDateTime) -> Option<NaiveDateTime> {
        if self.frequency > Frequency::Hourly {
            return None;
        }

        let date = start.date();
        if !self.day_matches(date, dtstart) {
            return date.succ_opt()?.and_hms_opt(0, 0, 0);
        }

        if !self.by_hour.is_empty() && !self.by_hour.contains(&(start.hour() as u8)) {
            return date
                .and_hms_opt(start.hour(), 0, 0)?
                .checked_add_signed(Duration::hours(1));
        }

        if self.frequency == Frequency::Secondly
            && !self.by_minute.is_empty()
            && !self.by_minute.contains(&(start.minute() as u8))
        {
            return date
                .and_hms_opt(start.hour(), start.minute(), 0)?
                .checked_add_signed(Duration::minutes(1));
        }

        None
    }

    /// Consecutive empty periods after which the rule is taken to be spent.
    /// A skipped day counts as one period.
    fn barren_limit(&self) -> u64 {
        match self.frequency {
            Frequency::Yearly => 400,
            Frequency::Monthly => 400 * 12,
            Frequency::Weekly => CYCLE_DAYS / 7,
            _ => CYCLE_DAYS,
        }
    }

    /// Every candidate in the period starting at `start`, sorted.
    fn expand_period(&self, start: NaiveDateTime, dtstart: NaiveDateTime) -> Vec<NaiveDateTime> {
        let days = self
            .period_days(start)
            .into_iter()
            .filter(|&day| self.day_matches(day, dtstart))
            .collect_vec();
        let times = self.expand_times(start, dtstart);

        let mut set: Vec<_> = iproduct!(days, times)
            .map(|(day, time)| day.and_time(time))
            .collect();
        set.sort();
        set.dedup();

        if self.by_set_pos.is_empty() {
            return set;
        }

        let len = set.len() as i64;
        self.by_set_pos
            .iter()
            .filter_map(|&pos| {
                let index = if pos > 0 {
                    i64::from(pos) - 1
                } else {
                    len + i64::from(pos)
                };
                usize::try_from(index).ok().and_then(|i| set.get(i).copied())
            })
            .sorted()
            .dedup()
            .collect()
    }

    /// The days a period covers, before any BYxxx filtering.
    fn period_days(&self, start: NaiveDateTime) -> Vec<NaiveDate> {
        let first = start.date();

        match self.frequency {
            Frequency::Yearly => {
                // Only walk the listed months when nothing else can pick a day
                // outside them.
                if !self.by_month.is_empty()
                    && self.by_week_number.is_empty()
                    && self.by_year_day.is_empty()
                {
                    self.by_month
                        .iter()
                        .sorted()
                        .dedup()
                        .filter_map(|&month| NaiveDate::from_ymd_opt(first.year(), month.into(), 1))
                        .flat_map(|month_start| days_until(month_start, next_month(month_start)))
                        .collect()
                } else {
                    let next_year = NaiveDate::from_ymd_opt(first.year() + 1, 1, 1);
                    days_until(first, next_year)
                }
            }
            Frequency::Monthly => days_until(first, next_month(first)),
            Frequency::Weekly => days_until(first, first.checked_add_days(Days::new(7))),
            _ => vec![first],
        }
    }

    fn day_matches(&self, day: NaiveDate, dtstart: NaiveDateTime) -> bool {
        if !self.by_month.is_empty() && !self.by_month.contains(&(day.month() as u8)) {
            return false;
        }

        match self.frequency {
            Frequency::Yearly => {
                if self.by_week_number.is_empty()
                    && self.by_year_day.is_empty()
                    && self.by_month_day.is_empty()
                    && self.by_day.is_empty()
                {
                    return day.day() == dtstart.day()
                        && (!self.by_month.is_empty() || day.month() == dtstart.month());
                }

                let scope = if self.by_month.is_empty() {
                    Scope::Year
                } else {
                    Scope::Month
                };

                let weekday_ok = if !self.by_day.is_empty() {
                    self.weekday_matches(day, scope)
                } else if !self.by_week_number.is_empty() {
                    day.weekday() == dtstart.weekday()
                } else {
                    true
                };

                self.week_number_matches(day)
                    && self.year_day_matches(day)
                    && self.month_day_matches(day)
                    && weekday_ok
            }
            Frequency::Monthly => {
                if self.by_day.is_empty() && self.by_month_day.is_empty() {
                    return day.day() == dtstart.day();
                }

                self.month_day_matches(day)
                    && (self.by_day.is_empty() || self.weekday_matches(day, Scope::Month))
            }
            Frequency::Weekly => {
                if self.by_day.is_empty() {
                    day.weekday() == dtstart.weekday()
                } else {
                    self.by_day.iter().any(|&(_, wd)| wd == day.weekday())
                }
            }
            _ => {
                self.year_day_matches(day)
                    && self.month_day_matches(day)
                    && (self.by_day.is_empty()
                        || self.by_day.iter().any(|&(_, wd)| wd == day.weekday()))
            }
        }
    }

    fn weekday_matches(&self, day: NaiveDate, scope: Scope) -> bool {
        let (first, last) = scope.bounds(day);

        self.by_day.iter().any(|&(num, weekday)| {
            if day.weekday() != weekday {
                return false;
            }

            match num {
                None => true,
                Some(n) if n > 0 => (day - first).num_days() / 7 + 1 == i64::from(n),
                Some(n) => (last - day).num_days() / 7 + 1 == -i64::from(n),
            }
        })
    }

    fn month_day_matches(&self, day: NaiveDate) -> bool {
        if self.by_month_day.is_empty() {
            return true;
        }

        let days_in_month = get_days_in_month(day) as i64;
        self.by_month_day.iter().any(|&n| {
            let n = i64::from(n);
            let wanted = if n > 0 { n } else { days_in_month + n + 1 };
            wanted == i64::from(day.day())
        })
    }

    fn year_day_matches(&self, day: NaiveDate) -> bool {
        if self.by_year_day.is_empty() {
            return true;
        }

        let days_in_year = get_days_in_year(day) as i64;
        self.by_year_day.iter().any(|&n| {
            let n = i64::from(n);
            let wanted = if n > 0 { n } else { days_in_year + n + 1 };
            wanted == i64::from(day.ordinal())
        })
    }

    /// Week numbers follow ISO 8601, so week 1 is the first week with at
    /// least four days in the year.
    fn week_number_matches(&self, day: NaiveDate) -> bool {
        if self.by_week_number.is_empty() {
            return true;
        }

        let week = day.iso_week();
        if week.year() != day.year() {
            return false;
        }

        let weeks_in_year = get_weeks_in_year(day.year()) as i64;
        self.by_week_number.iter().any(|&n| {
            let n = i64::from(n);
            let wanted = if n > 0 { n } else { weeks_in_year + n + 1 };
            wanted == i64::from(week.week())
        })
    }

    fn expand_times(&self, start: NaiveDateTime, dtstart: NaiveDateTime) -> Vec<NaiveTime> {
        let hours = expand_or_limit(
            &self.by_hour,
            self.frequency > Frequency::Hourly,
            dtstart.hour(),
            start.hour(),
        );
        let minutes = expand_or_limit(
            &self.by_minute,
            self.frequency > Frequency::Minutely,
            dtstart.minute(),
            start.minute(),
        );
        let seconds = expand_or_limit(
            &self.by_second,
            self.frequency > Frequency::Secondly,
            dtstart.second(),
            start.second(),
        );

        iproduct!(hours, minutes, seconds)
            .filter_map(|(h, m, s)| NaiveTime::from_hms_opt(h, m, s))
            .sorted()
            .collect()
    }
}

/// A BYHOUR/BYMINUTE/BYSECOND list expands the period when the frequency is
/// coarser than the unit, and limits it otherwise.
fn expand_or_limit(by: &[u8], expands: bool, from_start: u32, from_period: u32) -> Vec<u32> {
    if expands {
        if by.is_empty() {
            vec![from_start]
        } else {
            by.iter().map(|&v| u32::from(v)).collect()
        }
    } else if by.is_empty() || by.contains(&(from_period as u8)) {
        vec![from_period]
    } else {
        vec![]
    }
}

#[derive(Debug, Clone, Copy)]
enum Scope {
    Month,
    Year,
}

impl Scope {
    fn bounds(self, day: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            Scope::Month => {
                let first = day.with_day(1).unwrap_or(day);
                let last = first + Duration::days(i64::from(get_days_in_month(day)) - 1);
                (first, last)
            }
            Scope::Year => {
                let first = day.with_ordinal(1).unwrap_or(day);
                let last = first + Duration::days(i64::from(get_days_in_year(day)) - 1);
                (first, last)
            }
        }
    }
}

impl FromStr for RecurRule {
    type Err = RecurrenceError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        parse_rule(rule).map_err(|e| RecurrenceError {
            rule: rule.to_string(),
            reason: format!("{:#}", e),
        })
    }
}

fn parse_list<T>(part: &str, value: &str, valid: impl Fn(&T) -> bool) -> Result<Vec<T>, Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let values = value
        .split(',')
        .map(|s| s.trim().parse::<T>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid recur rule option: {}", part))?;

    if !values.iter().all(valid) {
        bail!("Invalid recur rule option: {}", part)
    }

    Ok(values)
}

fn parse_weekday(value: &str) -> Option<Weekday> {
    Some(match value {
        "MO" => Weekday::Mon,
        "TU" => Weekday::Tue,
        "WE" => Weekday::Wed,
        "TH" => Weekday::Thu,
        "FR" => Weekday::Fri,
        "SA" => Weekday::Sat,
        "SU" => Weekday::Sun,
        _ => return None,
    })
}

fn parse_rule(rule_value_string: &str) -> Result<RecurRule, Error> {
    let mut frequency = None;
    let mut interval = 1;
    let mut end_condition = EndCondition::Infinite;
    let mut by_second = Vec::new();
    let mut by_minute = Vec::new();
    let mut by_hour = Vec::new();
    let mut by_day = Vec::new();
    let mut by_month_day = Vec::new();
    let mut by_year_day = Vec::new();
    let mut by_week_number = Vec::new();
    let mut by_month = Vec::new();
    let mut by_set_pos = Vec::new();
    let mut week_start = Weekday::Mon;

    for part in rule_value_string.trim().split(';').filter(|p| !p.is_empty()) {
        let (name, value) = part
            .split_once('=')
            .ok_or_else(|| format_err!("Invalid recur rule: '{}'", part))?;

        match &name.to_ascii_uppercase() as &str {
            "FREQ" => {
                frequency = Some(match &value.to_ascii_uppercase() as &str {
                    "SECONDLY" => Frequency::Secondly,
                    "MINUTELY" => Frequency::Minutely,
                    "HOURLY" => Frequency::Hourly,
                    "DAILY" => Frequency::Daily,
                    "WEEKLY" => Frequency::Weekly,
                    "MONTHLY" => Frequency::Monthly,
                    "YEARLY" => Frequency::Yearly,
                    _ => bail!("Invalid frequency: '{}'", value),
                });
            }
            "UNTIL" => {
                if end_condition != EndCondition::Infinite {
                    bail!("Invalid recur rule: COUNT and UNTIL are mutually exclusive");
                }

                end_condition = if let Some(utc) = value.strip_suffix(['Z', 'z']) {
                    let parsed = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
                        .with_context(|| format!("Invalid recur rule date: {}", part))?;
                    EndCondition::UntilUtc(parsed.and_utc())
                } else if value.contains(['T', 't']) {
                    let parsed = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
                        .with_context(|| format!("Invalid recur rule date: {}", part))?;
                    EndCondition::Until(parsed)
                } else {
                    let parsed = NaiveDate::parse_from_str(value, "%Y%m%d")
                        .with_context(|| format!("Invalid recur rule date: {}", part))?;
                    EndCondition::UntilDate(parsed)
                }
            }
            "COUNT" => {
                if end_condition != EndCondition::Infinite {
                    bail!("Invalid recur rule: COUNT and UNTIL are mutually exclusive");
                }

                let count = value
                    .parse::<u64>()
                    .with_context(|| format!("Invalid recur rule option: {}", part))?;
                if count == 0 {
                    bail!("Invalid recur rule option: {}", part)
                }
                end_condition = EndCondition::Count(count)
            }
            "INTERVAL" => {
                interval = value
                    .parse::<u32>()
                    .with_context(|| format!("Invalid recur rule option: {}", part))?
            }
            "BYSECOND" => by_second = parse_list(part, value, |s: &u8| *s <= 60)?,
            "BYMINUTE" => by_minute = parse_list(part, value, |s: &u8| *s <= 59)?,
            "BYHOUR" => by_hour = parse_list(part, value, |s: &u8| *s <= 23)?,
            "BYDAY" => {
                for val in value.split(',') {
                    let val = val.trim().to_ascii_uppercase();
                    let captures = BYDAY
                        .captures(&val)
                        .ok_or_else(|| format_err!("Invalid recur rule option: {}", part))?;

                    let num = match captures.get(1) {
                        Some(m) => {
                            let n: i8 = m.as_str().parse()?;
                            if !(1..=53).contains(&n.unsigned_abs()) {
                                bail!("Invalid recur rule option: {}", part)
                            }
                            Some(n)
                        }
                        None => None,
                    };

                    let weekday = parse_weekday(&captures[2])
                        .ok_or_else(|| format_err!("Invalid recur rule option: {}", part))?;

                    by_day.push((num, weekday));
                }
            }
            "BYMONTHDAY" => {
                by_month_day = parse_list(part, value, |s: &i8| (1..=31).contains(&s.unsigned_abs()))?
            }
            "BYYEARDAY" => {
                by_year_day =
                    parse_list(part, value, |s: &i16| (1..=366).contains(&s.unsigned_abs()))?
            }
            "BYWEEKNO" => {
                by_week_number =
                    parse_list(part, value, |s: &i8| (1..=53).contains(&s.unsigned_abs()))?
            }
            "BYMONTH" => by_month = parse_list(part, value, |s: &u8| (1..=12).contains(s))?,
            "BYSETPOS" => {
                by_set_pos =
                    parse_list(part, value, |s: &i16| (1..=366).contains(&s.unsigned_abs()))?
            }
            "WKST" => {
                week_start = parse_weekday(&value.to_ascii_uppercase())
                    .ok_or_else(|| format_err!("Invalid recur rule option: {}", part))?;
            }
            _ => bail!("Invalid recur rule option: '{}'", part),
        }
    }

    let frequency = frequency.ok_or_else(|| format_err!("Missing FREQ in RRULE"))?;

    if !by_week_number.is_empty() && frequency != Frequency::Yearly {
        bail!("Invalid recur rule combination: cannot combine BYWEEKNO with non-YEARLY frequency");
    }

    if !by_year_day.is_empty()
        && [Frequency::Daily, Frequency::Weekly, Frequency::Monthly].contains(&frequency)
    {
        bail!(
            "Invalid recur rule combination: cannot combine BYYEARDAY with DAILY/WEEKLY/MONTHLY frequency"
        );
    }

    if !by_month_day.is_empty() && frequency == Frequency::Weekly {
        bail!("Invalid recur rule combination: cannot combine BYMONTHDAY with WEEKLY frequency");
    }

    if frequency != Frequency::Monthly && frequency != Frequency::Yearly {
        for (i, _) in &by_day {
            if i.is_some() {
                bail!("Invalid recur rule combination: cannot have integer in BYDAY when frequency is not MONTHLY or YEARLY")
            }
        }
    }

    Ok(RecurRule {
        frequency,
        interval,
        end_condition,
        by_second,
        by_minute,
        by_hour,
        by_day,
        by_month_day,
        by_year_day,
        by_week_number,
        by_month,
        by_set_pos,
        week_start,
    })
}

/// The number of periods a [`RecurIter`] may walk. Clones share one
/// allowance, so a clone kept by the caller can tell whether it ran out.
#[derive(Debug, Clone)]
pub struct WorkBudget {
    remaining: Rc<Cell<u64>>,
    exhausted: Rc<Cell<bool>>,
}

impl WorkBudget {
    pub fn new(periods: u64) -> Self {
        WorkBudget {
            remaining: Rc::new(Cell::new(periods)),
            exhausted: Rc::new(Cell::new(false)),
        }
    }

    /// Whether iteration stopped because the allowance was used up.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.get()
    }

    fn spend(&self) -> bool {
        match self.remaining.get().checked_sub(1) {
            Some(left) => {
                self.remaining.set(left);
                true
            }
            None => {
                self.exhausted.set(true);
                false
            }
        }
    }
}

/// Lazily walks a rule period by period. Always finite: it ends at COUNT or
/// UNTIL, at the horizon, when its budget runs out, or once the rule stops
/// producing candidates.
#[derive(Debug, Clone)]
pub struct RecurIter {
    recur: RecurRule,
    dtstart: NaiveDateTime,
    period: u64,
    queue: VecDeque<NaiveDateTime>,
    count: u64,
    max_count: Option<u64>,
    until: Option<NaiveDateTime>,
    horizon: Option<NaiveDateTime>,
    budget: Option<WorkBudget>,
    started: bool,
    done: bool,
}

impl RecurIter {
    /// Charge every period walked to `budget`.
    pub fn with_budget(mut self, budget: WorkBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Carry on from the period holding `at`, without walking the ones
    /// before it. DTSTART is still the first item. Ignored for rules with a
    /// COUNT, since every earlier instance counts towards it.
    pub fn skip_to(mut self, at: NaiveDateTime) -> Self {
        if self.max_count.is_none() {
            if let Some(period) = self.recur.period_index(self.dtstart, at) {
                self.period = self.period.max(period);
            }
        }
        self
    }

    fn emit(&mut self, date: NaiveDateTime) -> Option<NaiveDateTime> {
        let past_count = self.max_count.is_some_and(|max| self.count >= max);
        let past_until = self.until.is_some_and(|until| date > until);
        let past_horizon = self.horizon.is_some_and(|horizon| date >= horizon);

        if past_count || past_until || past_horizon {
            self.done = true;
            return None;
        }

        self.count += 1;
        Some(date)
    }

    /// Queue up the candidates of the next productive period.
    fn refill(&mut self) -> bool {
        let dtstart = self.dtstart;
        let barren_limit = self.recur.barren_limit();
        let mut barren = 0u64;

        loop {
            let Some(start) = self.recur.period_start(dtstart, self.period) else {
                return false;
            };

            if self.horizon.is_some_and(|horizon| start >= horizon)
                || self.until.is_some_and(|until| start > until)
            {
                return false;
            }

            if barren >= barren_limit {
                tracing::debug!(rule = ?self.recur, "recurrence stopped producing candidates");
                return false;
            }

            if self.budget.as_ref().is_some_and(|budget| !budget.spend()) {
                tracing::debug!(rule = ?self.recur, "recurrence ran out of budget");
                return false;
            }

            barren += 1;

            if let Some(next) = self.recur.skip_barren(start, dtstart) {
                match self.recur.first_period_from(dtstart, next) {
                    Some(period) => self.period = period,
                    None => return false,
                }
                continue;
            }
            self.period += 1;

            let candidates = self
                .recur
                .expand_period(start, dtstart)
                .into_iter()
                .filter(|&d| d > dtstart)
                .collect::<VecDeque<_>>();

            if !candidates.is_empty() {
                self.queue = candidates;
                return true;
            }
        }
    }
}

impl Iterator for RecurIter {
    type Item = NaiveDateTime;

    fn next(&mut self) -> Option<NaiveDateTime> {
        if self.done {
            return None;
        }

        if !self.started {
            self.started = true;

            // DTSTART is the first instance even when the rule doesn't match
            // it, and UNTIL doesn't apply to it.
            if self.horizon.is_some_and(|horizon| self.dtstart >= horizon) {
                self.done = true;
                return None;
            }
            self.count += 1;
            return Some(self.dtstart);
        }

        loop {
            if let Some(date) = self.queue.pop_front() {
                return self.emit(date);
            }

            if !self.refill() {
                self.done = true;
                return None;
            }
        }
    }
}

fn days_until(start: NaiveDate, end: Option<NaiveDate>) -> Vec<NaiveDate> {
    match end {
        Some(end) => start.iter_days().take_while(|d| *d < end).collect(),
        None => vec![start],
    }
}

fn next_month(date: NaiveDate) -> Option<NaiveDate> {
    date.with_day(1)?.checked_add_months(Months::new(1))
}

fn get_days_in_year<D: Datelike>(date: D) -> u32 {
    if date.with_ordinal(366).is_some() {
        366
    } else {
        365
    }
}

fn get_weeks_in_year(year: i32) -> u32 {
    if NaiveDate::from_isoywd_opt(year, 53, Weekday::Mon).is_some() {
        53
    } else {
        52
    }
}

fn get_days_in_month<D: Datelike>(date: D) -> u32 {
    [31u32, 30, 29]
        .into_iter()
        .find(|&days| date.with_day(days).is_some())
        .unwrap_or(28)
}

/// Return the date of the start of the week.
fn get_start_of_week(week_start: Weekday, date: NaiveDate) -> NaiveDate {
    let difference = (i64::from(date.weekday().num_days_from_monday())
        - i64::from(week_start.num_days_from_monday()))
    .rem_euclid(7);

    date - Duration::days(difference)
}
