use std::collections::HashMap;
use std::convert::{TryFrom, TryInto};
use std::sync::Arc;

use anyhow::{bail, ensure, format_err, Context, Error};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::parser;
use crate::property::{DateDateTimeOrPeriod, DateOrDateTime, IcalDateTime, Property};
use crate::recur::{EndCondition, Frequency, RecurRule};

/// Converts between local wall-clock times and instants.
pub trait Offseter {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset>;
    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime;
}

impl Offseter for FixedOffset {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset> {
        DateTime::from_naive_utc_and_offset(d - *self, *self)
    }

    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime {
        d.naive_utc() + *self
    }
}

/// One STANDARD or DAYLIGHT block of a VTIMEZONE.
#[derive(Debug, Clone)]
pub struct OffsetRule {
    pub offset_from: FixedOffset,
    pub offset_to: FixedOffset,
    pub start: NaiveDateTime,
    pub recur: Option<RecurRule>,
    pub name: Option<String>,
    pub rdates: Vec<NaiveDateTime>,
    pub exdates: Vec<NaiveDateTime>,
}

impl TryFrom<parser::Component> for OffsetRule {
    type Error = Error;

    fn try_from(component: parser::Component) -> Result<Self, Self::Error> {
        ensure!(component.is("DAYLIGHT") || component.is("STANDARD"));

        if !component.sub_components.is_empty() {
            bail!("Neither DAYLIGHT nor STANDARD can have sub components");
        }

        let mut offset_from = None;
        let mut offset_to = None;
        let mut start = None;
        let mut recur = None;
        let mut name = None;

        let mut rdates = Vec::new();
        let mut exdates = Vec::new();

        for prop in component.properties {
            let parsed: Property = prop.try_into()?;

            match parsed {
                Property::TimeZoneOffsetFrom(value) => offset_from = Some(value.value),
                Property::TimeZoneOffsetTo(value) => offset_to = Some(value.value),
                Property::Start(value) => start = Some(local_time(value.value)?),
                Property::RecurrenceRule(value) => {
                    recur = Some(
                        value
                            .value
                            .parse::<RecurRule>()
                            .context("parsing time zone RRULE")?,
                    )
                }
                Property::TimeZoneName(value) => name = Some(value.value),
                Property::RecurrenceDateTimes(value) => {
                    for date in value.value {
                        match date {
                            DateDateTimeOrPeriod::Date(_) => {
                                bail!("Unexpected date in {} RDATE", component.name)
                            }
                            other => rdates.push(local_time(other.start())?),
                        }
                    }
                }
                Property::ExceptionDateTimes(value) => {
                    for date in value.value {
                        exdates.push(local_time(date)?);
                    }
                }
                _ => {}
            }
        }

        Ok(OffsetRule {
            offset_from: offset_from
                .ok_or_else(|| format_err!("Missing TZOFFSETFROM field in offset rule"))?,
            offset_to: offset_to
                .ok_or_else(|| format_err!("Missing TZOFFSETTO field in offset rule"))?,
            start: start.ok_or_else(|| format_err!("Missing DTSTART field in offset rule"))?,
            recur,
            rdates,
            exdates,
            name,
        })
    }
}

fn local_time(value: DateOrDateTime) -> Result<NaiveDateTime, Error> {
    match value {
        DateOrDateTime::DateTime(IcalDateTime::Local(date))
        | DateOrDateTime::DateTime(IcalDateTime::TZ { date, .. }) => Ok(date),
        other => bail!("Invalid timezone onset {:?}, must be local time", other),
    }
}

impl OffsetRule {
    /// The latest onset of this rule at or before `date`, both in local time
    /// as measured by `offset_from`.
    fn last_onset_before(&self, date: NaiveDateTime) -> Option<NaiveDateTime> {
        if date < self.start {
            return None;
        }

        let from_rule = self.recur.as_ref().and_then(|recur| {
            let (dtstart, skip) = self.search_start(recur, date);

            recur
                .from_date(dtstart, &self.offset_from, Some(date + Duration::seconds(1)))
                .skip(skip)
                .filter(|d| !self.exdates.contains(d))
                .take_while(|&d| d <= date)
                .last()
        });

        let from_rdates = self.rdates.iter().copied().filter(|&d| d <= date).max();

        [Some(self.start), from_rule, from_rdates]
            .into_iter()
            .flatten()
            .max()
    }

    /// Where to start walking the rule. Plain yearly rules are restarted two
    /// years before `date`, as some exporters date every zone from 1601. The
    /// restarted DTSTART isn't necessarily an onset so it gets skipped.
    fn search_start(&self, recur: &RecurRule, date: NaiveDateTime) -> (NaiveDateTime, usize) {
        let restartable = recur.frequency == Frequency::Yearly
            && recur.interval <= 1
            && !matches!(recur.end_condition, EndCondition::Count(_));

        if restartable {
            if let Some(shifted) = self.start.with_year(date.year() - 2) {
                if shifted > self.start {
                    return (shifted, 1);
                }
            }
        }

        (self.start, 0)
    }
}

#[derive(Debug, Clone)]
pub struct VTimeZone {
    pub id: String,
    pub standard: Vec<OffsetRule>,
    pub daylight: Vec<OffsetRule>,
}

impl TryFrom<parser::Component> for VTimeZone {
    type Error = Error;

    fn try_from(component: parser::Component) -> Result<Self, Self::Error> {
        ensure!(component.is("VTIMEZONE"));

        let mut standard = Vec::new();
        let mut daylight = Vec::new();
        for component in component.sub_components {
            if component.is("STANDARD") {
                standard.push(component.try_into().context("parsing STANDARD")?);
            } else if component.is("DAYLIGHT") {
                daylight.push(component.try_into().context("parsing DAYLIGHT")?);
            }
        }

        if standard.is_empty() && daylight.is_empty() {
            bail!("VTIMEZONE must have one of DAYLIGHT or STANDARD components");
        }

        let mut id = None;
        for prop in component.properties {
            if let Property::TimeZoneID(value) = prop.try_into()? {
                id = Some(value.value);
            }
        }

        Ok(VTimeZone {
            id: id.ok_or_else(|| format_err!("Missing TZID field in VTIMEZONE"))?,
            standard,
            daylight,
        })
    }
}

impl VTimeZone {
    fn rules(&self) -> impl Iterator<Item = &OffsetRule> {
        self.standard.iter().chain(self.daylight.iter())
    }

    /// Find the offset for the given date. Date should either be in local time,
    /// or at UTC.
    pub fn get_offset(&self, date: NaiveDateTime, local: bool) -> FixedOffset {
        let latest = self
            .rules()
            .filter_map(|rule| {
                let target = if local { date } else { date + rule.offset_from };
                rule.last_onset_before(target)
                    .map(|onset| (onset - rule.offset_from, rule))
            })
            .max_by_key(|(onset, _)| *onset);

        match latest {
            Some((_, rule)) => rule.offset_to,
            // Before the first onset the zone observes what the earliest rule
            // transitions from.
            None => self
                .rules()
                .min_by_key(|rule| rule.start)
                .map(|rule| rule.offset_from)
                .unwrap_or_else(|| Utc.fix()),
        }
    }
}

impl Offseter for VTimeZone {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset> {
        self.get_offset(d, true).to_instance(d)
    }

    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime {
        d.naive_utc() + self.get_offset(d.naive_utc(), false)
    }
}

/// The time zone an event's times are placed in.
#[derive(Debug, Clone)]
pub enum Zone {
    /// A VTIMEZONE from the same calendar.
    Defined(Arc<VTimeZone>),
    /// A zone from the IANA database, used when the calendar doesn't define
    /// the TZID itself. UTC times use this with `Tz::UTC`.
    Iana(Tz),
    /// No zone at all. Treated as UTC.
    Floating,
}

impl Zone {
    /// Resolve a TZID against the calendar's own definitions, then the IANA
    /// database.
    pub fn lookup(tzid: &str, defined: &HashMap<String, Arc<VTimeZone>>) -> Option<Zone> {
        if let Some(tz) = defined.get(tzid) {
            return Some(Zone::Defined(Arc::clone(tz)));
        }

        // A leading solidus marks a globally unique TZID.
        tzid.trim_start_matches('/').parse::<Tz>().ok().map(Zone::Iana)
    }

    pub fn utc() -> Zone {
        Zone::Iana(Tz::UTC)
    }
}

impl Offseter for Zone {
    fn to_instance(&self, d: NaiveDateTime) -> DateTime<FixedOffset> {
        match self {
            Zone::Defined(tz) => tz.to_instance(d),
            Zone::Iana(tz) => tz
                .from_local_datetime(&d)
                .earliest()
                // Times in a spring-forward gap are read with the offset in
                // force before the gap.
                .or_else(|| tz.from_local_datetime(&(d + Duration::hours(1))).earliest())
                .map(|t| t.with_timezone(&t.offset().fix()))
                .unwrap_or_else(|| Utc.fix().to_instance(d)),
            Zone::Floating => Utc.fix().to_instance(d),
        }
    }

    fn from_instance(&self, d: DateTime<FixedOffset>) -> NaiveDateTime {
        match self {
            Zone::Defined(tz) => tz.from_instance(d),
            Zone::Iana(tz) => d.with_timezone(tz).naive_local(),
            Zone::Floating => d.naive_utc(),
        }
    }
}
