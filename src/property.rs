use std::{convert::TryFrom, fmt::Debug, sync::LazyLock};

use anyhow::{bail, format_err, Context, Error};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

use crate::{parameters::ParameterSet, parser, unescape::unescape};

#[derive(Debug, Clone)]
pub enum Property {
    /// Purpose:  This property defines a short summary or subject for the
    /// calendar component.
    ///
    /// Description:  This property is used in the "VEVENT", "VTODO", and
    /// "VJOURNAL" calendar components to capture a short, one-line summary
    /// about the activity or journal entry. The category convention
    /// (`Work: Deep Focus - Coding`) is read from this value.
    Summary(PropertyValue<String>),

    /// Purpose:  This property defines the overall status or confirmation for
    /// the calendar component.
    Status(PropertyValue<StatusEnum>),

    /// Purpose:  This property specifies when the calendar component begins.
    ///
    /// Description:  Within the "VEVENT" calendar component, this property
    /// defines the start date and time for the event. For recurring events it
    /// also specifies the very first instance in the recurrence set.
    Start(PropertyValue<DateOrDateTime>),

    /// Purpose:  This property specifies the date and time that a calendar
    /// component ends. The end is non-inclusive.
    End(PropertyValue<DateOrDateTime>),

    /// Purpose:  This property specifies a positive duration of time.
    ///
    /// Description:  In a "VEVENT" calendar component the property may be used
    /// to specify a duration of the event, instead of an explicit end
    /// DATE-TIME.
    Duration(PropertyValue<Duration>),

    UID(PropertyValue<String>),

    /// Purpose:  This property is used in conjunction with the "UID" and
    /// "SEQUENCE" properties to identify a specific instance of a recurring
    /// "VEVENT" calendar component. The property value is the original value
    /// of the "DTSTART" property of the recurrence instance.
    RecurrenceID(PropertyValue<DateOrDateTime>),

    /// Purpose:  This property defines the list of DATE-TIME exceptions for
    /// recurring events.
    ///
    /// Description:  The exception dates, if specified, are used in computing
    /// the recurrence set. The recurrence set is the complete set of
    /// recurrence instances for a calendar component. The final recurrence
    /// set is generated by gathering all of the start DATE-TIME values
    /// generated by any of the specified "RRULE" and "RDATE" properties, and
    /// then excluding any start DATE-TIME values specified by "EXDATE"
    /// properties.
    ExceptionDateTimes(PropertyValue<Vec<DateOrDateTime>>),

    /// Purpose:  This property defines the list of DATE-TIME values for
    /// recurring events.
    RecurrenceDateTimes(PropertyValue<Vec<DateDateTimeOrPeriod>>),

    /// The raw RRULE value. Its grammar is checked when the event is
    /// expanded, so that a bad rule only costs that one event.
    RecurrenceRule(PropertyValue<String>),

    TimeZoneID(PropertyValue<String>),
    TimeZoneName(PropertyValue<String>),
    TimeZoneOffsetFrom(PropertyValue<FixedOffset>),
    TimeZoneOffsetTo(PropertyValue<FixedOffset>),

    Other(String, PropertyValue<String>),
}

impl TryFrom<parser::Property> for Property {
    type Error = Error;

    fn try_from(property: parser::Property) -> Result<Self, Self::Error> {
        let parameters: ParameterSet = property.parameters.iter().cloned().into();
        let name = property.name.to_ascii_uppercase();

        let prop = match &name as &str {
            "SUMMARY" => Property::Summary(PropertyValue {
                value: unescape(&property.value),
                parameters,
            }),
            "STATUS" => {
                let value = match &property.value.to_ascii_uppercase() as &str {
                    "TENTATIVE" => StatusEnum::Tentative,
                    "CONFIRMED" => StatusEnum::Confirmed,
                    "CANCELLED" => StatusEnum::Cancelled,
                    _ => StatusEnum::Other(property.value.clone()),
                };
                Property::Status(PropertyValue { value, parameters })
            }
            "DTSTART" => Property::Start(PropertyValue {
                value: DateOrDateTime::parse_from(&property.value, &parameters)
                    .context("parsing DTSTART")?,
                parameters,
            }),
            "DTEND" => Property::End(PropertyValue {
                value: DateOrDateTime::parse_from(&property.value, &parameters)
                    .context("parsing DTEND")?,
                parameters,
            }),
            "DURATION" => Property::Duration(PropertyValue {
                value: parse_duration(&property.value).context("parsing DURATION")?,
                parameters,
            }),
            "UID" => Property::UID(PropertyValue {
                value: unescape(&property.value),
                parameters,
            }),
            "RECURRENCE-ID" => Property::RecurrenceID(PropertyValue {
                value: DateOrDateTime::parse_from(&property.value, &parameters)
                    .context("parsing RECURRENCE-ID")?,
                parameters,
            }),
            "EXDATE" => Property::ExceptionDateTimes(PropertyValue {
                value: property
                    .value
                    .split(',')
                    .map(|v| DateOrDateTime::parse_from(v.trim(), &parameters))
                    .collect::<Result<_, _>>()
                    .context("parsing EXDATE")?,
                parameters,
            }),
            "RDATE" => Property::RecurrenceDateTimes(PropertyValue {
                value: property
                    .value
                    .split(',')
                    .map(|v| DateDateTimeOrPeriod::parse_from(v.trim(), &parameters))
                    .collect::<Result<_, _>>()
                    .context("parsing RDATE")?,
                parameters,
            }),
            "RRULE" => Property::RecurrenceRule(PropertyValue {
                value: property.value.clone(),
                parameters,
            }),
            "TZID" => Property::TimeZoneID(PropertyValue {
                value: unescape(&property.value),
                parameters,
            }),
            "TZNAME" => Property::TimeZoneName(PropertyValue {
                value: unescape(&property.value),
                parameters,
            }),
            "TZOFFSETFROM" => Property::TimeZoneOffsetFrom(PropertyValue {
                value: parse_offset(&property.value)?,
                parameters,
            }),
            "TZOFFSETTO" => Property::TimeZoneOffsetTo(PropertyValue {
                value: parse_offset(&property.value)?,
                parameters,
            }),
            _ => Property::Other(
                name.clone(),
                PropertyValue {
                    value: property.value,
                    parameters,
                },
            ),
        };

        Ok(prop)
    }
}

/// Parse a UTC offset, `+HHMM` or `+HHMMSS`.
pub fn parse_offset(value: &str) -> Result<FixedOffset, Error> {
    if !value.starts_with(['+', '-']) || !(value.len() == 5 || value.len() == 7) {
        bail!("Invalid UTC offset: {}", value)
    }
    let hours: i32 = value[1..3].parse()?;
    let minutes: i32 = value[3..5].parse()?;
    let seconds: i32 = if value.len() == 7 {
        value[5..].parse()?
    } else {
        0
    };

    let total = hours * 60 * 60 + minutes * 60 + seconds;

    let offset = if value.starts_with('+') {
        FixedOffset::east_opt(total)
    } else {
        FixedOffset::west_opt(total)
    };

    offset.ok_or_else(|| format_err!("UTC offset out of range: {}", value))
}

static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<sign>[+-])?P(?:(?P<weeks>\d+)W)?(?:(?P<days>\d+)D)?(?:T(?:(?P<hours>\d+)H)?(?:(?P<minutes>\d+)M)?(?:(?P<seconds>\d+)S)?)?$",
    )
    .expect("valid regex")
});

/// Parse a DURATION value, e.g. `PT1H30M`, `P1D` or `-PT15M`.
pub fn parse_duration(value: &str) -> Result<Duration, Error> {
    let captures = DURATION
        .captures(value.trim())
        .ok_or_else(|| format_err!("Invalid duration: {:?}", value))?;

    // `P` and `PT` alone match the pattern but carry no value.
    if value.trim_end().ends_with(['P', 'T']) {
        bail!("Invalid duration: {:?}", value);
    }

    let part = |name: &str| -> Result<i64, Error> {
        match captures.name(name) {
            Some(m) => Ok(m.as_str().parse()?),
            None => Ok(0),
        }
    };

    let duration = [
        Duration::try_weeks(part("weeks")?),
        Duration::try_days(part("days")?),
        Duration::try_hours(part("hours")?),
        Duration::try_minutes(part("minutes")?),
        Duration::try_seconds(part("seconds")?),
    ]
    .into_iter()
    .try_fold(Duration::zero(), |total, part| total.checked_add(&part?))
    .ok_or_else(|| format_err!("Duration out of range: {:?}", value))?;

    if captures.name("sign").map(|m| m.as_str()) == Some("-") {
        Ok(-duration)
    } else {
        Ok(duration)
    }
}

#[derive(Debug, Clone)]
pub struct PropertyValue<T: Debug + Clone> {
    pub value: T,
    pub parameters: ParameterSet,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEnum {
    Tentative,
    Confirmed,
    Cancelled,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DateDateTimeOrPeriod {
    Date(NaiveDate),
    DateTime(IcalDateTime),
    Period(Period),
}

impl DateDateTimeOrPeriod {
    fn parse_from(value: &str, params: &ParameterSet) -> Result<Self, Error> {
        if value.contains('/') {
            return Ok(DateDateTimeOrPeriod::Period(Period::parse_from(value, params)?));
        }

        Ok(match DateOrDateTime::parse_from(value, params)? {
            DateOrDateTime::Date(d) => DateDateTimeOrPeriod::Date(d),
            DateOrDateTime::DateTime(d) => DateDateTimeOrPeriod::DateTime(d),
        })
    }

    /// The start of the value, dropping a period's explicit length.
    pub fn start(&self) -> DateOrDateTime {
        match self {
            DateDateTimeOrPeriod::Date(d) => DateOrDateTime::Date(*d),
            DateDateTimeOrPeriod::DateTime(d) => DateOrDateTime::DateTime(d.clone()),
            DateDateTimeOrPeriod::Period(p) => DateOrDateTime::DateTime(p.start.clone()),
        }
    }
}

/// A PERIOD value: either `start/end` or `start/duration`.
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub start: IcalDateTime,
    pub duration: Duration,
}

impl Period {
    fn parse_from(value: &str, params: &ParameterSet) -> Result<Self, Error> {
        let (start, end) = value.split_once('/').context("invalid period")?;

        let start = match DateOrDateTime::parse_from(start, params)? {
            DateOrDateTime::Date(_) => bail!("Invalid start time in period"),
            DateOrDateTime::DateTime(d) => d,
        };

        if end.starts_with(['P', '+', '-']) {
            let duration = parse_duration(end)?;
            return Ok(Period { start, duration });
        }

        let end = match DateOrDateTime::parse_from(end, params)? {
            DateOrDateTime::Date(_) => bail!("Invalid end time in period"),
            DateOrDateTime::DateTime(d) => d,
        };

        let duration = match (&start, &end) {
            (IcalDateTime::Utc(s), IcalDateTime::Utc(e)) => *e - *s,
            (IcalDateTime::Local(s), IcalDateTime::Local(e)) => *e - *s,
            (IcalDateTime::TZ { date: s, tzid: a }, IcalDateTime::TZ { date: e, tzid: b })
                if a == b =>
            {
                *e - *s
            }
            _ => bail!("Period start and end are in different time zones"),
        };

        Ok(Period { start, duration })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IcalDateTime {
    /// A "floating" time, not bound to any time zone.
    Local(NaiveDateTime),
    Utc(DateTime<Utc>),
    TZ { date: NaiveDateTime, tzid: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DateOrDateTime {
    Date(NaiveDate),
    DateTime(IcalDateTime),
}

impl DateOrDateTime {
    fn parse_from(value: &str, params: &ParameterSet) -> Result<Self, Error> {
        let is_date = params
            .get_value_data_type()
            .map(|t| t.eq_ignore_ascii_case("DATE"))
            .unwrap_or(false)
            || !value.contains('T');

        if is_date {
            return Ok(DateOrDateTime::Date(
                NaiveDate::parse_from_str(value, "%Y%m%d")
                    .with_context(|| format!("Invalid date: {:?}", value))?,
            ));
        }

        if let Some(naive) = value.strip_suffix('Z') {
            let date = NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M%S")
                .with_context(|| format!("Invalid date-time: {:?}", value))?;
            return Ok(DateOrDateTime::DateTime(IcalDateTime::Utc(date.and_utc())));
        }

        let date = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
            .with_context(|| format!("Invalid date-time: {:?}", value))?;

        if let Some(tzid) = params.get_tzid() {
            Ok(DateOrDateTime::DateTime(IcalDateTime::TZ {
                date,
                tzid: tzid.to_string(),
            }))
        } else {
            Ok(DateOrDateTime::DateTime(IcalDateTime::Local(date)))
        }
    }
}
