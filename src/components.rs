//! Turns parsed VCALENDAR components into [`RawEvent`]s, with times resolved
//! against the calendar's time zones and overrides attached to their base
//! event.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::convert::TryInto;
use std::sync::Arc;

use anyhow::{bail, ensure, format_err, Context, Error};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, NaiveTime, Utc};

use crate::error::{DataAnomaly, Diagnostics, ParseError};
use crate::parser::{self, Component};
use crate::property::{DateDateTimeOrPeriod, DateOrDateTime, IcalDateTime, Property, StatusEnum};
use crate::timezone::{Offseter, VTimeZone, Zone};

/// A single or recurring event, ready for expansion.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub uid: String,
    /// SUMMARY, or empty when the event has none.
    pub title: String,
    /// Wall-clock start in `zone`.
    pub start: NaiveDateTime,
    pub zone: Zone,
    pub duration: Duration,
    pub all_day: bool,
    /// The RRULE text as written.
    pub rrule: Option<String>,
    pub rdates: Vec<DateTime<Utc>>,
    pub exdates: Vec<DateTime<Utc>>,
    /// In file order.
    pub overrides: Vec<Override>,
    pub cancelled: bool,
}

impl RawEvent {
    pub fn is_recurring(&self) -> bool {
        self.rrule.is_some() || !self.rdates.is_empty()
    }

    pub fn start_instant(&self) -> DateTime<FixedOffset> {
        self.zone.to_instance(self.start)
    }
}

/// A VEVENT with a RECURRENCE-ID, replacing one instance of its base event.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    /// The original start of the instance being replaced.
    pub recurrence_id: DateTime<Utc>,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub title: Option<String>,
    pub cancelled: bool,
}

/// Parse every VEVENT of every VCALENDAR in `text`.
pub fn parse_calendar(
    text: &str,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<RawEvent>, ParseError> {
    let mut events = Vec::new();

    for component in Component::from_str_to_stream(text)? {
        if !component.is("VCALENDAR") {
            tracing::debug!(name = %component.name, "ignoring top level component");
            continue;
        }

        events.extend(parse_vcalendar(component, diagnostics).context("parsing VCALENDAR")?);
    }

    tracing::debug!(events = events.len(), "parsed calendar");

    Ok(events)
}

fn parse_vcalendar(
    component: parser::Component,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<RawEvent>, Error> {
    let mut vevents = Vec::new();
    let mut timezones = HashMap::new();

    for component in component.sub_components {
        if component.is("VEVENT") {
            // We parse VEvents after everything else, so that they can
            // access the timezone info.
            vevents.push(component);
        } else if component.is("VTIMEZONE") {
            let timezone: VTimeZone = component.try_into().context("parsing VTIMEZONE")?;
            timezones.insert(timezone.id.clone(), Arc::new(timezone));
        }
    }

    let mut groups: BTreeMap<String, Vec<VEvent>> = BTreeMap::new();
    for component in vevents {
        let event = VEvent::try_from_component(component).context("parsing VEVENT")?;
        groups.entry(event.uid.clone()).or_default().push(event);
    }

    let mut resolver = Resolver {
        timezones,
        diagnostics,
        unknown: HashSet::new(),
    };

    let mut events = Vec::new();
    for (uid, group) in groups {
        let (mut bases, overrides): (Vec<_>, Vec<_>) = group
            .into_iter()
            .partition(|event| event.recurrence_id.is_none());

        if bases.is_empty() {
            // Overrides of an event we don't have still happened.
            for event in overrides {
                events.push(
                    resolver
                        .standalone(event)
                        .with_context(|| format!("event {}", uid))?,
                );
            }
            continue;
        }

        for _ in bases.drain(1..) {
            resolver
                .diagnostics
                .push(DataAnomaly::DuplicateEvent { uid: uid.clone() });
        }

        let base = bases.remove(0);
        events.push(
            resolver
                .base(base, overrides)
                .with_context(|| format!("event {}", uid))?,
        );
    }

    Ok(events)
}

/// The properties of a VEVENT we care about, before time zones are applied.
#[derive(Debug, Clone)]
struct VEvent {
    uid: String,
    summary: Option<String>,
    start: Option<DateOrDateTime>,
    end: Option<DateOrDateTime>,
    duration: Option<Duration>,
    rrule: Option<String>,
    rdates: Vec<DateDateTimeOrPeriod>,
    exdates: Vec<DateOrDateTime>,
    recurrence_id: Option<DateOrDateTime>,
    cancelled: bool,
}

impl VEvent {
    fn try_from_component(component: parser::Component) -> Result<Self, Error> {
        ensure!(component.is("VEVENT"));

        let mut uid = None;
        let mut summary = None;
        let mut start = None;
        let mut end = None;
        let mut duration = None;
        let mut rrule = None;
        let mut rdates = Vec::new();
        let mut exdates = Vec::new();
        let mut recurrence_id = None;
        let mut cancelled = false;

        for prop in component.properties {
            let parsed: Property = prop.try_into()?;

            match parsed {
                Property::UID(value) => uid = Some(value.value),
                Property::Summary(value) => summary = Some(value.value),
                Property::Start(value) => start = Some(value.value),
                Property::End(value) => end = Some(value.value),
                Property::Duration(value) => duration = Some(value.value),
                Property::RecurrenceRule(value) => rrule = Some(value.value),
                Property::RecurrenceDateTimes(value) => rdates.extend(value.value),
                Property::ExceptionDateTimes(value) => exdates.extend(value.value),
                Property::RecurrenceID(value) => recurrence_id = Some(value.value),
                Property::Status(value) => cancelled = value.value == StatusEnum::Cancelled,
                _ => {}
            }
        }

        let uid = uid.ok_or_else(|| format_err!("Missing UID field in VEVENT"))?;

        if duration.is_some() && end.is_some() {
            bail!("VEVENT {} has both DURATION and DTEND", uid);
        }

        if start.is_none() && recurrence_id.is_none() {
            bail!("VEVENT {} is missing DTSTART", uid);
        }

        Ok(VEvent {
            uid,
            summary,
            start,
            end,
            duration,
            rrule,
            rdates,
            exdates,
            recurrence_id,
            cancelled,
        })
    }
}

/// Places event times onto the calendar's zones.
struct Resolver<'a> {
    timezones: HashMap<String, Arc<VTimeZone>>,
    diagnostics: &'a mut Diagnostics,
    /// TZIDs already reported as unknown.
    unknown: HashSet<String>,
}

impl Resolver<'_> {
    fn zone(&mut self, tzid: &str) -> Zone {
        if let Some(zone) = Zone::lookup(tzid, &self.timezones) {
            return zone;
        }

        if self.unknown.insert(tzid.to_string()) {
            self.diagnostics.push(DataAnomaly::UnknownTimeZone {
                tzid: tzid.to_string(),
            });
        }

        Zone::utc()
    }

    /// Wall-clock time and zone of a DTSTART. Dates start at midnight and are
    /// floating.
    fn place(&mut self, value: &DateOrDateTime) -> (NaiveDateTime, Zone, bool) {
        match value {
            DateOrDateTime::Date(date) => (date.and_time(NaiveTime::MIN), Zone::Floating, true),
            DateOrDateTime::DateTime(IcalDateTime::Local(date)) => (*date, Zone::Floating, false),
            DateOrDateTime::DateTime(IcalDateTime::Utc(date)) => {
                (date.naive_utc(), Zone::utc(), false)
            }
            DateOrDateTime::DateTime(IcalDateTime::TZ { date, tzid }) => {
                (*date, self.zone(tzid), false)
            }
        }
    }

    /// The instant a value refers to. Bare dates take the time of day and
    /// zone of the event they belong to.
    fn instant(
        &mut self,
        value: &DateOrDateTime,
        time: NaiveTime,
        zone: &Zone,
    ) -> DateTime<FixedOffset> {
        match value {
            DateOrDateTime::Date(date) => zone.to_instance(date.and_time(time)),
            other => {
                let (naive, zone, _) = self.place(other);
                zone.to_instance(naive)
            }
        }
    }

    fn duration(
        &mut self,
        event: &VEvent,
        start: &DateOrDateTime,
        start_instant: DateTime<FixedOffset>,
        zone: &Zone,
    ) -> Result<Duration, Error> {
        match (&event.end, event.duration) {
            (Some(end), _) => match (start, end) {
                (DateOrDateTime::Date(start), DateOrDateTime::Date(end)) => Ok(*end - *start),
                (DateOrDateTime::DateTime(_), DateOrDateTime::DateTime(_)) => {
                    Ok(self.instant(end, NaiveTime::MIN, zone) - start_instant)
                }
                _ => bail!("VEVENT has different types for DTSTART and DTEND"),
            },
            (None, Some(duration)) => Ok(duration),
            (None, None) => match start {
                DateOrDateTime::Date(_) => Ok(Duration::days(1)),
                DateOrDateTime::DateTime(_) => Ok(Duration::zero()),
            },
        }
    }

    fn base(&mut self, event: VEvent, overrides: Vec<VEvent>) -> Result<RawEvent, Error> {
        let start_value = event
            .start
            .clone()
            .ok_or_else(|| format_err!("Missing DTSTART field in VEVENT"))?;

        let (start, zone, all_day) = self.place(&start_value);
        let start_instant = zone.to_instance(start);
        let duration = self.duration(&event, &start_value, start_instant, &zone)?;
        end_of(start_instant, duration)?;
        let time = start.time();

        let exdates = event
            .exdates
            .iter()
            .map(|ex| self.instant(ex, time, &zone).with_timezone(&Utc))
            .collect();

        let rdates = event
            .rdates
            .iter()
            .map(|rdate| self.instant(&rdate.start(), time, &zone).with_timezone(&Utc))
            .collect();

        let overrides = overrides
            .into_iter()
            .map(|o| self.replacement(o, time, &zone, duration))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            uid = %event.uid,
            recurring = event.rrule.is_some(),
            overrides = overrides.len(),
            "parsed event"
        );

        Ok(RawEvent {
            uid: event.uid,
            title: event.summary.unwrap_or_default(),
            start,
            zone,
            duration,
            all_day,
            rrule: event.rrule,
            rdates,
            exdates,
            overrides,
            cancelled: event.cancelled,
        })
    }

    /// An override of a base event starting at `time` in `zone`.
    fn replacement(
        &mut self,
        event: VEvent,
        time: NaiveTime,
        zone: &Zone,
        base_duration: Duration,
    ) -> Result<Override, Error> {
        let recurrence_id = event
            .recurrence_id
            .clone()
            .ok_or_else(|| format_err!("Missing RECURRENCE-ID field in override"))?;
        let recurrence_id = self.instant(&recurrence_id, time, zone);

        let (start, duration) = match &event.start {
            Some(start_value) => {
                let start = self.instant(start_value, time, zone);
                let duration = if event.end.is_none() && event.duration.is_none() {
                    base_duration
                } else {
                    self.duration(&event, start_value, start, zone)?
                };
                (start, duration)
            }
            None => (recurrence_id, event.duration.unwrap_or(base_duration)),
        };

        Ok(Override {
            recurrence_id: recurrence_id.with_timezone(&Utc),
            start,
            end: end_of(start, duration)?,
            title: event.summary,
            cancelled: event.cancelled,
        })
    }

    /// An override whose base event isn't in the calendar, as a single event.
    fn standalone(&mut self, event: VEvent) -> Result<RawEvent, Error> {
        let start_value = match (&event.start, &event.recurrence_id) {
            (Some(start), _) | (None, Some(start)) => start.clone(),
            (None, None) => bail!("Missing DTSTART field in VEVENT"),
        };

        let (start, zone, all_day) = self.place(&start_value);
        let start_instant = zone.to_instance(start);
        let duration = self.duration(&event, &start_value, start_instant, &zone)?;
        end_of(start_instant, duration)?;

        tracing::debug!(uid = %event.uid, "override without a base event");

        Ok(RawEvent {
            uid: event.uid,
            title: event.summary.unwrap_or_default(),
            start,
            zone,
            duration,
            all_day,
            rrule: None,
            rdates: Vec::new(),
            exdates: Vec::new(),
            overrides: Vec::new(),
            cancelled: event.cancelled,
        })
    }
}

fn end_of(
    start: DateTime<FixedOffset>,
    duration: Duration,
) -> Result<DateTime<FixedOffset>, Error> {
    start
        .checked_add_signed(duration)
        .ok_or_else(|| format_err!("Event starting at {} ends out of range", start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Warning;

    fn calendar(body: &str) -> String {
        format!(
            "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\n{}END:VCALENDAR\r\n",
            body
        )
    }

    fn parse(body: &str) -> (Vec<RawEvent>, Diagnostics) {
        let mut diagnostics = Diagnostics::default();
        let events = parse_calendar(&calendar(body), &mut diagnostics).unwrap();
        (events, diagnostics)
    }

    #[test]
    fn single_event_with_dtend() {
        let (events, diagnostics) = parse(
            "BEGIN:VEVENT\r\n\
             UID:one\r\n\
             SUMMARY:Work: Deep Focus - Coding\r\n\
             DTSTART:20240304T090000Z\r\n\
             DTEND:20240304T103000Z\r\n\
             END:VEVENT\r\n",
        );

        assert!(diagnostics.is_empty());
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.uid, "one");
        assert_eq!(event.title, "Work: Deep Focus - Coding");
        assert_eq!(event.duration, Duration::minutes(90));
        assert!(!event.all_day);
        assert!(!event.is_recurring());
        assert_eq!(event.start_instant().to_rfc3339(), "2024-03-04T09:00:00+00:00");
    }

    #[test]
    fn missing_end_defaults() {
        let (events, _) = parse(
            "BEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240304T090000\r\nEND:VEVENT\r\n\
             BEGIN:VEVENT\r\nUID:b\r\nDTSTART;VALUE=DATE:20240304\r\nEND:VEVENT\r\n\
             BEGIN:VEVENT\r\nUID:c\r\nDTSTART:20240304T090000\r\nDURATION:PT45M\r\nEND:VEVENT\r\n",
        );

        assert_eq!(events[0].duration, Duration::zero());
        assert_eq!(events[1].duration, Duration::days(1));
        assert!(events[1].all_day);
        assert_eq!(events[2].duration, Duration::minutes(45));
    }

    #[test]
    fn dtend_and_duration_is_an_error() {
        let mut diagnostics = Diagnostics::default();
        let result = parse_calendar(
            &calendar(
                "BEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240304T090000\r\n\
                 DTEND:20240304T100000\r\nDURATION:PT1H\r\nEND:VEVENT\r\n",
            ),
            &mut diagnostics,
        );

        assert!(matches!(result, Err(ParseError::Invalid(_))));
    }

    #[test]
    fn missing_uid_is_an_error() {
        let mut diagnostics = Diagnostics::default();
        let result = parse_calendar(
            &calendar("BEGIN:VEVENT\r\nDTSTART:20240304T090000\r\nEND:VEVENT\r\n"),
            &mut diagnostics,
        );

        match result {
            Err(ParseError::Invalid(message)) => assert!(message.contains("UID"), "{}", message),
            other => panic!("expected an error, got {:?}", other),
        }
    }

    #[test]
    fn malformed_timestamp_is_an_error() {
        let mut diagnostics = Diagnostics::default();
        let result = parse_calendar(
            &calendar("BEGIN:VEVENT\r\nUID:a\r\nDTSTART:2024-03-04\r\nEND:VEVENT\r\n"),
            &mut diagnostics,
        );

        assert!(result.is_err());
    }

    #[test]
    fn oversized_duration_is_an_error() {
        for duration in ["P200000000D", "P999999999999999W", "-P200000000D"] {
            let mut diagnostics = Diagnostics::default();
            let result = parse_calendar(
                &calendar(&format!(
                    "BEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240304T090000Z\r\n\
                     DURATION:{}\r\nEND:VEVENT\r\n",
                    duration
                )),
                &mut diagnostics,
            );

            assert!(matches!(result, Err(ParseError::Invalid(_))), "{}", duration);
        }
    }

    #[test]
    fn oversized_override_duration_is_an_error() {
        let mut diagnostics = Diagnostics::default();
        let result = parse_calendar(
            &calendar(
                "BEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240304T090000Z\r\n\
                 RRULE:FREQ=DAILY\r\nEND:VEVENT\r\n\
                 BEGIN:VEVENT\r\nUID:a\r\nRECURRENCE-ID:20240305T090000Z\r\n\
                 DTSTART:20240305T090000Z\r\nDURATION:P200000000D\r\nEND:VEVENT\r\n",
            ),
            &mut diagnostics,
        );

        assert!(matches!(result, Err(ParseError::Invalid(_))));
    }

    #[test]
    fn overrides_attach_to_base() {
        let (events, _) = parse(
            "BEGIN:VEVENT\r\n\
             UID:standup\r\n\
             SUMMARY:Work: Standup\r\n\
             DTSTART;TZID=Europe/London:20240304T093000\r\n\
             DURATION:PT15M\r\n\
             RRULE:FREQ=DAILY;COUNT=5\r\n\
             EXDATE;TZID=Europe/London:20240306T093000\r\n\
             END:VEVENT\r\n\
             BEGIN:VEVENT\r\n\
             UID:standup\r\n\
             RECURRENCE-ID;TZID=Europe/London:20240305T093000\r\n\
             DTSTART;TZID=Europe/London:20240305T100000\r\n\
             SUMMARY:Work: Standup - Moved\r\n\
             END:VEVENT\r\n",
        );

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.rrule.as_deref(), Some("FREQ=DAILY;COUNT=5"));
        assert_eq!(
            event.exdates,
            vec!["2024-03-06T09:30:00Z".parse::<DateTime<Utc>>().unwrap()]
        );

        let replacement = &event.overrides[0];
        assert_eq!(
            replacement.recurrence_id,
            "2024-03-05T09:30:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(replacement.start.to_rfc3339(), "2024-03-05T10:00:00+00:00");
        // No DTEND, so the base event's length carries over.
        assert_eq!(replacement.end.to_rfc3339(), "2024-03-05T10:15:00+00:00");
        assert_eq!(replacement.title.as_deref(), Some("Work: Standup - Moved"));
    }

    #[test]
    fn orphan_override_becomes_single_event() {
        let (events, _) = parse(
            "BEGIN:VEVENT\r\n\
             UID:orphan\r\n\
             RECURRENCE-ID:20240305T093000Z\r\n\
             DTSTART:20240305T100000Z\r\n\
             DTEND:20240305T110000Z\r\n\
             END:VEVENT\r\n",
        );

        assert_eq!(events.len(), 1);
        assert!(!events[0].is_recurring());
        assert_eq!(events[0].duration, Duration::hours(1));
    }

    #[test]
    fn duplicate_base_keeps_first() {
        let (events, diagnostics) = parse(
            "BEGIN:VEVENT\r\nUID:dup\r\nSUMMARY:first\r\nDTSTART:20240304T090000Z\r\nEND:VEVENT\r\n\
             BEGIN:VEVENT\r\nUID:dup\r\nSUMMARY:second\r\nDTSTART:20240305T090000Z\r\nEND:VEVENT\r\n",
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "first");
        assert_eq!(
            diagnostics.warnings(),
            &[Warning::Anomaly(DataAnomaly::DuplicateEvent {
                uid: "dup".to_string()
            })]
        );
    }

    #[test]
    fn unknown_time_zone_falls_back_to_utc() {
        let (events, diagnostics) = parse(
            "BEGIN:VEVENT\r\nUID:a\r\nDTSTART;TZID=Nowhere:20240304T090000\r\nEND:VEVENT\r\n\
             BEGIN:VEVENT\r\nUID:b\r\nDTSTART;TZID=Nowhere:20240305T090000\r\nEND:VEVENT\r\n",
        );

        assert_eq!(events[0].start_instant().to_rfc3339(), "2024-03-04T09:00:00+00:00");
        // Reported once per calendar.
        assert_eq!(diagnostics.warnings().len(), 1);
    }

    #[test]
    fn calendar_time_zones_are_used() {
        let (events, diagnostics) = parse(
            "BEGIN:VTIMEZONE\r\n\
             TZID:Custom\r\n\
             BEGIN:STANDARD\r\n\
             DTSTART:19700101T000000\r\n\
             TZOFFSETFROM:+0530\r\n\
             TZOFFSETTO:+0530\r\n\
             END:STANDARD\r\n\
             END:VTIMEZONE\r\n\
             BEGIN:VEVENT\r\nUID:a\r\nDTSTART;TZID=Custom:20240304T090000\r\nEND:VEVENT\r\n",
        );

        assert!(diagnostics.is_empty());
        assert_eq!(events[0].start_instant().to_rfc3339(), "2024-03-04T09:00:00+05:30");
    }

    #[test]
    fn cancelled_status_is_kept() {
        let (events, _) = parse(
            "BEGIN:VEVENT\r\nUID:a\r\nSTATUS:CANCELLED\r\nDTSTART:20240304T090000Z\r\nEND:VEVENT\r\n",
        );

        assert!(events[0].cancelled);
    }

    #[test]
    fn concatenated_calendars_keep_their_own_zones() {
        let text = format!(
            "{}{}",
            calendar("BEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240304T090000Z\r\nEND:VEVENT\r\n"),
            calendar("BEGIN:VEVENT\r\nUID:b\r\nDTSTART:20240305T090000Z\r\nEND:VEVENT\r\n"),
        );

        let mut diagnostics = Diagnostics::default();
        let events = parse_calendar(&text, &mut diagnostics).unwrap();
        assert_eq!(events.len(), 2);
    }
}
