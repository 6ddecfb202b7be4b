//! Expansion of [`RawEvent`]s into concrete [`Occurrence`]s.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::iter;

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use itertools::Itertools;

use crate::components::{Override, RawEvent};
use crate::error::{DataAnomaly, Diagnostics, RecurrenceError};
use crate::recur::{RecurRule, WorkBudget};
use crate::timezone::Offseter;

/// The half-open range `[start, end)` occurrences must overlap. Either bound
/// may be left open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpansionWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ExpansionWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        ExpansionWindow {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn unbounded() -> Self {
        ExpansionWindow::default()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| at >= start) && self.end.map_or(true, |end| at < end)
    }

    /// Whether `[start, end)` overlaps the window. A zero length occurrence
    /// overlaps when its start is inside.
    pub fn overlaps(&self, start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> bool {
        let start = start.with_timezone(&Utc);
        let end = end.with_timezone(&Utc);

        let after_start = self
            .start
            .map_or(true, |window_start| end > window_start || start >= window_start);
        let before_end = self.end.map_or(true, |window_end| start < window_end);

        after_start && before_end
    }
}

/// One concrete instance of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub uid: String,
    pub title: String,
    /// Both in the event's own local offset.
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

/// Rule periods that may be walked for each occurrence the cap allows.
const PERIODS_PER_OCCURRENCE: u64 = 200;
const MIN_PERIODS: u64 = 100_000;

/// Expands one event. Cheap to iterate more than once: every call to
/// [`Expander::occurrences`] starts over.
#[derive(Debug)]
pub struct Expander<'a> {
    event: &'a RawEvent,
    rule: Option<RecurRule>,
    window: ExpansionWindow,
    cap: usize,
    keep_outside_window: bool,
    overrides: BTreeMap<DateTime<Utc>, &'a Override>,
    exdates: BTreeSet<DateTime<Utc>>,
    /// Override slots produced by the current iteration.
    matched: RefCell<BTreeSet<DateTime<Utc>>>,
}

impl<'a> Expander<'a> {
    /// Fails only when the event's RRULE can't be parsed. Problems that can
    /// be worked around are recorded in `diagnostics`.
    pub fn new(
        event: &'a RawEvent,
        window: ExpansionWindow,
        cap: usize,
        diagnostics: &mut Diagnostics,
    ) -> Result<Self, RecurrenceError> {
        let rule = event
            .rrule
            .as_deref()
            .map(str::parse::<RecurRule>)
            .transpose()?;

        if rule.as_ref().is_some_and(|rule| rule.interval == 0) {
            diagnostics.push(DataAnomaly::DegenerateInterval {
                uid: event.uid.clone(),
            });
        }

        let mut overrides = BTreeMap::new();
        for replacement in &event.overrides {
            if overrides.contains_key(&replacement.recurrence_id) {
                diagnostics.push(DataAnomaly::ConflictingOverride {
                    uid: event.uid.clone(),
                    slot: replacement.recurrence_id,
                });
            } else {
                overrides.insert(replacement.recurrence_id, replacement);
            }
        }

        Ok(Expander {
            event,
            rule,
            window,
            cap,
            keep_outside_window: false,
            overrides,
            exdates: event.exdates.iter().copied().collect(),
            matched: RefCell::default(),
        })
    }

    /// Keep a single event even when it lies wholly outside the window.
    pub fn keep_outside_window(mut self, keep: bool) -> Self {
        self.keep_outside_window = keep;
        self
    }

    pub fn occurrences(&self) -> Occurrences<'_> {
        self.matched.borrow_mut().clear();

        let budget = WorkBudget::new(
            (self.cap as u64)
                .saturating_mul(PERIODS_PER_OCCURRENCE)
                .max(MIN_PERIODS),
        );

        let candidates: Box<dyn Iterator<Item = Occurrence> + '_> = if self.event.cancelled {
            tracing::debug!(uid = %self.event.uid, "skipping cancelled event");
            Box::new(iter::empty())
        } else if self.event.is_recurring() {
            self.recurring(budget.clone())
        } else {
            self.single()
        };

        Occurrences {
            candidates,
            cap: self.cap,
            emitted: 0,
            truncated: false,
            budget,
        }
    }

    /// Collect every occurrence, recording a warning if the expansion was
    /// cut short or an override was never used.
    pub fn expand(&self, diagnostics: &mut Diagnostics) -> Vec<Occurrence> {
        let mut occurrences = self.occurrences();
        let expanded: Vec<_> = occurrences.by_ref().collect();

        if occurrences.is_truncated() {
            diagnostics.push(DataAnomaly::ExpansionTruncated {
                uid: self.event.uid.clone(),
                cap: self.cap,
            });
        } else {
            for slot in self.unmatched_overrides() {
                diagnostics.push(DataAnomaly::UnmatchedOverride {
                    uid: self.event.uid.clone(),
                    slot,
                });
            }
        }

        tracing::debug!(uid = %self.event.uid, occurrences = expanded.len(), "expanded event");

        expanded
    }

    /// Override slots that were never generated. A single event has no
    /// slots to override. For a recurring event only slots inside the window
    /// are known to have been walked.
    fn unmatched_overrides(&self) -> Vec<DateTime<Utc>> {
        if self.event.cancelled {
            return Vec::new();
        }

        let matched = self.matched.borrow();
        let recurring = self.event.is_recurring();

        self.overrides
            .keys()
            .copied()
            .filter(|slot| !matched.contains(slot))
            .filter(|&slot| !recurring || self.window.contains(slot))
            .collect()
    }

    fn single(&self) -> Box<dyn Iterator<Item = Occurrence> + '_> {
        let start = self.event.start_instant();
        let occurrence = start
            .checked_add_signed(self.event.duration)
            .map(|end| Occurrence {
                uid: self.event.uid.clone(),
                title: self.event.title.clone(),
                start,
                end,
            });

        Box::new(occurrence.into_iter().filter(move |occurrence| {
            self.keep_outside_window || self.window.overlaps(occurrence.start, occurrence.end)
        }))
    }

    fn recurring(&self, budget: WorkBudget) -> Box<dyn Iterator<Item = Occurrence> + '_> {
        let event = self.event;
        let zone = &event.zone;

        // Local times near the end can map either side of it, so walk a
        // little further and cut on the instant below.
        let horizon = self
            .window
            .end
            .and_then(|end| zone.from_instance(end.into()).checked_add_signed(Duration::days(1)));

        let generated: Box<dyn Iterator<Item = NaiveDateTime>> = match &self.rule {
            Some(rule) => {
                let mut slots = rule.from_date(event.start, zone, horizon).with_budget(budget);
                if let Some(from) = self.earliest_slot() {
                    slots = slots.skip_to(from);
                }
                Box::new(slots)
            }
            None => Box::new(iter::once(event.start)),
        };

        let rdates = event
            .rdates
            .iter()
            .map(|&rdate| zone.from_instance(rdate.into()))
            .sorted()
            .collect_vec();

        let window_end = self.window.end;

        Box::new(
            generated
                .merge(rdates)
                .dedup()
                .map(move |local| zone.to_instance(local))
                .take_while(move |slot| {
                    window_end.map_or(true, |end| slot.with_timezone(&Utc) < end)
                })
                .filter_map(move |slot| self.place(slot))
                .filter(move |occurrence| self.window.overlaps(occurrence.start, occurrence.end)),
        )
    }

    /// Local time before which no slot can reach the window, either on its
    /// own or through an override that moves it there.
    fn earliest_slot(&self) -> Option<NaiveDateTime> {
        let zone = &self.event.zone;
        let margin = Duration::days(1);

        let reach = self.event.duration.max(Duration::zero()).checked_add(&margin)?;
        let from_window = zone
            .from_instance(self.window.start?.into())
            .checked_sub_signed(reach)?;

        let moved_in = self
            .overrides
            .iter()
            .find(|(_, replacement)| {
                !replacement.cancelled && self.window.overlaps(replacement.start, replacement.end)
            })
            .map(|(&slot, _)| zone.from_instance(slot.into()).checked_sub_signed(margin));

        match moved_in {
            Some(moved) => Some(from_window.min(moved?)),
            None => Some(from_window),
        }
    }

    /// The occurrence for a generated slot, after exceptions and overrides.
    fn place(&self, slot: DateTime<FixedOffset>) -> Option<Occurrence> {
        let key = slot.with_timezone(&Utc);

        if self.overrides.contains_key(&key) {
            self.matched.borrow_mut().insert(key);
        }

        if self.exdates.contains(&key) {
            return None;
        }

        match self.overrides.get(&key) {
            Some(replacement) if replacement.cancelled => None,
            Some(replacement) => Some(Occurrence {
                uid: self.event.uid.clone(),
                title: replacement
                    .title
                    .clone()
                    .unwrap_or_else(|| self.event.title.clone()),
                start: replacement.start,
                end: replacement.end,
            }),
            None => Some(Occurrence {
                uid: self.event.uid.clone(),
                title: self.event.title.clone(),
                start: slot,
                end: slot.checked_add_signed(self.event.duration)?,
            }),
        }
    }
}

/// A lazy, finite run over an event's occurrences. Stops at the cap, or
/// when the rule has walked as far as the cap allows.
pub struct Occurrences<'e> {
    candidates: Box<dyn Iterator<Item = Occurrence> + 'e>,
    cap: usize,
    emitted: usize,
    truncated: bool,
    budget: WorkBudget,
}

impl Occurrences<'_> {
    /// Whether occurrences may have been left out.
    pub fn is_truncated(&self) -> bool {
        self.truncated || self.budget.is_exhausted()
    }
}

impl Iterator for Occurrences<'_> {
    type Item = Occurrence;

    fn next(&mut self) -> Option<Occurrence> {
        if self.truncated {
            return None;
        }

        let next = self.candidates.next()?;

        if self.emitted >= self.cap {
            self.truncated = true;
            return None;
        }

        self.emitted += 1;
        Some(next)
    }
}
