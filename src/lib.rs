//! Turn an iCalendar export into a flat, categorized time-usage dataset.
//!
//! The pipeline is: [`components::parse_calendar`] reads events,
//! [`expand::Expander`] turns each into occurrences,
//! [`category::CategoryPath::parse`] classifies titles, [`enrich::enrich`]
//! derives the per-row fields and [`dataset::Dataset`] writes the CSV.

use std::fs;
use std::path::Path;

pub mod category;
pub mod components;
pub mod config;
pub mod dataset;
pub mod enrich;
pub mod error;
pub mod expand;
pub mod parameters;
pub mod parser;
pub mod property;
pub mod recur;
pub mod rules;
pub mod timezone;
pub mod unescape;

use category::CategoryPath;
use dataset::Dataset;
use error::{Diagnostics, Error, Warning};
use expand::Expander;
use rules::ParsingRules;

/// The result of a successful run.
#[derive(Debug)]
pub struct Analysis {
    pub dataset: Dataset,
    /// Number of events read from the calendar, before expansion.
    pub events: usize,
    pub warnings: Vec<Warning>,
}

impl Analysis {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Run the whole pipeline over calendar text. Nothing is written.
pub fn analyze(text: &str, rules: &ParsingRules) -> Result<Analysis, Error> {
    rules.validate()?;

    let mut diagnostics = Diagnostics::default();
    let events = components::parse_calendar(text, &mut diagnostics)?;

    let mut records = Vec::new();
    for event in &events {
        if event.all_day && !rules.include_all_day {
            tracing::debug!(uid = %event.uid, "skipping all-day event");
            continue;
        }

        let expander = match Expander::new(
            event,
            rules.window,
            rules.max_occurrences,
            &mut diagnostics,
        ) {
            Ok(expander) => expander.keep_outside_window(rules.keep_events_outside_window),
            Err(error) => {
                diagnostics.push(Warning::Recurrence {
                    uid: event.uid.clone(),
                    error,
                });
                continue;
            }
        };

        for occurrence in expander.expand(&mut diagnostics) {
            let path = CategoryPath::parse(&occurrence.title, rules);
            let (record, anomaly) = enrich::enrich(occurrence, path, rules);
            if let Some(anomaly) = anomaly {
                diagnostics.push(anomaly);
            }
            records.push(record);
        }
    }

    let dataset = Dataset::new(records, rules);
    let warnings = diagnostics.into_warnings();

    tracing::info!(
        events = events.len(),
        records = dataset.len(),
        warnings = warnings.len(),
        "analyzed calendar"
    );

    Ok(Analysis {
        dataset,
        events: events.len(),
        warnings,
    })
}

/// Read `input`, analyze it and write the dataset to `output`. On error
/// `output` is not touched.
pub fn run(input: &Path, output: &Path, rules: &ParsingRules) -> Result<Analysis, Error> {
    rules.validate()?;

    let text = fs::read_to_string(input).map_err(|source| Error::Read {
        path: input.to_path_buf(),
        source,
    })?;

    let analysis = analyze(&text, rules)?;
    analysis.dataset.persist(output)?;

    Ok(analysis)
}
