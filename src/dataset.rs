//! The emitted CSV dataset.
//!
//! Column names and order are read by the dashboard and must not change.

use std::fs;
use std::io::Write;
use std::path::Path;

use csv::WriterBuilder;
use itertools::Itertools;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::enrich::EnrichedRecord;
use crate::error::Error;
use crate::rules::ParsingRules;

pub const COLUMNS: [&str; 17] = [
    "event_id",
    "title",
    "category",
    "subcategory",
    "subcategory_2",
    "subcategory_3",
    "start",
    "end",
    "date",
    "start_time",
    "end_time",
    "duration_minutes",
    "day_of_week",
    "is_weekend",
    "day_type",
    "hour_bucket",
    "is_focus_session",
];

/// Field order must match [`COLUMNS`].
#[derive(Debug, Serialize)]
struct Row<'a> {
    event_id: &'a str,
    title: &'a str,
    category: &'a str,
    subcategory: &'a str,
    subcategory_2: &'a str,
    subcategory_3: String,
    start: String,
    end: String,
    date: String,
    start_time: String,
    end_time: String,
    duration_minutes: i64,
    day_of_week: String,
    is_weekend: bool,
    day_type: &'static str,
    hour_bucket: u32,
    is_focus_session: bool,
}

impl<'a> Row<'a> {
    fn new(record: &'a EnrichedRecord, subcategory_delimiter: &str) -> Self {
        let occurrence = &record.occurrence;
        let subcategories = record.path.subcategories();
        let level = |i: usize| subcategories.get(i).map_or("", |s| s.as_str());

        // Anything deeper than the last column is folded into it.
        let deepest = subcategories
            .get(2..)
            .unwrap_or_default()
            .iter()
            .map(|s| s.as_str())
            .join(subcategory_delimiter);

        Row {
            event_id: &occurrence.uid,
            title: &occurrence.title,
            category: record.path.category(),
            subcategory: level(0),
            subcategory_2: level(1),
            subcategory_3: deepest,
            start: occurrence.start.to_rfc3339(),
            end: occurrence.end.to_rfc3339(),
            date: occurrence.start.format("%Y-%m-%d").to_string(),
            start_time: occurrence.start.format("%H:%M").to_string(),
            end_time: occurrence.end.format("%H:%M").to_string(),
            duration_minutes: record.duration_minutes,
            day_of_week: occurrence.start.format("%A").to_string(),
            is_weekend: record.is_weekend,
            day_type: if record.is_weekend { "Weekend" } else { "Weekday" },
            hour_bucket: record.hour_bucket,
            is_focus_session: record.is_focus_session,
        }
    }
}

/// Every record of a run, in output order.
#[derive(Debug, Clone)]
pub struct Dataset {
    records: Vec<EnrichedRecord>,
    subcategory_delimiter: String,
}

impl Dataset {
    pub fn new(mut records: Vec<EnrichedRecord>, rules: &ParsingRules) -> Self {
        records.sort_by(|a, b| {
            let (a, b) = (&a.occurrence, &b.occurrence);
            a.start
                .cmp(&b.start)
                .then_with(|| a.uid.cmp(&b.uid))
                .then_with(|| a.end.cmp(&b.end))
                .then_with(|| a.title.cmp(&b.title))
        });

        Dataset {
            records,
            subcategory_delimiter: rules.subcategory_delimiter.clone(),
        }
    }

    pub fn records(&self) -> &[EnrichedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the header and every row. The header is written even when there
    /// are no records.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), Error> {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(writer);

        writer.write_record(COLUMNS)?;
        for record in &self.records {
            writer.serialize(Row::new(record, &self.subcategory_delimiter))?;
        }
        writer.flush()?;

        Ok(())
    }

    pub fn to_csv_string(&self) -> Result<String, Error> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Stage the dataset next to `path` and move it into place only once it
    /// is completely written. On error `path` is left untouched.
    pub fn persist(&self, path: &Path) -> Result<(), Error> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut staged = NamedTempFile::new_in(parent)?;
        self.write_csv(staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged.persist(path)?;

        tracing::info!(path = %path.display(), rows = self.len(), "wrote dataset");

        Ok(())
    }
}
