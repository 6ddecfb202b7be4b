//! Whole pipeline runs, from calendar text to CSV.

use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use insta::assert_snapshot;
use tempfile::TempDir;

use time_analyzer::category::{CategoryPath, Segment};
use time_analyzer::error::{ConfigurationError, DataAnomaly, Error, Warning};
use time_analyzer::expand::ExpansionWindow;
use time_analyzer::rules::ParsingRules;
use time_analyzer::{analyze, run};

const WEEK: &str = include_str!("fixtures/week.ics");
const BROKEN: &str = include_str!("fixtures/broken.ics");

fn utc(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn week_rules() -> ParsingRules {
    ParsingRules {
        window: ExpansionWindow::new(utc("2024-03-04T00:00:00Z"), utc("2024-03-11T00:00:00Z")),
        ..Default::default()
    }
}

fn calendar(body: &str) -> String {
    format!("BEGIN:VCALENDAR\nVERSION:2.0\n{}END:VCALENDAR\n", body)
}

fn event(uid: &str, summary: &str, extra: &str) -> String {
    format!(
        "BEGIN:VEVENT\nUID:{}\nSUMMARY:{}\n{}END:VEVENT\n",
        uid, summary, extra
    )
}

#[test]
fn week_dataset() {
    let analysis = analyze(WEEK, &week_rules()).unwrap();

    assert!(analysis.warnings.is_empty(), "{:?}", analysis.warnings);
    assert_eq!(analysis.events, 6);
    assert_eq!(analysis.dataset.len(), 8);

    let csv = analysis.dataset.to_csv_string().unwrap();
    assert_snapshot!(csv.trim_end());
}

#[test]
fn output_is_deterministic() {
    let first = analyze(WEEK, &week_rules()).unwrap();
    let second = analyze(WEEK, &week_rules()).unwrap();

    assert_eq!(
        first.dataset.to_csv_string().unwrap(),
        second.dataset.to_csv_string().unwrap()
    );
}

#[test]
fn rows_are_sorted_by_start() {
    let analysis = analyze(WEEK, &week_rules()).unwrap();
    let records = analysis.dataset.records();

    assert!(records
        .windows(2)
        .all(|w| w[0].occurrence.start <= w[1].occurrence.start));
}

#[test]
fn all_day_events_are_opt_in() {
    let rules = ParsingRules {
        include_all_day: true,
        ..week_rules()
    };
    let analysis = analyze(WEEK, &rules).unwrap();

    let holiday = analysis
        .dataset
        .records()
        .iter()
        .find(|r| r.occurrence.uid == "holiday@example.com")
        .unwrap();
    assert_eq!(holiday.duration_minutes, 24 * 60);
    assert_eq!(holiday.path, CategoryPath::Uncategorized);
}

#[test]
fn events_outside_window_can_be_kept() {
    let rules = ParsingRules {
        keep_events_outside_window: true,
        ..week_rules()
    };
    let analysis = analyze(WEEK, &rules).unwrap();

    assert_eq!(analysis.dataset.len(), 9);
    assert_eq!(
        analysis.dataset.records()[0].occurrence.uid,
        "old@example.com"
    );
}

#[test]
fn single_event_keeps_its_times() {
    let text = calendar(&event(
        "one",
        "Work: Review",
        "DTSTART;TZID=Asia/Tokyo:20240305T100000\nDTEND;TZID=Asia/Tokyo:20240305T113000\n",
    ));
    let analysis = analyze(&text, &ParsingRules::default()).unwrap();

    let records = analysis.dataset.records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].occurrence.start.to_rfc3339(),
        "2024-03-05T10:00:00+09:00"
    );
    assert_eq!(
        records[0].occurrence.end.to_rfc3339(),
        "2024-03-05T11:30:00+09:00"
    );
    assert_eq!(records[0].duration_minutes, 90);
    assert_eq!(records[0].hour_bucket, 10);
}

#[test]
fn count_yields_exactly_that_many() {
    let text = calendar(&event(
        "repeat",
        "Project: Garden",
        "DTSTART:20240101T180000Z\nDURATION:PT45M\nRRULE:FREQ=WEEKLY;BYDAY=MO,TH;COUNT=7\n",
    ));
    let analysis = analyze(&text, &ParsingRules::default()).unwrap();

    let records = analysis.dataset.records();
    assert_eq!(records.len(), 7);
    assert!(records
        .iter()
        .all(|r| r.occurrence.end - r.occurrence.start == Duration::minutes(45)));
    assert!(records
        .windows(2)
        .all(|w| w[0].occurrence.start < w[1].occurrence.start));
}

#[test]
fn exceptions_never_appear() {
    let text = calendar(&event(
        "repeat",
        "Work: Sync",
        "DTSTART:20240101T090000Z\nDTEND:20240101T093000Z\nRRULE:FREQ=DAILY;COUNT=5\n\
         EXDATE:20240102T090000Z,20240104T090000Z\n",
    ));
    let analysis = analyze(&text, &ParsingRules::default()).unwrap();

    let starts: Vec<_> = analysis
        .dataset
        .records()
        .iter()
        .map(|r| r.occurrence.start.to_rfc3339())
        .collect();
    assert_eq!(
        starts,
        vec![
            "2024-01-01T09:00:00+00:00",
            "2024-01-03T09:00:00+00:00",
            "2024-01-05T09:00:00+00:00"
        ]
    );
}

#[test]
fn override_replaces_without_duplicating() {
    let text = calendar(&format!(
        "{}{}",
        event(
            "repeat",
            "Work: Sync",
            "DTSTART:20240101T090000Z\nDTEND:20240101T093000Z\nRRULE:FREQ=DAILY;COUNT=3\n",
        ),
        event(
            "repeat",
            "Work: Sync - Long",
            "RECURRENCE-ID:20240102T090000Z\nDTSTART:20240102T130000Z\nDTEND:20240102T150000Z\n",
        ),
    ));
    let analysis = analyze(&text, &ParsingRules::default()).unwrap();

    let records = analysis.dataset.records();
    assert_eq!(records.len(), 3);
    assert_eq!(
        records[1].occurrence.start.to_rfc3339(),
        "2024-01-02T13:00:00+00:00"
    );
    assert_eq!(records[1].duration_minutes, 120);
    assert_eq!(
        records[1].path,
        CategoryPath::Path(vec![
            Segment::Named("Work".to_string()),
            Segment::Named("Sync".to_string()),
            Segment::Named("Long".to_string()),
        ])
    );
    assert!(records[1].is_focus_session);
}

#[test]
fn conflicting_overrides_keep_the_first() {
    let text = calendar(&format!(
        "{}{}{}",
        event(
            "repeat",
            "Work: Sync",
            "DTSTART:20240101T090000Z\nDTEND:20240101T093000Z\nRRULE:FREQ=DAILY;COUNT=2\n",
        ),
        event(
            "repeat",
            "First",
            "RECURRENCE-ID:20240102T090000Z\nDTSTART:20240102T100000Z\nDTEND:20240102T103000Z\n",
        ),
        event(
            "repeat",
            "Second",
            "RECURRENCE-ID:20240102T090000Z\nDTSTART:20240102T110000Z\nDTEND:20240102T113000Z\n",
        ),
    ));
    let analysis = analyze(&text, &ParsingRules::default()).unwrap();

    let titles: Vec<_> = analysis
        .dataset
        .records()
        .iter()
        .map(|r| r.occurrence.title.as_str())
        .collect();
    assert_eq!(titles, vec!["Work: Sync", "First"]);
    assert_eq!(
        analysis.warnings,
        vec![Warning::Anomaly(DataAnomaly::ConflictingOverride {
            uid: "repeat".to_string(),
            slot: utc("2024-01-02T09:00:00Z"),
        })]
    );
}

#[test]
fn negative_duration_is_clamped_and_reported() {
    let text = calendar(&event(
        "backwards",
        "Work: Oops",
        "DTSTART:20240301T100000Z\nDTEND:20240301T090000Z\n",
    ));
    let analysis = analyze(&text, &ParsingRules::default()).unwrap();

    assert_eq!(analysis.dataset.records()[0].duration_minutes, 0);
    assert_eq!(
        analysis.warnings,
        vec![Warning::Anomaly(DataAnomaly::NegativeDuration {
            uid: "backwards".to_string(),
            start: "2024-03-01T10:00:00+00:00".parse().unwrap(),
            minutes: 60,
        })]
    );
}

#[test]
fn unbounded_rule_is_capped_with_a_warning() {
    let text = calendar(&event(
        "forever",
        "Work: Tick",
        "DTSTART:20240101T000000Z\nDURATION:PT5M\nRRULE:FREQ=HOURLY\n",
    ));
    let rules = ParsingRules {
        window: ExpansionWindow::new(utc("2024-01-01T00:00:00Z"), utc("2024-01-31T00:00:00Z")),
        max_occurrences: 100,
        ..Default::default()
    };
    let analysis = analyze(&text, &rules).unwrap();

    assert_eq!(analysis.dataset.len(), 100);
    assert_eq!(
        analysis.warnings,
        vec![Warning::Anomaly(DataAnomaly::ExpansionTruncated {
            uid: "forever".to_string(),
            cap: 100,
        })]
    );
}

#[test]
fn dense_and_barren_rules_finish_quickly() {
    let text = calendar(&format!(
        "{}{}",
        event(
            "dense",
            "Work: Tick",
            "DTSTART:20230301T000000Z\nDURATION:PT1S\nRRULE:FREQ=SECONDLY\n",
        ),
        event(
            "barren",
            "Work: Never",
            "DTSTART:20230301T000000Z\nDURATION:PT1M\nRRULE:FREQ=MINUTELY;BYMONTH=2;BYMONTHDAY=30\n",
        ),
    ));
    let rules = ParsingRules {
        window: ExpansionWindow::new(utc("2024-03-01T00:00:00Z"), utc("2024-03-31T00:00:00Z")),
        ..Default::default()
    };

    let started = Instant::now();
    let analysis = analyze(&text, &rules).unwrap();
    assert!(started.elapsed() < StdDuration::from_secs(10), "{:?}", started.elapsed());

    assert_eq!(analysis.dataset.len(), rules.max_occurrences);
    assert_eq!(
        analysis.warnings,
        vec![Warning::Anomaly(DataAnomaly::ExpansionTruncated {
            uid: "dense".to_string(),
            cap: rules.max_occurrences,
        })]
    );

    let unbounded = ParsingRules {
        window: ExpansionWindow::unbounded(),
        ..Default::default()
    };
    let text = calendar(&event(
        "barren",
        "Work: Never",
        "DTSTART:20230301T000000Z\nDURATION:PT1M\nRRULE:FREQ=MINUTELY;BYMONTH=2;BYMONTHDAY=30\n",
    ));

    let started = Instant::now();
    let analysis = analyze(&text, &unbounded).unwrap();
    assert!(started.elapsed() < StdDuration::from_secs(10), "{:?}", started.elapsed());
    assert_eq!(analysis.dataset.len(), 1);
}

#[test]
fn window_bounds_unbounded_rule() {
    let text = calendar(&event(
        "forever",
        "Work: Daily",
        "DTSTART:20230101T090000Z\nDURATION:PT15M\nRRULE:FREQ=DAILY\n",
    ));
    let analysis = analyze(&text, &week_rules()).unwrap();

    assert_eq!(analysis.dataset.len(), 7);
    assert!(analysis.warnings.is_empty());
}

#[test]
fn bad_rule_skips_only_that_event() {
    let text = calendar(&format!(
        "{}{}",
        event(
            "bad",
            "Work: Broken",
            "DTSTART:20240101T090000Z\nRRULE:FREQ=FORTNIGHTLY\n",
        ),
        event("good", "Work: Fine", "DTSTART:20240101T090000Z\n"),
    ));
    let analysis = analyze(&text, &ParsingRules::default()).unwrap();

    assert_eq!(analysis.dataset.len(), 1);
    assert_eq!(analysis.dataset.records()[0].occurrence.uid, "good");
    assert!(matches!(
        &analysis.warnings[..],
        [Warning::Recurrence { uid, .. }] if uid == "bad"
    ));
}

#[test]
fn missing_uid_is_fatal() {
    assert!(matches!(
        analyze(BROKEN, &ParsingRules::default()),
        Err(Error::Parse(_))
    ));
}

#[test]
fn oversized_durations_are_parse_errors() {
    for duration in ["P200000000D", "P999999999999999W"] {
        let text = calendar(&event(
            "huge",
            "Work: Forever",
            &format!("DTSTART:20240101T090000Z\nDURATION:{}\n", duration),
        ));

        assert!(
            matches!(analyze(&text, &ParsingRules::default()), Err(Error::Parse(_))),
            "{}",
            duration
        );
    }
}

#[test]
fn invalid_rules_are_fatal() {
    let rules = ParsingRules {
        category_delimiter: String::new(),
        ..Default::default()
    };
    assert!(matches!(
        analyze(WEEK, &rules),
        Err(Error::Configuration(ConfigurationError::EmptyDelimiter { .. }))
    ));
}

#[test]
fn run_writes_only_complete_datasets() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("calendar.ics");
    let output = dir.path().join("out").join("calendar.csv");

    std::fs::write(&input, BROKEN).unwrap();
    assert!(run(&input, &output, &week_rules()).is_err());
    assert!(!output.exists());

    std::fs::write(&input, WEEK).unwrap();
    let analysis = run(&input, &output, &week_rules()).unwrap();
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        analysis.dataset.to_csv_string().unwrap()
    );
}

#[test]
fn missing_input_is_a_read_error() {
    let dir = TempDir::new().unwrap();
    let result = run(
        &dir.path().join("nope.ics"),
        &dir.path().join("out.csv"),
        &ParsingRules::default(),
    );

    assert!(matches!(result, Err(Error::Read { .. })));
}
