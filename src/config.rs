//! Layered configuration: built-in defaults, then the user's config file,
//! then an explicit `--config` file, then `TIME_ANALYZER_*` environment
//! variables. Command line flags are applied on top by the binary.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc, Weekday};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::expand::ExpansionWindow;
use crate::rules::{self, FocusRule, ParsingRules};

/// Analysis periods, in days, counted back from now.
pub const PERIODS: [(&str, i64); 8] = [
    ("1w", 7),
    ("2w", 14),
    ("1m", 30),
    ("3m", 90),
    ("6m", 182),
    ("1y", 365),
    ("2y", 730),
    ("5y", 1825),
];

pub const DEFAULT_PERIOD: &str = "1m";
pub const DEFAULT_OUTPUT: &str = "data/output/calendar.csv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub output: PathBuf,
    /// Ignored for whichever window bound is set explicitly.
    pub period: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_end: Option<DateTime<Utc>>,
    pub category_delimiter: String,
    pub subcategory_delimiter: String,
    pub flatten: bool,
    pub weekend: Vec<String>,
    pub focus_minutes: i64,
    pub focus_categories: Vec<String>,
    /// When false every category can be a focus session.
    pub focus_filter: bool,
    pub max_occurrences: usize,
    pub include_all_day: bool,
    pub keep_events_outside_window: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            output: PathBuf::from(DEFAULT_OUTPUT),
            period: DEFAULT_PERIOD.to_string(),
            window_start: None,
            window_end: None,
            category_delimiter: rules::DEFAULT_CATEGORY_DELIMITER.to_string(),
            subcategory_delimiter: rules::DEFAULT_SUBCATEGORY_DELIMITER.to_string(),
            flatten: false,
            weekend: vec!["Saturday".to_string(), "Sunday".to_string()],
            focus_minutes: rules::DEFAULT_FOCUS_MINUTES,
            focus_categories: rules::DEFAULT_FOCUS_CATEGORIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            focus_filter: true,
            max_occurrences: rules::DEFAULT_MAX_OCCURRENCES,
            include_all_day: false,
            keep_events_outside_window: false,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(None)
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("TIME_ANALYZER_"));

        figment.extract()
    }

    /// Resolve into the rules for a run started at `now`.
    pub fn to_rules(&self, now: DateTime<Utc>) -> Result<ParsingRules, ConfigurationError> {
        let rules = ParsingRules {
            category_delimiter: self.category_delimiter.clone(),
            subcategory_delimiter: self.subcategory_delimiter.clone(),
            flatten: self.flatten,
            weekend: self
                .weekend
                .iter()
                .map(|day| parse_weekday(day))
                .collect::<Result<_, _>>()?,
            focus: FocusRule {
                minimum: Duration::minutes(self.focus_minutes),
                categories: self.focus_filter.then(|| self.focus_categories.clone()),
            },
            window: self.window(now)?,
            max_occurrences: self.max_occurrences,
            include_all_day: self.include_all_day,
            keep_events_outside_window: self.keep_events_outside_window,
        };

        rules.validate()?;

        Ok(rules)
    }

    fn window(&self, now: DateTime<Utc>) -> Result<ExpansionWindow, ConfigurationError> {
        let end = self.window_end.unwrap_or(now);
        let start = match self.window_start {
            Some(start) => start,
            None => end - period_length(&self.period)?,
        };

        Ok(ExpansionWindow::new(start, end))
    }
}

pub fn period_length(period: &str) -> Result<Duration, ConfigurationError> {
    PERIODS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(period.trim()))
        .map(|&(_, days)| Duration::days(days))
        .ok_or_else(|| ConfigurationError::UnknownPeriod(period.to_string()))
}

/// Accepts full or abbreviated English names in any case.
pub fn parse_weekday(day: &str) -> Result<Weekday, ConfigurationError> {
    day.trim()
        .parse()
        .map_err(|_| ConfigurationError::UnknownWeekday(day.to_string()))
}

/// Returns the platform-specific config directory.
///
/// On Linux: `~/.config/time-analyzer`
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("time-analyzer"))
}
