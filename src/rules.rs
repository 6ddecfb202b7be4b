use chrono::{Duration, Weekday};

use crate::error::ConfigurationError;
use crate::expand::ExpansionWindow;

pub const DEFAULT_CATEGORY_DELIMITER: &str = ":";
pub const DEFAULT_SUBCATEGORY_DELIMITER: &str = "-";
pub const DEFAULT_FOCUS_MINUTES: i64 = 90;
pub const DEFAULT_FOCUS_CATEGORIES: [&str; 4] = ["work", "learning", "learn", "project"];
pub const DEFAULT_MAX_OCCURRENCES: usize = 5000;

/// Everything that controls how a calendar is turned into a dataset. Fixed
/// for the length of a run and shared by reference between stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsingRules {
    pub category_delimiter: String,
    pub subcategory_delimiter: String,
    /// Keep only the top-level category.
    pub flatten: bool,
    pub weekend: Vec<Weekday>,
    pub focus: FocusRule,
    pub window: ExpansionWindow,
    /// Upper bound on occurrences produced by a single event.
    pub max_occurrences: usize,
    pub include_all_day: bool,
    pub keep_events_outside_window: bool,
}

impl Default for ParsingRules {
    fn default() -> Self {
        ParsingRules {
            category_delimiter: DEFAULT_CATEGORY_DELIMITER.to_string(),
            subcategory_delimiter: DEFAULT_SUBCATEGORY_DELIMITER.to_string(),
            flatten: false,
            weekend: vec![Weekday::Sat, Weekday::Sun],
            focus: FocusRule::default(),
            window: ExpansionWindow::unbounded(),
            max_occurrences: DEFAULT_MAX_OCCURRENCES,
            include_all_day: false,
            keep_events_outside_window: false,
        }
    }
}

impl ParsingRules {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.category_delimiter.is_empty() {
            return Err(ConfigurationError::EmptyDelimiter { name: "category" });
        }
        if self.subcategory_delimiter.is_empty() {
            return Err(ConfigurationError::EmptyDelimiter {
                name: "subcategory",
            });
        }

        if let ExpansionWindow {
            start: Some(start),
            end: Some(end),
        } = self.window
        {
            if start >= end {
                return Err(ConfigurationError::EmptyWindow { start, end });
            }
        }

        if self.max_occurrences == 0 {
            return Err(ConfigurationError::ZeroOccurrenceCap);
        }

        if self.focus.minimum < Duration::zero() {
            return Err(ConfigurationError::NegativeFocusMinimum(
                self.focus.minimum.num_minutes(),
            ));
        }

        Ok(())
    }

    pub fn is_weekend(&self, day: Weekday) -> bool {
        self.weekend.contains(&day)
    }
}

/// When an occurrence counts as a focus session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusRule {
    pub minimum: Duration,
    /// Top-level categories that qualify, compared case-insensitively. `None`
    /// lets every category through.
    pub categories: Option<Vec<String>>,
}

impl Default for FocusRule {
    fn default() -> Self {
        FocusRule {
            minimum: Duration::minutes(DEFAULT_FOCUS_MINUTES),
            categories: Some(
                DEFAULT_FOCUS_CATEGORIES
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            ),
        }
    }
}

impl FocusRule {
    pub fn matches(&self, duration: Duration, category: &str) -> bool {
        if duration < self.minimum {
            return false;
        }

        match &self.categories {
            None => true,
            Some(allowed) => allowed
                .iter()
                .any(|allowed| allowed.trim().eq_ignore_ascii_case(category)),
        }
    }
}
