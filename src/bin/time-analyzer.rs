use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use time_analyzer::config::Settings;

/// Expand an iCalendar export into a categorized time-usage dataset.
///
/// Event titles are split into a category hierarchy, e.g. "Work: Deep Focus -
/// Coding". Exits with 0 on success, 2 when the dataset was written but
/// warnings were raised, and 1 on failure, in which case nothing is written.
#[derive(Debug, Parser)]
#[command(name = "time-analyzer", version, about)]
struct Cli {
    /// The .ics file to analyze.
    input: PathBuf,

    /// Where to write the CSV dataset.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// How far back from now to analyze.
    #[arg(long, value_parser = ["1w", "2w", "1m", "3m", "6m", "1y", "2y", "5y"])]
    period: Option<String>,

    /// Start of the analysis window (RFC 3339). Overrides --period.
    #[arg(long)]
    window_start: Option<DateTime<Utc>>,

    /// End of the analysis window (RFC 3339). Defaults to now.
    #[arg(long)]
    window_end: Option<DateTime<Utc>>,

    /// Separates the category from the rest of the title.
    #[arg(long)]
    cat_delimiter: Option<String>,

    /// Separates nested subcategories.
    #[arg(long)]
    subcat_delimiter: Option<String>,

    /// Only keep the top-level category.
    #[arg(long)]
    flatten: bool,

    /// Days that count as the weekend.
    #[arg(long, num_args = 1.., value_name = "DAY")]
    weekend: Option<Vec<String>>,

    /// Minimum length of a focus session, in minutes.
    #[arg(long)]
    focus_minutes: Option<i64>,

    /// Categories that can be focus sessions.
    #[arg(long = "focus-category", num_args = 1.., value_name = "CATEGORY")]
    focus_categories: Option<Vec<String>>,

    /// Let every category count as a focus session.
    #[arg(long, conflicts_with = "focus_categories")]
    no_focus_filter: bool,

    /// Maximum occurrences produced by a single event.
    #[arg(long)]
    max_occurrences: Option<usize>,

    /// Include all-day events.
    #[arg(long)]
    include_all_day: bool,

    /// Keep one-off events that fall outside the analysis window.
    #[arg(long)]
    keep_outside_window: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Flags win over every other configuration layer.
    fn apply(&self, settings: &mut Settings) {
        if let Some(output) = &self.output {
            settings.output = output.clone();
        }
        if let Some(period) = &self.period {
            settings.period = period.clone();
        }
        if self.window_start.is_some() {
            settings.window_start = self.window_start;
        }
        if self.window_end.is_some() {
            settings.window_end = self.window_end;
        }
        if let Some(delimiter) = &self.cat_delimiter {
            settings.category_delimiter = delimiter.clone();
        }
        if let Some(delimiter) = &self.subcat_delimiter {
            settings.subcategory_delimiter = delimiter.clone();
        }
        if let Some(weekend) = &self.weekend {
            settings.weekend = weekend.clone();
        }
        if let Some(minutes) = self.focus_minutes {
            settings.focus_minutes = minutes;
        }
        if let Some(categories) = &self.focus_categories {
            settings.focus_categories = categories.clone();
            settings.focus_filter = true;
        }
        if let Some(cap) = self.max_occurrences {
            settings.max_occurrences = cap;
        }

        settings.flatten |= self.flatten;
        settings.focus_filter &= !self.no_focus_filter;
        settings.include_all_day |= self.include_all_day;
        settings.keep_events_outside_window |= self.keep_outside_window;
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let mut settings =
        Settings::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut settings);
    tracing::debug!(?settings, "loaded configuration");

    let rules = settings.to_rules(Utc::now())?;
    tracing::info!(
        start = ?rules.window.start,
        end = ?rules.window.end,
        "analyzing {}",
        cli.input.display()
    );

    let analysis = time_analyzer::run(&cli.input, &settings.output, &rules)?;

    for warning in &analysis.warnings {
        eprintln!("warning: {}", warning);
    }
    println!(
        "Wrote {} rows from {} events to {}",
        analysis.dataset.len(),
        analysis.events,
        settings.output.display()
    );

    if analysis.has_warnings() {
        Ok(ExitCode::from(2))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
