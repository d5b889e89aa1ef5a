use std::fmt::Display;

use anyhow::Result;
use chrono::{DateTime, Local, NaiveDate};
use chrono_english::parse_date_string;
use clap::{CommandFactory, Parser, ValueEnum};
use now::DateTimeNow;

use crate::{
    api::facade::QueryFacade,
    utils::{percentage::Percentage, time::date_to_key},
};

use super::{
    output::{analysis::rank_domains, print_daily, print_shares},
    Args,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DateStyle {
    Uk,
    Us,
}

impl From<DateStyle> for chrono_english::Dialect {
    fn from(value: DateStyle) -> Self {
        match value {
            DateStyle::Uk => Self::Uk,
            DateStyle::Us => Self::Us,
        }
    }
}

impl Display for DateStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateStyle::Uk => write!(f, "uk"),
            DateStyle::Us => write!(f, "us"),
        }
    }
}

#[derive(Debug, Parser)]
pub struct RangeCommand {
    #[arg(
        long = "start",
        short,
        help = "First day of the range. Examples are \"yesterday\", \"3 days ago\", \"15/03/2025\". Defaults to the start of the week"
    )]
    start_date: Option<String>,
    #[arg(
        long = "end",
        short,
        help = "Last day of the range, included. Defaults to today"
    )]
    end_date: Option<String>,
    #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
    #[arg(short = 'p', long = "percentage", help = "Filter domains to have at least specified percentage", default_value_t = Percentage::new_opt(1.).unwrap())]
    min_percentage: Percentage,
    #[arg(long, help = "Also print the total of every day")]
    daily: bool,
    #[arg(long, help = "Print the raw reply as JSON")]
    json: bool,
}

fn validation_error(message: String) -> anyhow::Error {
    Args::command()
        .error(clap::error::ErrorKind::ValueValidation, message)
        .into()
}

fn parse_day(
    raw: Option<String>,
    name: &str,
    now: DateTime<Local>,
    dialect: chrono_english::Dialect,
    default: NaiveDate,
) -> Result<NaiveDate> {
    match raw.map(|s| parse_date_string(&s, now, dialect)) {
        Some(Ok(v)) => Ok(v.date_naive()),
        Some(Err(e)) => Err(validation_error(format!("Failed to validate {name} date {e}"))),
        None => Ok(default),
    }
}

/// Resolves the requested days, with the current week as the default.
pub fn resolve_range(
    start_date: Option<String>,
    end_date: Option<String>,
    date_style: DateStyle,
    now: DateTime<Local>,
) -> Result<(NaiveDate, NaiveDate)> {
    let dialect: chrono_english::Dialect = date_style.into();
    let start = parse_day(
        start_date,
        "start",
        now,
        dialect,
        now.beginning_of_week().date_naive(),
    )?;
    let end = parse_day(end_date, "end", now, dialect, now.date_naive())?;
    if start > end {
        return Err(validation_error(format!("Start {start} is after end {end}")));
    }
    Ok((start, end))
}

/// Command to process `range` command. Prints usage per domain summed over the days.
pub async fn process_range_command(
    RangeCommand {
        start_date,
        end_date,
        date_style,
        min_percentage,
        daily,
        json,
    }: RangeCommand,
    facade: &QueryFacade,
) -> Result<()> {
    let (start, end) = resolve_range(start_date, end_date, date_style, Local::now())?;
    let usage = facade
        .range_usage(&date_to_key(start), &date_to_key(end))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&usage)?);
        return Ok(());
    }

    println!("{} - {}", start.format("%x"), end.format("%x"));
    if daily {
        print_daily(&usage.daily);
    }
    let (shares, hidden) = rank_domains(&usage.domains, usage.total_ms, min_percentage);
    print_shares(&shares, hidden, usage.total_ms);
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Local, NaiveDate, TimeZone};

    use super::{resolve_range, DateStyle};

    #[test]
    fn test_explicit_dates() {
        let now = Local.with_ymd_and_hms(2025, 3, 20, 12, 0, 0).unwrap();
        let (start, end) =
            resolve_range(Some("14/03/2025".into()), Some("15/03/2025".into()), DateStyle::Uk, now)
                .unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2025, 3, 15).unwrap());

        let (start, _) =
            resolve_range(Some("03/14/2025".into()), None, DateStyle::Us, now).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
    }

    #[test]
    fn test_defaults_cover_current_week() {
        let now = Local.with_ymd_and_hms(2025, 3, 20, 12, 0, 0).unwrap();
        let (start, end) = resolve_range(None, None, DateStyle::Uk, now).unwrap();
        assert_eq!(end, now.date_naive());
        assert!(start <= end);
        assert!((end - start).num_days() < 7);
    }

    #[test]
    fn test_reversed_range_is_rejected() {
        let now = Local.with_ymd_and_hms(2025, 3, 20, 12, 0, 0).unwrap();
        assert!(resolve_range(
            Some("16/03/2025".into()),
            Some("15/03/2025".into()),
            DateStyle::Uk,
            now
        )
        .is_err());
        assert!(resolve_range(Some("not a date".into()), None, DateStyle::Uk, now).is_err());
    }
}
