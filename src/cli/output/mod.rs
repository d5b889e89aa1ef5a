pub mod analysis;

use std::time::Duration;

use analysis::DomainShare;
use chrono::Local;

use crate::{daemon::storage::ledger::DailyTotal, utils::percentage::ms_percentage};

pub fn format_duration(ms: u64) -> String {
    let v = Duration::from_millis(ms);
    let secs = v.as_secs();
    if secs >= 3600 {
        format!("{}h{}m{}s", secs / 3600, (secs / 60) % 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{}s", (secs / 60) % 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

pub fn print_shares(shares: &[DomainShare], hidden_ms: u64, total_ms: u64) {
    for entry in shares {
        println!(
            "{}%\t{}\t{}\t{}\t{}",
            *entry.share as i32,
            format_duration(entry.time_ms),
            entry.visits,
            entry.last_visited.with_timezone(&Local).format("%x %H:%M"),
            entry.domain
        );
    }
    if hidden_ms > 0 {
        println!(
            "{}%\t{}\t\t\t(other)",
            *ms_percentage(hidden_ms, total_ms) as i32,
            format_duration(hidden_ms)
        );
    }
    println!("Total\t{}", format_duration(total_ms));
}

pub fn print_daily(daily: &[DailyTotal]) {
    for day in daily {
        println!("{}\t{}", day.date.format("%x"), format_duration(day.total_ms));
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::format_duration;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(999), "0s");
        assert_eq!(format_duration(140_000), "2m20s");
        assert_eq!(format_duration(3_723_000), "1h2m3s");
    }
}
