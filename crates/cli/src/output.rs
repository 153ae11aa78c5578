//! Output formatting utilities

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of rows
pub fn print_table<T: Tabled>(rows: Vec<T>, empty_message: &str) {
    if rows.is_empty() {
        println!("{}", empty_message.yellow());
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any response as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a section heading
pub fn print_heading(title: &str) {
    println!("{}", title.bold());
    println!("{}", "=".repeat(50));
}

/// Format milliseconds as a short human-readable duration
pub fn format_duration_ms(ms: u64) -> String {
    const SECOND: u64 = 1000;
    const MINUTE: u64 = 60 * SECOND;
    const HOUR: u64 = 60 * MINUTE;

    if ms >= HOUR {
        format!("{}h{}m", ms / HOUR, (ms % HOUR) / MINUTE)
    } else if ms >= MINUTE {
        format!("{}m{}s", ms / MINUTE, (ms % MINUTE) / SECOND)
    } else if ms >= SECOND {
        format!("{:.1}s", ms as f64 / SECOND as f64)
    } else {
        format!("{}ms", ms)
    }
}

/// Format an RFC 3339 timestamp relative to `now`
pub fn format_age(timestamp: &str, now: DateTime<Utc>) -> String {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(ts) => {
            let delta = now.signed_duration_since(ts.with_timezone(&Utc));
            let ms = delta.num_milliseconds();
            if ms >= 0 {
                format!("{} ago", format_duration_ms(ms as u64))
            } else {
                format!("in {}", format_duration_ms(ms.unsigned_abs()))
            }
        }
        Err(_) => timestamp.to_string(),
    }
}

/// Format an RFC 3339 timestamp for display
pub fn format_timestamp(timestamp: &str) -> String {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| timestamp.to_string())
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "pending" | "degraded" | "signed_out" => status.yellow().to_string(),
        "in_flight" | "refreshing" => status.blue().to_string(),
        "active" | "healthy" | "delivered" => status.green().to_string(),
        "failed" | "expired" | "unhealthy" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Color an operation kind by its drain priority
pub fn color_kind(kind: &str) -> String {
    match kind {
        "critical_alert" => kind.red().bold().to_string(),
        "booking" => kind.magenta().to_string(),
        "message" => kind.cyan().to_string(),
        _ => kind.to_string(),
    }
}

/// Shorten an operation id for table display
pub fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_ms() {
        assert_eq!(format_duration_ms(250), "250ms");
        assert_eq!(format_duration_ms(1_500), "1.5s");
        assert_eq!(format_duration_ms(90_000), "1m30s");
        assert_eq!(format_duration_ms(3_600_000 * 2 + 60_000), "2h1m");
    }

    #[test]
    fn test_format_age() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:01:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_age("2026-01-01T00:00:00Z", now), "1m0s ago");
        assert_eq!(format_age("2026-01-01T00:01:05Z", now), "in 5.0s");
        assert_eq!(format_age("yesterday", now), "yesterday");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0f8e4c2a-1111-2222"), "0f8e4c2a");
        assert_eq!(short_id("abc"), "abc");
    }
}
