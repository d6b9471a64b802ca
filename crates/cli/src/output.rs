//! Output formatting utilities

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

/// Print `value` as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print rows as a rounded table
pub fn print_rows<T: Tabled>(rows: Vec<T>, empty_message: &str) {
    if rows.is_empty() {
        print_warning(empty_message);
        return;
    }
    println!("{}", Table::new(rows).with(Style::rounded()));
}

/// Two-column key/value table for a single object
pub fn print_fields(fields: &[(&str, String)]) {
    #[derive(Tabled)]
    struct Field {
        #[tabled(rename = "Field")]
        name: String,
        #[tabled(rename = "Value")]
        value: String,
    }

    let rows: Vec<Field> = fields
        .iter()
        .map(|(name, value)| Field {
            name: name.to_string(),
            value: value.clone(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Percentage with one decimal
pub fn format_percent(value: f64) -> String {
    format!("{:.1}%", value)
}

pub fn format_kw(value: f64) -> String {
    format!("{:.2} kW", value)
}

/// Color a status, severity or risk label
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "normal" | "low" | "resolved" | "completed" => status.green().to_string(),
        "warning" | "medium" | "high" | "pending_approval" | "awaiting_approval"
        | "in_progress" | "degraded" => status.yellow().to_string(),
        "critical" | "down" | "failed" | "rolled_back" | "unhealthy" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Serialized name of a unit enum variant, e.g. `warm_spare`
pub fn wire_name<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => name,
        _ => "-".to_string(),
    }
}

/// Shorten timestamps to `YYYY-MM-DD HH:MM:SS`
pub fn format_time(time: &chrono::DateTime<chrono::Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_percent(96.0), "96.0%");
        assert_eq!(format_kw(3.849), "3.85 kW");

        let time = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(format_time(&time), "2026-03-01 12:30:05");
        assert_eq!(
            wire_name(&trace_engine::OperatingMode::Standby),
            "standby"
        );
    }

    #[test]
    fn test_color_status_keeps_text() {
        colored::control::set_override(false);
        assert_eq!(color_status("critical"), "critical");
        assert_eq!(color_status("resolved"), "resolved");
    }
}
