//! Network-wide commands

use anyhow::Result;
use tabled::Tabled;
use trace_engine::{ComponentStatus, HealthResponse, NetworkHealthSummary, TowerState};

use crate::client::ApiClient;
use crate::output::{
    color_status, format_kw, format_percent, format_time, print_fields, print_json, print_rows,
    print_success, print_warning, wire_name, OutputFormat,
};

/// Row for the component health table
#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
}

pub async fn reset(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let states: Vec<TowerState> = client.post_empty("api/v1/network/reset").await?;

    match format {
        OutputFormat::Json => print_json(&states)?,
        OutputFormat::Table => {
            print_success(&format!("Reset {} towers to defaults", states.len()))
        }
    }

    Ok(())
}

pub async fn summary(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let summary: NetworkHealthSummary = client.get("api/v1/network/summary").await?;

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => {
            print_fields(&[
                ("Towers", summary.total_towers.to_string()),
                ("Healthy", summary.healthy.to_string()),
                ("Warning", summary.warning.to_string()),
                ("Critical", summary.critical.to_string()),
                ("Down", summary.down.to_string()),
                ("Connections", summary.total_connections.to_string()),
                ("Avg CPU", format_percent(summary.avg_cpu_usage)),
                ("Avg latency", format!("{:.1} ms", summary.avg_latency_ms)),
                ("Total power", format_kw(summary.total_power_kw)),
                ("As of", format_time(&summary.timestamp)),
            ]);

            if summary.active_issues.is_empty() {
                print_success("No active issues");
            } else {
                print_warning(&format!(
                    "{} critical and {} warning issues (run `tracectl issues`)",
                    summary.critical_issues, summary.warning_issues
                ));
            }
        }
    }

    Ok(())
}

pub async fn health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: HealthResponse = client.get("healthz").await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            let rows: Vec<ComponentRow> = health
                .components
                .iter()
                .map(|(name, c)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&wire_name(&c.status)),
                    message: c.message.clone().unwrap_or_default(),
                    last_check: format_time(&c.last_check),
                })
                .collect();
            print_rows(rows, "No components registered");

            match health.status {
                ComponentStatus::Healthy => print_success("Agent is healthy"),
                status => print_warning(&format!("Agent is {}", wire_name(&status))),
            }
        }
    }

    Ok(())
}
