//! Energy and radio control commands

use anyhow::Result;
use serde_json::json;
use tabled::Tabled;
use trace_engine::{
    EnergyOptimization, EnergyReport, OperatingMode, PowerModeChange, SpareActivation,
    UnitsChange,
};

use crate::client::ApiClient;
use crate::output::{
    format_kw, print_info, print_json, print_rows, print_success, OutputFormat,
};

/// Row for the energy recommendations table
#[derive(Tabled)]
struct RecommendationRow {
    #[tabled(rename = "Tower")]
    tower_id: String,
    #[tabled(rename = "Active")]
    active_units: u32,
    #[tabled(rename = "Needed")]
    units_needed: u32,
    #[tabled(rename = "Idle")]
    idle_units: u32,
    #[tabled(rename = "Savings")]
    savings: String,
}

pub async fn recommend(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report: EnergyReport = client.get("api/v1/energy/recommendations").await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            if report.recommendations.is_empty() {
                print_success("No idle capacity units");
                return Ok(());
            }
            let rows: Vec<RecommendationRow> = report
                .recommendations
                .iter()
                .map(|r| RecommendationRow {
                    tower_id: r.tower_id.clone(),
                    active_units: r.active_units,
                    units_needed: r.units_needed,
                    idle_units: r.idle_units,
                    savings: format_kw(r.estimated_savings_kw),
                })
                .collect();
            print_rows(rows, "No idle capacity units");
            println!(
                "\nPotential savings: {}",
                format_kw(report.total_potential_savings_kw)
            );
        }
    }

    Ok(())
}

pub async fn optimize(client: &ApiClient, tower_id: &str, format: OutputFormat) -> Result<()> {
    let result: EnergyOptimization = client
        .post_empty(&format!("api/v1/towers/{}/energy/optimize", tower_id))
        .await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            if result.units_after == result.units_before {
                print_info(&format!("{} already matches its load", tower_id));
            } else {
                print_success(&format!(
                    "{}: {} -> {} units, saving {}",
                    tower_id,
                    result.units_before,
                    result.units_after,
                    format_kw(result.power_savings_kw)
                ));
            }
        }
    }

    Ok(())
}

pub async fn power_mode(
    client: &ApiClient,
    tower_id: &str,
    mode: &str,
    format: OutputFormat,
) -> Result<()> {
    let mode: OperatingMode = mode.parse().map_err(anyhow::Error::msg)?;
    let change: PowerModeChange = client
        .post(
            &format!("api/v1/towers/{}/power-mode", tower_id),
            &json!({ "mode": mode }),
        )
        .await?;

    match format {
        OutputFormat::Json => print_json(&change)?,
        OutputFormat::Table => print_success(&format!(
            "{}: {} -> {} ({} -> {})",
            tower_id,
            change.previous_mode,
            change.new_mode,
            format_kw(change.power_before),
            format_kw(change.power_after)
        )),
    }

    Ok(())
}

pub async fn units(client: &ApiClient, tower_id: &str, units: u32, format: OutputFormat) -> Result<()> {
    let change: UnitsChange = client
        .post(
            &format!("api/v1/towers/{}/units", tower_id),
            &json!({ "units": units }),
        )
        .await?;

    match format {
        OutputFormat::Json => print_json(&change)?,
        OutputFormat::Table => print_success(&format!(
            "{}: {} -> {} of {} units ({} -> {})",
            tower_id,
            change.previous_units,
            change.new_units,
            change.max_units,
            format_kw(change.power_before),
            format_kw(change.power_after)
        )),
    }

    Ok(())
}

pub async fn warm_spare(client: &ApiClient, tower_id: &str, format: OutputFormat) -> Result<()> {
    let activation: SpareActivation = client
        .post_empty(&format!("api/v1/towers/{}/warm-spare", tower_id))
        .await?;

    match format {
        OutputFormat::Json => print_json(&activation)?,
        OutputFormat::Table => print_success(&format!(
            "{} online for {} with {} connections and {} units",
            activation.spare_tower,
            activation.tower_id,
            activation.spare_state.active_connections,
            activation.spare_state.active_capacity_units
        )),
    }

    Ok(())
}
