//! Tower and traffic commands

use anyhow::Result;
use serde_json::json;
use tabled::Tabled;
use trace_engine::{
    CongestionSimulation, RedirectOutcome, RedistributionPlan, TowerState, TrafficAnalysis,
};

use crate::client::ApiClient;
use crate::output::{
    color_status, format_kw, format_percent, format_time, print_fields, print_info, print_json,
    print_rows, print_success, print_warning, wire_name, OutputFormat,
};

/// Row for the towers table
#[derive(Tabled)]
struct TowerRow {
    #[tabled(rename = "Tower")]
    tower_id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Connections")]
    connections: u32,
    #[tabled(rename = "Units")]
    units: u32,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Latency")]
    latency: String,
    #[tabled(rename = "Power")]
    power: String,
}

impl From<&TowerState> for TowerRow {
    fn from(state: &TowerState) -> Self {
        Self {
            tower_id: state.tower_id.clone(),
            status: color_status(&state.status.to_string()),
            connections: state.active_connections,
            units: state.active_capacity_units,
            mode: state.operating_mode.to_string(),
            cpu: format_percent(state.cpu_usage),
            latency: format!("{:.1} ms", state.latency_ms),
            power: format_kw(state.power_consumption),
        }
    }
}

/// Row for the planned transfers table
#[derive(Tabled)]
struct TransferRow {
    #[tabled(rename = "Target")]
    tower_id: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Receives")]
    received: u32,
    #[tabled(rename = "Load Before")]
    before: u32,
    #[tabled(rename = "Load After")]
    after: u32,
}

fn state_fields(state: &TowerState) -> Vec<(&'static str, String)> {
    vec![
        ("Tower", state.tower_id.clone()),
        ("Status", color_status(&state.status.to_string())),
        ("Connections", state.active_connections.to_string()),
        ("Active units", state.active_capacity_units.to_string()),
        ("Mode", state.operating_mode.to_string()),
        ("CPU", format_percent(state.cpu_usage)),
        ("Latency", format!("{:.1} ms", state.latency_ms)),
        ("Power", format_kw(state.power_consumption)),
        ("Updated", format_time(&state.last_updated)),
    ]
}

fn analysis_fields(analysis: &TrafficAnalysis) -> Vec<(&'static str, String)> {
    let action = analysis
        .recommended_action
        .map(|a| wire_name(&a))
        .unwrap_or_else(|| "-".to_string());

    vec![
        ("Tower", analysis.tower_id.clone()),
        (
            "Connections",
            format!("{} / {}", analysis.current_connections, analysis.max_capacity),
        ),
        ("Load", format_percent(analysis.load_percent)),
        ("Risk", color_status(&analysis.congestion_risk.to_string())),
        ("Action required", analysis.action_required.to_string()),
        ("Recommended", action),
    ]
}

pub async fn list(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let states: Vec<TowerState> = client.get("api/v1/towers").await?;

    match format {
        OutputFormat::Json => print_json(&states)?,
        OutputFormat::Table => {
            let total = states.len();
            print_rows(states.iter().map(TowerRow::from).collect(), "No towers found");
            println!("\nTotal: {} towers", total);
        }
    }

    Ok(())
}

pub async fn show(client: &ApiClient, tower_id: &str, format: OutputFormat) -> Result<()> {
    let state: TowerState = client.get(&format!("api/v1/towers/{}", tower_id)).await?;

    match format {
        OutputFormat::Json => print_json(&state)?,
        OutputFormat::Table => print_fields(&state_fields(&state)),
    }

    Ok(())
}

pub async fn analyze(client: &ApiClient, tower_id: &str, format: OutputFormat) -> Result<()> {
    let analysis: TrafficAnalysis = client
        .get(&format!("api/v1/towers/{}/analysis", tower_id))
        .await?;

    match format {
        OutputFormat::Json => print_json(&analysis)?,
        OutputFormat::Table => print_fields(&analysis_fields(&analysis)),
    }

    Ok(())
}

pub async fn plan(client: &ApiClient, tower_id: &str, format: OutputFormat) -> Result<()> {
    let plan: RedistributionPlan = client
        .get(&format!("api/v1/towers/{}/redistribution", tower_id))
        .await?;

    match format {
        OutputFormat::Json => print_json(&plan)?,
        OutputFormat::Table => {
            if !plan.action_required {
                print_success(
                    plan.reason
                        .as_deref()
                        .unwrap_or("Tower is within its target load"),
                );
                return Ok(());
            }

            print_info(&format!(
                "{}: {} connections, target {}, moving {}",
                plan.source_tower,
                plan.source_current_load,
                plan.target_load,
                plan.connections_to_move
            ));

            let rows: Vec<TransferRow> = plan
                .targets
                .iter()
                .map(|t| TransferRow {
                    tower_id: t.tower_id.clone(),
                    kind: wire_name(&t.kind),
                    received: t.connections_received,
                    before: t.load_before,
                    after: t.load_after,
                })
                .collect();
            print_rows(rows, "No eligible targets");

            if plan.fully_satisfied {
                print_success(&format!("Plan places {} connections", plan.total_redistributed));
            } else {
                print_warning(&format!(
                    "Plan places only {} of {} connections",
                    plan.total_redistributed, plan.connections_to_move
                ));
            }
        }
    }

    Ok(())
}

pub async fn redirect(
    client: &ApiClient,
    tower_id: &str,
    target: &str,
    connections: u32,
    format: OutputFormat,
) -> Result<()> {
    let outcome: RedirectOutcome = client
        .post(
            &format!("api/v1/towers/{}/redirect", tower_id),
            &json!({ "target_tower_id": target, "connections": connections }),
        )
        .await?;

    match format {
        OutputFormat::Json => print_json(&outcome)?,
        OutputFormat::Table => {
            if outcome.connections_moved < outcome.connections_requested {
                print_warning(&format!(
                    "Moved {} of {} requested connections (target capacity reached)",
                    outcome.connections_moved, outcome.connections_requested
                ));
            } else {
                print_success(&format!(
                    "Moved {} connections from {} to {}",
                    outcome.connections_moved, outcome.source_tower.tower_id, outcome.target_tower.tower_id
                ));
            }
            for side in [&outcome.source_tower, &outcome.target_tower] {
                println!(
                    "  {}: {} -> {}",
                    side.tower_id, side.connections_before, side.connections_after
                );
            }
        }
    }

    Ok(())
}

pub async fn simulate(
    client: &ApiClient,
    tower_id: &str,
    load_percent: f64,
    format: OutputFormat,
) -> Result<()> {
    let sim: CongestionSimulation = client
        .post(
            &format!("api/v1/towers/{}/simulate", tower_id),
            &json!({ "load_percent": load_percent }),
        )
        .await?;

    match format {
        OutputFormat::Json => print_json(&sim)?,
        OutputFormat::Table => {
            print_success(&format!(
                "{} set to {} load",
                sim.tower_id,
                format_percent(sim.load_percent)
            ));
            print_fields(&state_fields(&sim.state));
            print_fields(&analysis_fields(&sim.analysis));
        }
    }

    Ok(())
}
