//! Issue detection and remediation commands

use anyhow::Result;
use serde_json::json;
use tabled::Tabled;
use trace_engine::{HealingReport, Issue, IssueType, RemediationRecord, RemediationStatus};

use crate::client::ApiClient;
use crate::output::{
    color_status, format_time, print_fields, print_info, print_json, print_rows, print_success,
    print_warning, OutputFormat,
};

/// Row for the issues table
#[derive(Tabled)]
struct IssueRow {
    #[tabled(rename = "Tower")]
    tower_id: String,
    #[tabled(rename = "Issue")]
    issue_type: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Auto")]
    auto: String,
    #[tabled(rename = "Likely Causes")]
    causes: String,
}

/// Row for the remediations table
#[derive(Tabled)]
struct RemediationRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Tower")]
    tower_id: String,
    #[tabled(rename = "Issue")]
    issue_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Steps")]
    steps: usize,
    #[tabled(rename = "Started")]
    started_at: String,
}

/// Row for a remediation's step log
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    index: u32,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Auto")]
    auto: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Approved By")]
    approved_by: String,
    #[tabled(rename = "Executed")]
    executed_at: String,
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}

fn print_record(record: &RemediationRecord) {
    print_fields(&[
        ("Remediation", record.remediation_id.clone()),
        ("Tower", record.tower_id.clone()),
        ("Issue", record.issue_type.to_string()),
        ("Status", color_status(record.status.as_str())),
        ("Started", format_time(&record.started_at)),
        (
            "Completed",
            record
                .completed_at
                .as_ref()
                .map(format_time)
                .unwrap_or_else(|| "-".to_string()),
        ),
    ]);

    let rows: Vec<StepRow> = record
        .steps_executed
        .iter()
        .map(|s| StepRow {
            index: s.step_index,
            action: s.action.to_string(),
            auto: yes_no(s.auto),
            status: color_status(&s.status.to_string()),
            approved_by: s.approved_by.clone().unwrap_or_else(|| "-".to_string()),
            executed_at: format_time(&s.executed_at),
        })
        .collect();
    print_rows(rows, "No steps executed yet");

    if let Some(reason) = &record.rollback_reason {
        print_info(&format!("Rolled back: {}", reason));
    }
    if record.status.needs_approval() {
        print_warning(&format!(
            "Waiting for approval: tracectl approve {}",
            record.remediation_id
        ));
    }
}

pub async fn issues(client: &ApiClient, tower: Option<String>, format: OutputFormat) -> Result<()> {
    let issues: Vec<Issue> = client
        .get_with_query("api/v1/issues", &[("tower_id", tower)])
        .await?;

    match format {
        OutputFormat::Json => print_json(&issues)?,
        OutputFormat::Table => {
            if issues.is_empty() {
                print_success("No issues detected");
                return Ok(());
            }
            let total = issues.len();
            let rows: Vec<IssueRow> = issues
                .iter()
                .map(|i| IssueRow {
                    tower_id: i.tower_id.clone(),
                    issue_type: i.issue_type.to_string(),
                    severity: color_status(&i.severity.to_string()),
                    auto: yes_no(i.auto_remediation_available),
                    causes: i.possible_root_causes.join(", "),
                })
                .collect();
            print_rows(rows, "No issues detected");
            println!("\nTotal: {} issues", total);
        }
    }

    Ok(())
}

pub async fn heal(
    client: &ApiClient,
    tower_id: &str,
    issue_type: &str,
    format: OutputFormat,
) -> Result<()> {
    let report: HealingReport = client
        .post(
            &format!("api/v1/towers/{}/heal", tower_id),
            &json!({ "issue_type": issue_type }),
        )
        .await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            if report.deduplicated {
                print_info(&format!(
                    "Remediation {} is already open for this issue",
                    report.record.remediation_id
                ));
            }
            print_record(&report.record);
        }
    }

    Ok(())
}

pub async fn status(client: &ApiClient, remediation_id: &str, format: OutputFormat) -> Result<()> {
    let record: RemediationRecord = client
        .get(&format!("api/v1/remediations/{}", remediation_id))
        .await?;

    match format {
        OutputFormat::Json => print_json(&record)?,
        OutputFormat::Table => print_record(&record),
    }

    Ok(())
}

pub async fn list(
    client: &ApiClient,
    tower: Option<String>,
    issue_type: Option<String>,
    status: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    // Normalized locally so `high-cpu` and `HIGH_CPU` both work
    if let Some(status) = &status {
        status.parse::<RemediationStatus>()?;
    }
    let issue_type = issue_type
        .map(|t| t.parse::<IssueType>().map(|t| t.to_string()))
        .transpose()?;

    let records: Vec<RemediationRecord> = client
        .get_with_query(
            "api/v1/remediations",
            &[("tower_id", tower), ("issue_type", issue_type), ("status", status)],
        )
        .await?;

    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Table => {
            let total = records.len();
            let rows: Vec<RemediationRow> = records
                .iter()
                .map(|r| RemediationRow {
                    id: r.remediation_id.clone(),
                    tower_id: r.tower_id.clone(),
                    issue_type: r.issue_type.to_string(),
                    status: color_status(r.status.as_str()),
                    steps: r.steps_executed.len(),
                    started_at: format_time(&r.started_at),
                })
                .collect();
            print_rows(rows, "No remediations found");
            if total > 0 {
                println!("\nTotal: {} remediations", total);
            }
        }
    }

    Ok(())
}

pub async fn approve(
    client: &ApiClient,
    remediation_id: &str,
    approver: &str,
    format: OutputFormat,
) -> Result<()> {
    let record: RemediationRecord = client
        .post(
            &format!("api/v1/remediations/{}/approve", remediation_id),
            &json!({ "approver": approver }),
        )
        .await?;

    match format {
        OutputFormat::Json => print_json(&record)?,
        OutputFormat::Table => {
            print_success(&format!("Approved {} as {}", remediation_id, approver));
            print_record(&record);
        }
    }

    Ok(())
}

pub async fn rollback(
    client: &ApiClient,
    remediation_id: &str,
    reason: &str,
    format: OutputFormat,
) -> Result<()> {
    let record: RemediationRecord = client
        .post(
            &format!("api/v1/remediations/{}/rollback", remediation_id),
            &json!({ "reason": reason }),
        )
        .await?;

    match format {
        OutputFormat::Json => print_json(&record)?,
        OutputFormat::Table => {
            print_success(&format!("Rolled back {}", remediation_id));
            print_record(&record);
        }
    }

    Ok(())
}
