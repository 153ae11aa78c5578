//! Sync queue inspection and drains

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{AgentClient, DrainReport, DrainRequest, Operation, QueueView};
use crate::output::{
    color_kind, color_status, format_age, format_duration_ms, print_heading, print_info,
    print_json, print_success, print_table, print_warning, short_id, OutputFormat,
};

/// Row for operation tables
#[derive(Tabled)]
pub struct OperationRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Age")]
    age: String,
    #[tabled(rename = "Last Error")]
    last_error: String,
}

impl OperationRow {
    pub fn from_operation(op: &Operation) -> Self {
        let now = Utc::now();
        let status = match &op.next_eligible_at {
            Some(at) if op.status == "pending" => {
                format!("{} ({})", color_status(&op.status), format_age(at, now))
            }
            _ => color_status(&op.status),
        };

        Self {
            id: short_id(&op.id),
            kind: color_kind(&op.kind),
            resource: op.resource.clone(),
            action: op.action.clone(),
            status,
            attempts: op.attempt_count,
            age: format_age(&op.created_at, now),
            last_error: op.last_error.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// List pending operations in drain order
pub async fn list(client: &AgentClient, format: OutputFormat) -> Result<()> {
    let view: QueueView = client.get("v1/queue").await?;

    match format {
        OutputFormat::Json => print_json(&view.pending)?,
        OutputFormat::Table => {
            if view.paused {
                print_warning("Drains are paused until a session is active");
            }
            let rows: Vec<OperationRow> = view.pending.iter().map(OperationRow::from_operation).collect();
            print_table(rows, "Queue is empty");
        }
    }

    Ok(())
}

/// Show queue statistics
pub async fn stats(client: &AgentClient, format: OutputFormat) -> Result<()> {
    let view: QueueView = client.get("v1/queue").await?;

    match format {
        OutputFormat::Json => print_json(&view.stats)?,
        OutputFormat::Table => {
            let s = &view.stats;
            print_heading("Sync Queue");
            println!("Pending:        {}", s.pending.to_string().cyan());
            println!("In flight:      {}", s.in_flight);
            println!("Backing off:    {}", s.deferred);
            let dead = if s.dead_letters > 0 {
                s.dead_letters.to_string().red().to_string()
            } else {
                s.dead_letters.to_string()
            };
            println!("Dead letters:   {}", dead);
            if let Some(oldest) = &s.oldest_pending_at {
                println!("Oldest pending: {}", format_age(oldest, Utc::now()));
            }
            println!(
                "Drains:         {}{}",
                if view.paused {
                    "paused".yellow()
                } else {
                    "running".green()
                },
                if view.draining { " (draining now)" } else { "" }
            );
        }
    }

    Ok(())
}

/// Trigger a drain and print its report
pub async fn drain(client: &AgentClient, trigger: &str, format: OutputFormat) -> Result<()> {
    let report: DrainReport = client
        .post(
            "v1/queue/drain",
            &DrainRequest {
                trigger: trigger.to_string(),
            },
        )
        .await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => print_report(&report),
    }

    Ok(())
}

fn print_report(report: &DrainReport) {
    if report.paused {
        print_warning("Drain skipped: queue is paused until the session is renewed");
        return;
    }

    print_success(&format!("Drain complete: {} delivered", report.delivered));
    if report.failed > 0 {
        print_info(&format!("{} attempts failed and were rescheduled", report.failed));
    }
    if report.dead_lettered > 0 {
        print_warning(&format!(
            "{} operations moved to the dead-letter store",
            report.dead_lettered
        ));
    }
    if report.dropped > 0 {
        print_warning(&format!("{} unreadable operations dropped", report.dropped));
    }
    if report.deferred > 0 {
        let next = report
            .next_eligible_in
            .map(|ms| format!(", next retry in {}", format_duration_ms(ms)))
            .unwrap_or_default();
        print_info(&format!("{} operations backing off{}", report.deferred, next));
    }
}
