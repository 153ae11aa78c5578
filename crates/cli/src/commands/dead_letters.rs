//! Dead-letter inspection, resubmission and purge

use anyhow::Result;
use serde_json::json;

use crate::client::{Accepted, AgentClient, Operation, Purged};
use crate::commands::queue::OperationRow;
use crate::output::{print_json, print_success, print_table, print_warning, OutputFormat};

pub async fn list(client: &AgentClient, format: OutputFormat) -> Result<()> {
    let dead: Vec<Operation> = client.get("v1/dead-letters").await?;

    match format {
        OutputFormat::Json => print_json(&dead)?,
        OutputFormat::Table => {
            let rows: Vec<OperationRow> = dead.iter().map(OperationRow::from_operation).collect();
            print_table(rows, "No dead letters");
        }
    }

    Ok(())
}

/// Move a dead letter back to the pending queue
pub async fn resubmit(client: &AgentClient, id: &str, format: OutputFormat) -> Result<()> {
    let path = format!("v1/dead-letters/{}/resubmit", id);
    let accepted: Accepted = client.post(&path, &json!({})).await?;

    match format {
        OutputFormat::Json => print_json(&accepted)?,
        OutputFormat::Table => {
            print_success(&format!("Operation {} resubmitted", accepted.id));
        }
    }

    Ok(())
}

pub async fn purge(client: &AgentClient, confirmed: bool, format: OutputFormat) -> Result<()> {
    if !confirmed {
        print_warning("Purging discards dead letters permanently; pass --yes to confirm");
        return Ok(());
    }

    let purged: Purged = client.delete("v1/dead-letters").await?;

    match format {
        OutputFormat::Json => print_json(&purged)?,
        OutputFormat::Table => {
            print_success(&format!("Purged {} dead letters", purged.purged));
        }
    }

    Ok(())
}
