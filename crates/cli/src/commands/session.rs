//! Session and rate-limit status

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;

use crate::client::{AgentClient, RateLimitView, SessionView};
use crate::output::{
    color_status, format_age, format_duration_ms, format_timestamp, print_heading, print_info,
    print_json, OutputFormat,
};

pub async fn show(client: &AgentClient, format: OutputFormat) -> Result<()> {
    let session: SessionView = client.get("v1/session").await?;

    match format {
        OutputFormat::Json => print_json(&session)?,
        OutputFormat::Table => {
            print_heading("Session");
            println!("State:      {}", color_status(&session.state));
            println!("Device:     {}", session.device_id.cyan());
            if let Some(user) = &session.user_id {
                println!("User:       {}", user.cyan());
            }
            if let Some(expires_at) = &session.expires_at {
                println!(
                    "Expires:    {} ({})",
                    format_timestamp(expires_at),
                    format_age(expires_at, Utc::now())
                );
            }
            if session.refreshing {
                print_info("A token refresh is in progress");
            }
        }
    }

    Ok(())
}

/// Show the remaining allowance of one user and action
pub async fn rate_limit(
    client: &AgentClient,
    user: &str,
    action: &str,
    format: OutputFormat,
) -> Result<()> {
    let path = format!("v1/rate-limits/{}/{}", user, action);
    let view: RateLimitView = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&view)?,
        OutputFormat::Table => {
            print_heading("Rate Limit");
            println!("Scope:      {}", view.scope.cyan());
            match &view.remaining {
                _ if view.unlimited => println!("Remaining:  {}", "unlimited".green()),
                Some(r) => {
                    let count = if r.count == 0 {
                        r.count.to_string().red().to_string()
                    } else {
                        r.count.to_string().green().to_string()
                    };
                    println!("Remaining:  {}", count);
                    if r.reset_in_ms > 0 {
                        println!("Resets in:  {}", format_duration_ms(r.reset_in_ms));
                    }
                }
                None => println!("Remaining:  -"),
            }
        }
    }

    Ok(())
}
