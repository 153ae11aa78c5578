//! Cache invalidation and statistics

use anyhow::Result;

use crate::client::{AgentClient, CacheCleared, CacheStats};
use crate::output::{print_heading, print_json, print_success, OutputFormat};

/// Clear one namespace (`list`, `profile`, `detail`) or `all`
pub async fn clear(client: &AgentClient, namespace: &str, format: OutputFormat) -> Result<()> {
    let path = format!("v1/cache/{}", namespace);
    let result: CacheCleared = client.delete(&path).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => print_success(&format!(
            "Cleared {} entries from {}",
            result.cleared, result.namespace
        )),
    }

    Ok(())
}

pub async fn stats(client: &AgentClient, format: OutputFormat) -> Result<()> {
    let stats: CacheStats = client.get("v1/cache").await?;

    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            let lookups = stats.hits + stats.misses;
            let hit_rate = if lookups > 0 {
                format!("{:.0}%", stats.hits as f64 * 100.0 / lookups as f64)
            } else {
                "-".to_string()
            };

            print_heading("Cache");
            println!("Entries:   {}", stats.entries);
            println!("Hits:      {}", stats.hits);
            println!("Misses:    {} ({} stale)", stats.misses, stats.stale);
            println!("Hit rate:  {}", hit_rate);
        }
    }

    Ok(())
}
