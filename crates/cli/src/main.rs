//! Sync agent operator CLI
//!
//! Inspects and drives a running sync agent: queue contents, drains,
//! dead letters, cache invalidation, session and rate-limit status.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cache, dead_letters, queue, session};

/// Sync agent operator CLI
#[derive(Parser)]
#[command(name = "syncctl")]
#[command(author, version, about = "Operator CLI for the offline sync agent", long_about = None)]
pub struct Cli {
    /// Agent URL (can also be set via SYNCCTL_AGENT_URL or the config file)
    #[arg(long, env = "SYNCCTL_AGENT_URL")]
    pub agent_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and drain the sync queue
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Inspect, resubmit or purge dead-lettered operations
    #[command(subcommand)]
    DeadLetter(DeadLetterCommands),

    /// Cache statistics and invalidation
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Session status
    #[command(subcommand)]
    Session(SessionCommands),

    /// Rate-limit status
    #[command(subcommand)]
    RateLimit(RateLimitCommands),

    /// Manage the CLI configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List pending operations in drain order
    List,

    /// Show queue statistics
    Stats,

    /// Drain the queue now
    Drain {
        /// Trigger name recorded in the agent log
        #[arg(long, default_value = "manual")]
        trigger: String,
    },
}

#[derive(Subcommand)]
pub enum DeadLetterCommands {
    /// List dead-lettered operations
    List,

    /// Return a dead-lettered operation to the queue
    Resubmit {
        /// Operation ID
        id: String,
    },

    /// Permanently discard every dead letter
    Purge {
        /// Confirm the purge
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show cache statistics
    Stats,

    /// Clear a cache namespace
    Clear {
        /// Namespace: list, profile, detail, a custom name, or all
        namespace: String,
    },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Show the current session
    Show,
}

#[derive(Subcommand)]
pub enum RateLimitCommands {
    /// Show the remaining allowance for a user and action
    Show {
        /// User ID (defaults to the configured user)
        #[arg(long, short)]
        user: Option<String>,

        /// Action, e.g. booking or critical_alert
        action: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Update the configuration file
    Set {
        /// Default agent URL
        #[arg(long)]
        agent_url: Option<String>,

        /// Default user for rate-limit lookups
        #[arg(long)]
        default_user: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        output::print_error(&format!("{:#}", e));
        if let Some(agent_error) = e.downcast_ref::<client::AgentError>() {
            if let Some(category) = &agent_error.category {
                output::print_info(&format!("Category: {}", category));
            }
            if let Some(ms) = agent_error.reset_in_ms {
                output::print_info(&format!(
                    "Limit resets in {}",
                    output::format_duration_ms(ms)
                ));
            }
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = config::Config::load()?;

    // Initialize client; only agent commands need a valid URL
    let client = client::AgentClient::new(&cfg.agent_url(cli.agent_url.clone()));
    let format = cli.format;

    // Execute command
    match cli.command {
        Commands::Queue(queue_cmd) => {
            let client = client?;
            match queue_cmd {
                QueueCommands::List => queue::list(&client, format).await?,
                QueueCommands::Stats => queue::stats(&client, format).await?,
                QueueCommands::Drain { trigger } => {
                    queue::drain(&client, &trigger, format).await?
                }
            }
        }
        Commands::DeadLetter(dead_cmd) => {
            let client = client?;
            match dead_cmd {
                DeadLetterCommands::List => dead_letters::list(&client, format).await?,
                DeadLetterCommands::Resubmit { id } => {
                    dead_letters::resubmit(&client, &id, format).await?
                }
                DeadLetterCommands::Purge { yes } => {
                    dead_letters::purge(&client, yes, format).await?
                }
            }
        }
        Commands::Cache(cache_cmd) => {
            let client = client?;
            match cache_cmd {
                CacheCommands::Stats => cache::stats(&client, format).await?,
                CacheCommands::Clear { namespace } => {
                    cache::clear(&client, &namespace, format).await?
                }
            }
        }
        Commands::Session(SessionCommands::Show) => session::show(&client?, format).await?,
        Commands::RateLimit(RateLimitCommands::Show { user, action }) => {
            let Some(user) = user.or_else(|| cfg.default_user.clone()) else {
                anyhow::bail!("No user given; pass --user or set a default with `config set`");
            };
            session::rate_limit(&client?, &user, &action, format).await?
        }
        Commands::Config(config_cmd) => configure(config_cmd, cfg, cli.agent_url)?,
    }

    Ok(())
}

fn configure(command: ConfigCommands, mut cfg: config::Config, flag: Option<String>) -> Result<()> {
    let path = config::Config::config_path()?;

    match command {
        ConfigCommands::Show => {
            println!("Config file: {}", path.display());
            println!("Agent URL:   {}", cfg.agent_url(flag));
            println!("User:        {}", cfg.default_user.as_deref().unwrap_or("-"));
        }
        ConfigCommands::Set {
            agent_url,
            default_user,
        } => {
            if let Some(url) = agent_url {
                url::Url::parse(&url).map_err(|e| anyhow::anyhow!("Invalid agent URL: {}", e))?;
                cfg.agent_url = Some(url);
            }
            if default_user.is_some() {
                cfg.default_user = default_user;
            }
            cfg.save_to(&path)?;
            output::print_success(&format!("Configuration saved to {}", path.display()));
        }
    }

    Ok(())
}
