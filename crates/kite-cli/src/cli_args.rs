use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kite_types::{AgentMode, Cadence};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "kite",
    about = "Event-driven action pipeline: insights, cards, execution and guarded outbound email",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "KITE_CONFIG",
        help = "Path to kite.toml; built-in defaults are used when omitted"
    )]
    pub(crate) config: Option<PathBuf>,

    #[arg(
        long,
        env = "KITE_DB",
        help = "SQLite database path; overrides [store].path"
    )]
    pub(crate) db: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Serve the HTTP API and run the insight scheduler in the background.
    Serve {
        #[arg(long, env = "KITE_BIND", help = "Listener address; overrides [gateway].bind")]
        bind: Option<String>,

        #[arg(
            long = "auth-token",
            env = "KITE_AUTH_TOKEN",
            hide_env_values = true,
            help = "Bearer token required on every route except /health"
        )]
        auth_token: Option<String>,

        #[arg(
            long = "scheduler-tick-seconds",
            env = "KITE_SCHEDULER_TICK_SECONDS",
            value_parser = parse_positive_u64,
            help = "Scheduler polling interval; overrides [scheduler].tick_seconds"
        )]
        scheduler_tick_seconds: Option<u64>,

        #[arg(long = "no-scheduler", help = "Serve the API without the background scheduler")]
        no_scheduler: bool,
    },
    /// Run one insight job for a tenant and cadence.
    RunJob {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        cadence: Cadence,
    },
    /// Run one orchestrator work block for a tenant.
    RunAgent {
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "review")]
        mode: AgentMode,
    },
    /// Execute one approved card, or every approved card of the tenant.
    Execute {
        #[arg(long)]
        tenant: String,
        #[arg(long = "card-id", conflicts_with = "all_approved")]
        card_id: Option<String>,
        #[arg(long = "all-approved")]
        all_approved: bool,
    },
}
