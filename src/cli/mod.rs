use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "mandalart-report",
    about = "Mandalart AI reports, coaching and push nudges"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    Doctor,
    /// Load users, mandalarts and check history from a JSON snapshot.
    Import { path: PathBuf },
    /// Generate (or reuse) one report and print it.
    Report {
        #[arg(long)]
        user: String,
        #[arg(long = "type", default_value = "weekly")]
        report_type: String,
        #[arg(long)]
        mandalart: Option<String>,
        #[arg(long = "lang")]
        language: Option<String>,
    },
    /// List the newest stored reports for a user.
    Reports {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Run {
        #[command(subcommand)]
        job: JobCommands,
    },
    /// HTTP API only.
    Serve,
    /// HTTP API plus the cron schedulers.
    Service,
    Ai {
        #[command(subcommand)]
        command: AiCommands,
    },
    Push {
        #[command(subcommand)]
        command: PushCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    Set { key: String, value: String },
    Get { key: String },
}

#[derive(Debug, Subcommand)]
pub enum JobCommands {
    ScheduledReport {
        /// RFC 3339 instant to run as, defaults to now.
        #[arg(long)]
        now: Option<String>,
    },
    StreakWarning {
        #[arg(long)]
        now: Option<String>,
    },
    Comeback {
        #[arg(long)]
        now: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum AiCommands {
    Test {
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum PushCommands {
    Test {
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "Mandalart")]
        title: String,
        #[arg(long, default_value = "Push delivery test")]
        body: String,
    },
}
