mod ai;
mod analyzer;
mod api;
mod cache;
mod cli;
mod coaching;
mod config;
mod db;
mod error;
mod model;
mod period;
mod pipeline;
mod push;
mod scheduler;
#[cfg(test)]
mod test_support;

use crate::ai::{ChatCompletion, HttpChatClient};
use crate::cli::{AiCommands, Cli, Commands, ConfigCommands, JobCommands, PushCommands};
use crate::config::Config;
use crate::db::Database;
use crate::db::snapshot::Snapshot;
use crate::model::{Language, ReportRequest, ReportType};
use crate::pipeline::{GenerateOptions, ReportContext, batch};
use crate::push::{ExpoPushGateway, PushGateway, PushMessage};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use clap::Parser;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { command } => handle_config_command(command),
        Commands::Doctor => handle_doctor(),
        Commands::Import { path } => handle_import(&path),
        Commands::Report {
            user,
            report_type,
            mandalart,
            language,
        } => handle_report(user, &report_type, mandalart, language.as_deref()),
        Commands::Reports { user, limit } => handle_reports(&user, limit),
        Commands::Run { job } => {
            let (job, now) = match job {
                JobCommands::ScheduledReport { now } => (Job::WeeklyReport, now),
                JobCommands::StreakWarning { now } => (Job::StreakWarning, now),
                JobCommands::Comeback { now } => (Job::Comeback, now),
            };
            let ctx = build_context(Config::resolve()?)?;
            let summary = job.run(&ctx, parse_now(now.as_deref())?)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Serve => {
            let ctx = Arc::new(build_context(Config::resolve()?)?);
            tokio::select! {
                api_result = api::run_server(ctx) => api_result,
                _ = signal::ctrl_c() => {
                    info!("shutdown signal received");
                    Ok(())
                }
            }
        }
        Commands::Service => run_service(Config::resolve()?).await,
        Commands::Ai { command } => handle_ai_command(command),
        Commands::Push { command } => handle_push_command(command),
    }
}

#[derive(Debug, Clone, Copy)]
enum Job {
    WeeklyReport,
    StreakWarning,
    Comeback,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::WeeklyReport => "weekly_report",
            Job::StreakWarning => "streak_warning",
            Job::Comeback => "comeback",
        }
    }

    fn cron(self, config: &Config) -> String {
        match self {
            Job::WeeklyReport => config.weekly_report_cron.clone(),
            Job::StreakWarning => config.streak_warning_cron.clone(),
            Job::Comeback => config.comeback_cron.clone(),
        }
    }

    fn run(self, ctx: &ReportContext, now: DateTime<Utc>) -> Result<Value> {
        let summary = match self {
            Job::WeeklyReport => serde_json::to_value(batch::run_scheduled_reports(ctx, now)?)?,
            Job::StreakWarning => serde_json::to_value(batch::run_streak_warnings(ctx, now)?)?,
            Job::Comeback => serde_json::to_value(batch::run_comeback_notifications(ctx, now)?)?,
        };
        Ok(summary)
    }
}

fn build_context(config: Config) -> Result<ReportContext> {
    let chat: Arc<dyn ChatCompletion> = match HttpChatClient::from_config(&config) {
        Ok(client) => Arc::new(client),
        Err(error) => {
            warn!("{error:#}");
            Arc::new(ai::MissingCredentials)
        }
    };
    let push: Arc<dyn PushGateway> = Arc::new(ExpoPushGateway::new(&config.push_endpoint)?);

    Ok(ReportContext::new(config, chat, push))
}

fn parse_now(raw: Option<&str>) -> Result<DateTime<Utc>> {
    match raw {
        Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .map(|parsed| parsed.with_timezone(&Utc))
            .with_context(|| format!("Invalid --now value: {raw}. Example: 2026-03-10T12:00:00Z")),
        None => Ok(Utc::now()),
    }
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Set { key, value } => {
            let mut config = load_or_default_config()?;
            config.set_value(&key, &value)?;
            config.ensure_bootstrap_files()?;
            config.save()?;

            let masked = if key.contains("key") || key.contains("secret") {
                "***hidden***".to_string()
            } else {
                value
            };
            println!("Config saved: {key} = {masked}");
            Ok(())
        }
        ConfigCommands::Get { key } => {
            let config = Config::resolve()?;
            let value = config
                .get_value(&key)
                .with_context(|| format!("Unsupported config key: {key}"))?;

            println!("{value}");
            Ok(())
        }
    }
}

fn handle_doctor() -> Result<()> {
    let config_path = Config::config_path()?;
    let mut issues = Vec::new();

    if config_path.exists() {
        println!("[OK] config.json found: {}", config_path.display());
    } else {
        println!("[WARN] config.json not found, using defaults: {}", config_path.display());
    }

    let config = Config::resolve()?;

    match Database::open(&config.db_path) {
        Ok(_) => println!("[OK] SQLite reachable: {}", config.db_path.display()),
        Err(error) => {
            println!("[WARN] SQLite check failed: {error:#}");
            issues.push("db unreachable");
        }
    }

    if config.ai_api_key.is_some() {
        println!("[OK] AI API key is configured ({})", config.ai_model);
    } else {
        println!("[WARN] AI API key is missing; report generation will fail");
        issues.push("ai api key missing");
    }

    if config.service_role_key.is_none() && config.cron_secret.is_none() {
        println!("[WARN] No service_role_key or cron_secret; the HTTP API accepts any caller");
        issues.push("api unauthenticated");
    } else {
        println!("[OK] API authentication configured");
    }

    for (name, value) in [
        ("default_timezone", &config.default_timezone),
        ("schedule_timezone", &config.schedule_timezone),
    ] {
        match config::parse_timezone(value) {
            Ok(_) => println!("[OK] {name} valid: {value}"),
            Err(error) => {
                println!("[WARN] {name} invalid: {error}");
                issues.push("invalid timezone");
            }
        }
    }

    for job in [Job::WeeklyReport, Job::StreakWarning, Job::Comeback] {
        let cron = job.cron(&config);
        match scheduler::parse_cron(&cron) {
            Ok(_) => println!("[OK] {} schedule valid: {cron}", job.name()),
            Err(error) => {
                println!("[WARN] {} schedule invalid: {error}", job.name());
                issues.push("invalid schedule");
            }
        }
    }

    println!(
        "[OK] report cache {}, {} worker(s)",
        if config.report_cache_enabled { "enabled" } else { "disabled" },
        config.report_workers
    );

    if issues.is_empty() {
        println!("doctor result: no issues");
    } else {
        println!("doctor result: {} warning(s)", issues.len());
    }

    Ok(())
}

fn handle_import(path: &Path) -> Result<()> {
    let config = Config::resolve()?;
    let snapshot = Snapshot::from_file(path)?;
    let database = Database::open(&config.db_path)?;
    let summary = database.import_snapshot(&snapshot)?;

    println!("Imported snapshot: {}", path.display());
    println!("- users: {}", summary.users);
    println!("- mandalarts: {}", summary.mandalarts);
    println!("- actions: {}", summary.actions);
    println!("- checks: {}", summary.checks);
    println!("- push tokens: {}", summary.push_tokens);
    Ok(())
}

fn handle_report(
    user_id: String,
    report_type: &str,
    mandalart_id: Option<String>,
    language: Option<&str>,
) -> Result<()> {
    let ctx = build_context(Config::resolve()?)?;
    let database = ctx.open_database()?;
    let report_type = report_type.parse::<ReportType>()?;

    let language = match language {
        Some(raw) => raw.parse::<Language>()?,
        None => database
            .user_profile(&user_id)?
            .map(|profile| pipeline::user_language(&ctx.config, &profile))
            .unwrap_or(ctx.config.default_language),
    };

    let request = ReportRequest {
        report_type,
        user_id,
        mandalart_id,
        language,
    };
    let outcome = pipeline::generate_report(&ctx, &database, &request, GenerateOptions::on_demand())?;

    println!(
        "Report {} ({}){}",
        outcome.report.id,
        outcome.report.report_type,
        if outcome.reused { " reused from cache" } else { "" }
    );
    match serde_json::from_str::<Value>(&outcome.report.content) {
        Ok(content) => println!("{}", serde_json::to_string_pretty(&content)?),
        Err(_) => println!("{}", outcome.report.content),
    }
    Ok(())
}

fn handle_reports(user_id: &str, limit: usize) -> Result<()> {
    let config = Config::resolve()?;
    let database = Database::open(&config.db_path)?;
    let reports = database.latest_reports(user_id, limit)?;

    if reports.is_empty() {
        println!("No reports for {user_id}");
        return Ok(());
    }

    for report in reports {
        let generated_at = DateTime::<Utc>::from_timestamp(report.generated_at, 0)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| report.generated_at.to_string());
        let origin = report
            .cached_from
            .map(|source| format!("cached from {source}"))
            .unwrap_or_else(|| report.model.clone().unwrap_or_else(|| "unknown model".to_string()));
        println!("{}\t{}\t{}\t{}", report.id, report.report_type, generated_at, origin);
    }

    Ok(())
}

fn handle_ai_command(command: AiCommands) -> Result<()> {
    match command {
        AiCommands::Test {
            key,
            base_url,
            model,
        } => {
            let mut config = Config::resolve()?;

            if let Some(value) = key {
                config.ai_api_key = Some(value);
            }
            if let Some(value) = base_url {
                config.ai_api_base_url = value;
            }
            if let Some(value) = model {
                config.ai_model = value;
            }

            let client = HttpChatClient::from_config(&config)?;
            let response = ai::test_connection(&client, &config.ai_model)?;
            println!("AI API connection successful");
            println!("{response}");

            Ok(())
        }
    }
}

fn handle_push_command(command: PushCommands) -> Result<()> {
    match command {
        PushCommands::Test { token, title, body } => {
            let config = Config::resolve()?;
            let gateway = ExpoPushGateway::new(&config.push_endpoint)?;
            let message = PushMessage::new(token, title, body, json!({"type": "test"}));

            let ticket = push::send_one(&gateway, message).map_err(|reason| anyhow!("Push failed: {reason}"))?;
            println!(
                "Push accepted{}",
                ticket.id.map(|id| format!(": {id}")).unwrap_or_default()
            );
            Ok(())
        }
    }
}

async fn run_service(config: Config) -> Result<()> {
    config.ensure_bootstrap_files()?;
    let _ = Database::open(&config.db_path)?;

    let ctx = Arc::new(build_context(config)?);

    info!("Mandalart report service started");

    tokio::select! {
        result = schedule(Arc::clone(&ctx), Job::WeeklyReport) => result?,
        result = schedule(Arc::clone(&ctx), Job::StreakWarning) => result?,
        result = schedule(Arc::clone(&ctx), Job::Comeback) => result?,
        api_result = api::run_server(Arc::clone(&ctx)) => api_result?,
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn schedule(ctx: Arc<ReportContext>, job: Job) -> Result<()> {
    let fallback = ctx.config.clone();

    scheduler::run_cron_scheduler(
        job.name(),
        move || -> Result<(String, Tz)> {
            let runtime = Config::resolve().unwrap_or_else(|_| fallback.clone());
            Ok((job.cron(&runtime), runtime.schedule_tz()?))
        },
        move |now| {
            let ctx = Arc::clone(&ctx);
            async move {
                let summary = tokio::task::spawn_blocking(move || job.run(&ctx, now))
                    .await
                    .context("Scheduled job panicked")??;
                info!(job = job.name(), summary = %summary, "scheduled job finished");
                Ok(())
            }
        },
    )
    .await
}

fn load_or_default_config() -> Result<Config> {
    if Config::config_path()?.exists() {
        Config::load()
    } else {
        Ok(Config::default())
    }
}
