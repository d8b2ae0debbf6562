pub mod batch;

use crate::ai::ChatCompletion;
use crate::ai::generator;
use crate::analyzer;
use crate::cache;
use crate::config::{self, Config, GenerationSettings};
use crate::db::{CompletionOutcome, Database, ReportCompletion, StoredReport, UserProfile};
use crate::error::ReportError;
use crate::model::{Language, ReportRequest, ReportType};
use crate::period::{self, PeriodBounds};
use crate::push::PushGateway;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything one invocation needs. Generation settings are resolved once
/// when the context is built.
#[derive(Clone)]
pub struct ReportContext {
    pub config: Config,
    pub chat: Arc<dyn ChatCompletion>,
    pub push: Arc<dyn PushGateway>,
    settings: HashMap<ReportType, GenerationSettings>,
}

impl ReportContext {
    pub fn new(config: Config, chat: Arc<dyn ChatCompletion>, push: Arc<dyn PushGateway>) -> Self {
        Self::with_env(config, chat, push, |key| std::env::var(key).ok())
    }

    pub fn with_env<F>(config: Config, chat: Arc<dyn ChatCompletion>, push: Arc<dyn PushGateway>, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = ReportType::ALL
            .into_iter()
            .map(|kind| (kind, GenerationSettings::resolve(&config, kind, &env)))
            .collect();

        Self {
            config,
            chat,
            push,
            settings,
        }
    }

    pub fn settings_for(&self, report_type: ReportType) -> GenerationSettings {
        self.settings
            .get(&report_type)
            .cloned()
            .unwrap_or_else(|| GenerationSettings::resolve(&self.config, report_type, |_| None))
    }

    pub fn open_database(&self) -> Result<Database> {
        Database::open(&self.config.db_path)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub now: DateTime<Utc>,
    pub scheduled: bool,
}

impl GenerateOptions {
    pub fn on_demand() -> Self {
        Self {
            now: Utc::now(),
            scheduled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub report: StoredReport,
    pub reused: bool,
    pub valid_json: bool,
}

/// Falls back to the configured default for unset or blank zones; an
/// unparseable IANA name is a validation error.
pub fn user_timezone(config: &Config, profile: &UserProfile) -> Result<Tz> {
    match profile.timezone.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => config::parse_timezone(raw)
            .map_err(|error| ReportError::Validation(format!("{error:#}")).into()),
        _ => config.default_tz(),
    }
}

pub fn user_language(config: &Config, profile: &UserProfile) -> Language {
    profile
        .language
        .as_deref()
        .and_then(|raw| raw.parse::<Language>().ok())
        .unwrap_or(config.default_language)
}

struct PreparedInput {
    data: Value,
    cache_key: String,
    input_hash: String,
    period: Option<PeriodBounds>,
    mandalart_id: Option<String>,
}

pub fn generate_report(
    ctx: &ReportContext,
    database: &Database,
    request: &ReportRequest,
    options: GenerateOptions,
) -> Result<ReportOutcome> {
    request.validate()?;

    let profile = database
        .user_profile(&request.user_id)?
        .ok_or_else(|| ReportError::NotFound(format!("User not found: {}", request.user_id)))?;
    let tz = user_timezone(&ctx.config, &profile)?;

    let pending_id = database.insert_pending_report(&request.user_id, request.report_type, options.now)?;

    match build_and_store(ctx, database, request, tz, pending_id, options) {
        Ok(outcome) => Ok(outcome),
        Err(error) => {
            if let Err(cleanup) = database.delete_report(pending_id) {
                warn!(report_id = pending_id, "Failed to remove pending report: {cleanup:#}");
            }
            Err(error)
        }
    }
}

fn prepare_input(
    database: &Database,
    request: &ReportRequest,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<PreparedInput> {
    let report_type = request.report_type;
    let language = request.language;

    let (data, cache_key, period, mandalart_id) = match report_type.lookback_days() {
        None => {
            let input =
                analyzer::collect_diagnosis_input(database, &request.user_id, request.mandalart_id.as_deref())?;
            let content_hash = cache::mandalart_content_hash(&input.mandalart);
            let key = cache::diagnosis_cache_key(language, &input.mandalart.id, &content_hash);
            let mandalart_id = input.mandalart.id.clone();
            (analyzer::to_summary(&input)?, key, None, Some(mandalart_id))
        }
        Some(lookback_days) => {
            let bounds = period::resolve(tz, lookback_days, now)?;
            let input = analyzer::collect_period_input(
                database,
                &request.user_id,
                request.mandalart_id.as_deref(),
                tz,
                language,
                &bounds,
            )?;
            let key = cache::period_cache_key(report_type, language, &bounds);
            (
                analyzer::to_summary(&input)?,
                key,
                Some(bounds),
                request.mandalart_id.clone(),
            )
        }
    };

    let input_hash = cache::input_hash(report_type.prompt_version(), report_type, language, &data);

    Ok(PreparedInput {
        data,
        cache_key,
        input_hash,
        period,
        mandalart_id,
    })
}

fn build_and_store(
    ctx: &ReportContext,
    database: &Database,
    request: &ReportRequest,
    tz: Tz,
    pending_id: i64,
    options: GenerateOptions,
) -> Result<ReportOutcome> {
    let report_type = request.report_type;
    let prepared = prepare_input(database, request, tz, options.now)?;
    let cache_enabled = ctx.config.report_cache_enabled;

    let base_metadata = json!({
        "generated_at": options.now.to_rfc3339_opts(SecondsFormat::Secs, true),
        "scheduled": options.scheduled,
        "cache_key": prepared.cache_key,
        "language": request.language.as_str(),
        "period": prepared.period,
        "mandalart_id": prepared.mandalart_id,
    });

    let reusable = if cache_enabled {
        cache::find_reusable(
            database,
            &request.user_id,
            report_type,
            &prepared.cache_key,
            &prepared.input_hash,
            Some(pending_id),
        )?
    } else {
        None
    };

    if let Some(hit) = reusable {
        info!(
            user_id = %request.user_id,
            report_type = %report_type,
            cached_from = hit.id,
            "Reusing cached report"
        );
        return store_reuse(database, report_type, pending_id, &prepared, &hit, &base_metadata);
    }

    let settings = ctx.settings_for(report_type);
    let generated = generator::generate(
        ctx.chat.as_ref(),
        &settings,
        report_type,
        request.language,
        &prepared.data,
    )?;

    let mut metadata = base_metadata.clone();
    metadata["valid_json"] = json!(generated.valid_json);
    metadata["used_fallback"] = json!(generated.used_fallback);
    metadata["usage"] = json!(generated.usage);

    let completion = ReportCompletion {
        content: &generated.content,
        cache_key: &prepared.cache_key,
        input_hash: &prepared.input_hash,
        prompt_version: report_type.prompt_version(),
        model: &generated.model,
        cached_from: None,
        bypass_cache: !cache_enabled,
        metadata: &metadata,
    };

    match database.complete_report(pending_id, &completion)? {
        CompletionOutcome::Stored => {
            info!(
                user_id = %request.user_id,
                report_type = %report_type,
                report_id = pending_id,
                model = %generated.model,
                "Report generated"
            );
            Ok(ReportOutcome {
                report: load_report(database, pending_id)?,
                reused: false,
                valid_json: generated.valid_json,
            })
        }
        CompletionOutcome::DuplicateGenerated => {
            warn!(
                user_id = %request.user_id,
                report_type = %report_type,
                "Concurrent generation already stored this report; keeping the first"
            );
            let winner = cache::find_reusable(
                database,
                &request.user_id,
                report_type,
                &prepared.cache_key,
                &prepared.input_hash,
                Some(pending_id),
            )?
            .ok_or_else(|| anyhow!("Duplicate report detected but no stored row was found"))?;

            store_reuse(database, report_type, pending_id, &prepared, &winner, &base_metadata)
        }
    }
}

fn store_reuse(
    database: &Database,
    report_type: ReportType,
    pending_id: i64,
    prepared: &PreparedInput,
    source: &StoredReport,
    base_metadata: &Value,
) -> Result<ReportOutcome> {
    // Chains of reuse point at the row that was actually generated.
    let origin = source.cached_from.unwrap_or(source.id);
    let mut metadata = base_metadata.clone();
    metadata["cached_from"] = json!(origin);
    let model = source.model.clone().unwrap_or_default();

    let completion = ReportCompletion {
        content: &source.content,
        cache_key: &prepared.cache_key,
        input_hash: &prepared.input_hash,
        prompt_version: report_type.prompt_version(),
        model: &model,
        cached_from: Some(origin),
        bypass_cache: false,
        metadata: &metadata,
    };
    database.complete_report(pending_id, &completion)?;

    let valid_json = generator::parse_report(&source.content, report_type).is_ok();
    Ok(ReportOutcome {
        report: load_report(database, pending_id)?,
        reused: true,
        valid_json,
    })
}

fn load_report(database: &Database, id: i64) -> Result<StoredReport> {
    database
        .report_by_id(id)?
        .with_context(|| format!("Report {id} disappeared after write"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeChat, FakePush, context_with, seeded_database, ts, valid_weekly_json};
    use rusqlite::params;

    fn weekly(user_id: &str) -> ReportRequest {
        ReportRequest {
            report_type: ReportType::Weekly,
            user_id: user_id.to_string(),
            mandalart_id: None,
            language: Language::Ko,
        }
    }

    fn at(now: &str) -> GenerateOptions {
        GenerateOptions {
            now: ts(now),
            scheduled: false,
        }
    }

    #[test]
    fn second_run_reuses_first_without_calling_the_model() {
        let (dir, database) = seeded_database();
        let chat = Arc::new(FakeChat::always(valid_weekly_json()));
        let ctx = context_with(&dir, chat.clone(), Arc::new(FakePush::default()));

        let first = generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T03:00:00Z")).unwrap();
        let second = generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T09:00:00Z")).unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(chat.calls().len(), 1);
        assert_eq!(first.report.cache_key, second.report.cache_key);
        assert_eq!(first.report.input_hash, second.report.input_hash);
        assert_eq!(second.report.content, first.report.content);
        assert_eq!(second.report.cached_from, Some(first.report.id));
        assert_eq!(second.report.metadata["cached_from"], first.report.id);
        assert_eq!(
            first.report.cache_key.as_deref(),
            Some("weekly:ko:Asia/Seoul:2026-03-03:2026-03-09")
        );

        let third = generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T10:00:00Z")).unwrap();
        assert_eq!(third.report.cached_from, Some(first.report.id));
    }

    #[test]
    fn fallback_model_output_is_what_gets_stored() {
        let (dir, database) = seeded_database();
        let chat = Arc::new(FakeChat::scripted(vec![
            Ok("Sorry, I cannot produce JSON today.".to_string()),
            Ok(valid_weekly_json()),
        ]));
        let config = Config {
            db_path: dir.path().join("reports.db"),
            ai_fallback_model: Some("sonar-pro".to_string()),
            ..Config::default()
        };
        let ctx = ReportContext::with_env(config, chat.clone(), Arc::new(FakePush::default()), |_| None);

        let outcome = generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T03:00:00Z")).unwrap();

        assert_eq!(chat.calls(), vec![config::DEFAULT_MODEL.to_string(), "sonar-pro".to_string()]);
        let stored = &database.latest_reports("u1", 1).unwrap()[0];
        assert_eq!(stored.id, outcome.report.id);
        assert_eq!(stored.model.as_deref(), Some("sonar-pro"));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&stored.content).unwrap()["headline"],
            "꾸준함이 빛난 한 주"
        );
        assert_eq!(stored.metadata["used_fallback"], true);
        assert_eq!(stored.metadata["valid_json"], true);
    }

    #[test]
    fn moving_a_check_out_of_the_window_forces_regeneration() {
        let (dir, database) = seeded_database();
        let chat = Arc::new(FakeChat::always(valid_weekly_json()));
        let ctx = context_with(&dir, chat.clone(), Arc::new(FakePush::default()));

        let first = generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T03:00:00Z")).unwrap();

        let moved_to = ts("2026-03-12T03:00:00Z").timestamp();
        database_conn(&dir)
            .execute(
                "UPDATE check_history SET checked_at = ?1
                 WHERE id = (SELECT MAX(id) FROM check_history WHERE user_id = 'u1')",
                params![moved_to],
            )
            .unwrap();

        let second = generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T04:00:00Z")).unwrap();

        assert!(!second.reused);
        assert_eq!(chat.calls().len(), 2);
        assert_eq!(first.report.cache_key, second.report.cache_key);
        assert_ne!(first.report.input_hash, second.report.input_hash);
    }

    #[test]
    fn empty_week_still_generates() {
        let (dir, database) = seeded_database();
        let chat = Arc::new(FakeChat::always(valid_weekly_json()));
        let ctx = context_with(&dir, chat.clone(), Arc::new(FakePush::default()));

        let outcome = generate_report(&ctx, &database, &weekly("u2"), at("2026-03-10T03:00:00Z")).unwrap();

        assert!(!outcome.reused);
        assert_eq!(chat.calls().len(), 1);
        assert!(chat.last_user_prompt().contains("총 실천 횟수: 0회"));
    }

    #[test]
    fn diagnosis_key_changes_when_plan_is_edited() {
        let (dir, database) = seeded_database();
        let chat = Arc::new(FakeChat::always(
            r#"{"headline":"h","structure_metrics":[],"strengths":[],"improvements":[],"priority_tasks":[]}"#
                .to_string(),
        ));
        let ctx = context_with(&dir, chat.clone(), Arc::new(FakePush::default()));
        let request = ReportRequest {
            report_type: ReportType::Diagnosis,
            ..weekly("u1")
        };

        let first = generate_report(&ctx, &database, &request, at("2026-03-10T03:00:00Z")).unwrap();
        database_conn(&dir)
            .execute("UPDATE actions SET title = 'Run 10km' WHERE id = 'a1'", [])
            .unwrap();
        let second = generate_report(&ctx, &database, &request, at("2026-03-10T04:00:00Z")).unwrap();

        assert!(!second.reused);
        assert_ne!(first.report.cache_key, second.report.cache_key);
        assert!(first.report.cache_key.unwrap().starts_with("diagnosis:ko:m1:"));
    }

    #[test]
    fn disabled_cache_always_regenerates() {
        let (dir, database) = seeded_database();
        let chat = Arc::new(FakeChat::always(valid_weekly_json()));
        let mut ctx = context_with(&dir, chat.clone(), Arc::new(FakePush::default()));
        ctx.config.report_cache_enabled = false;

        generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T03:00:00Z")).unwrap();
        let second = generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T04:00:00Z")).unwrap();

        assert!(!second.reused);
        assert_eq!(chat.calls().len(), 2);
    }

    #[test]
    fn pending_placeholder_is_never_reused() {
        let (dir, database) = seeded_database();
        let chat = Arc::new(FakeChat::always(valid_weekly_json()));
        let ctx = context_with(&dir, chat.clone(), Arc::new(FakePush::default()));

        let first = generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T03:00:00Z")).unwrap();
        database_conn(&dir)
            .execute(
                "UPDATE ai_reports SET content = 'pending' WHERE id = ?1",
                params![first.report.id],
            )
            .unwrap();

        let second = generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T04:00:00Z")).unwrap();
        assert!(!second.reused);
        assert_eq!(chat.calls().len(), 2);
    }

    #[test]
    fn failed_generation_removes_the_pending_row() {
        let (dir, database) = seeded_database();
        let chat = Arc::new(FakeChat::scripted(vec![Err("AI API error 503".to_string())]));
        let ctx = context_with(&dir, chat, Arc::new(FakePush::default()));

        let result = generate_report(&ctx, &database, &weekly("u1"), at("2026-03-10T03:00:00Z"));
        assert!(result.is_err());
        assert!(database.latest_reports("u1", 10).unwrap().is_empty());
    }

    #[test]
    fn unknown_user_is_not_found() {
        let (dir, database) = seeded_database();
        let ctx = context_with(
            &dir,
            Arc::new(FakeChat::always(valid_weekly_json())),
            Arc::new(FakePush::default()),
        );
        let error = generate_report(&ctx, &database, &weekly("ghost"), at("2026-03-10T03:00:00Z")).unwrap_err();
        assert_eq!(crate::error::classify(&error), crate::error::ErrorCode::NotFound);
    }

    fn database_conn(dir: &tempfile::TempDir) -> rusqlite::Connection {
        rusqlite::Connection::open(dir.path().join("reports.db")).unwrap()
    }
}
