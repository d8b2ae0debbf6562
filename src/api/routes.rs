use crate::api::envelope::{self, ApiError, ApiResult};
use crate::coaching::{self, CoachingRequest};
use crate::config::Config;
use crate::error::{ErrorCode, ReportError};
use crate::model::{Language, ReportRequest, ReportType};
use crate::pipeline::{self, GenerateOptions, ReportContext, batch};
use crate::push::{self, PushMessage};
use anyhow::Result;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, header};
use axum::response::Response;
use axum::routing::{get, post};
use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

const CRON_SECRET_HEADER: &str = "x-cron-secret";

#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<ReportContext>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/functions/v1/health", get(health))
        .route(
            "/functions/v1/scheduled-report",
            post(scheduled_report).options(preflight),
        )
        .route(
            "/functions/v1/generate-report",
            post(generate_report).options(preflight),
        )
        .route(
            "/functions/v1/send-push-notification",
            post(send_push_notification).options(preflight),
        )
        .route(
            "/functions/v1/streak-warning",
            post(streak_warning).options(preflight),
        )
        .route(
            "/functions/v1/comeback-notification",
            post(comeback_notification).options(preflight),
        )
        .route("/functions/v1/ai-coaching", post(ai_coaching).options(preflight))
        .with_state(state)
}

async fn preflight() -> Response {
    envelope::preflight()
}

async fn health(State(state): State<ApiState>) -> Response {
    envelope::success(json!({
        "status": "ok",
        "cache_enabled": state.ctx.config.report_cache_enabled,
        "workers": state.ctx.config.report_workers,
    }))
}

/// Accepts the service role key as a bearer token or the cron secret header.
/// With neither secret configured every caller is let through.
fn authorize(config: &Config, headers: &HeaderMap) -> ApiResult<()> {
    let service_key = config.service_role_key.as_deref();
    let cron_secret = config.cron_secret.as_deref();

    if service_key.is_none() && cron_secret.is_none() {
        warn!("No service_role_key or cron_secret configured; accepting request without authentication");
        return Ok(());
    }

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    let cron_header = headers
        .get(CRON_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim);

    let bearer_ok = matches!((service_key, bearer), (Some(expected), Some(given)) if expected == given);
    let cron_ok = matches!((cron_secret, cron_header), (Some(expected), Some(given)) if expected == given);

    if bearer_ok || cron_ok {
        Ok(())
    } else {
        Err(ApiError::new(ErrorCode::Unauthorized, "Missing or invalid credentials"))
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    let raw: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };

    serde_json::from_slice(raw).map_err(|error| {
        ApiError::new(ErrorCode::BadRequest, "Invalid JSON in request body")
            .with_details(json!({ "reason": error.to_string() }))
    })
}

async fn blocking<T, F>(job: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|join_error| ApiError::new(ErrorCode::InternalError, format!("Worker task failed: {join_error}")))?
        .map_err(ApiError::from)
}

async fn scheduled_report(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult {
    authorize(&state.ctx.config, &headers)?;
    let ctx = state.ctx.clone();
    let summary = blocking(move || batch::run_scheduled_reports(&ctx, Utc::now())).await?;
    Ok(envelope::success(summary))
}

async fn streak_warning(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult {
    authorize(&state.ctx.config, &headers)?;
    let ctx = state.ctx.clone();
    let summary = blocking(move || batch::run_streak_warnings(&ctx, Utc::now())).await?;
    Ok(envelope::success(summary))
}

async fn comeback_notification(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult {
    authorize(&state.ctx.config, &headers)?;
    let ctx = state.ctx.clone();
    let summary = blocking(move || batch::run_comeback_notifications(&ctx, Utc::now())).await?;
    Ok(envelope::success(summary))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateReportBody {
    report_type: Option<String>,
    user_id: Option<String>,
    mandalart_id: Option<String>,
    language: Option<String>,
}

async fn generate_report(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> ApiResult {
    authorize(&state.ctx.config, &headers)?;
    let body: GenerateReportBody = parse_body(&body)?;

    let report_type = body
        .report_type
        .as_deref()
        .ok_or_else(|| ApiError::new(ErrorCode::ValidationError, "report_type is required"))?
        .parse::<ReportType>()?;
    let user_id = body
        .user_id
        .filter(|user_id| !user_id.trim().is_empty())
        .ok_or_else(|| ApiError::new(ErrorCode::ValidationError, "user_id is required"))?;
    let requested_language = body.language.as_deref().map(str::parse::<Language>).transpose()?;

    let ctx = state.ctx.clone();
    let outcome = blocking(move || {
        let database = ctx.open_database()?;
        let language = match requested_language {
            Some(language) => language,
            None => database
                .user_profile(&user_id)?
                .map(|profile| pipeline::user_language(&ctx.config, &profile))
                .unwrap_or(ctx.config.default_language),
        };

        let request = ReportRequest {
            report_type,
            user_id,
            mandalart_id: body.mandalart_id,
            language,
        };
        pipeline::generate_report(&ctx, &database, &request, GenerateOptions::on_demand())
    })
    .await?;

    info!(
        report_id = outcome.report.id,
        reused = outcome.reused,
        "generate-report served"
    );
    Ok(envelope::success(outcome))
}

#[derive(Debug, Deserialize)]
struct PushBatchItem {
    push_token: String,
    title: String,
    body: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PushBody {
    user_id: Option<String>,
    push_token: Option<String>,
    title: Option<String>,
    body: Option<String>,
    data: Option<Value>,
    batch: Option<Vec<PushBatchItem>>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

async fn send_push_notification(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> ApiResult {
    authorize(&state.ctx.config, &headers)?;
    let body: PushBody = parse_body(&body)?;
    let ctx = state.ctx.clone();

    if let Some(items) = body.batch.filter(|items| !items.is_empty()) {
        let messages = items
            .into_iter()
            .map(|item| {
                PushMessage::new(
                    item.push_token,
                    item.title,
                    item.body,
                    item.data.unwrap_or_else(|| json!({})),
                )
            })
            .collect::<Vec<_>>();

        let summary = blocking(move || Ok(push::dispatch(ctx.push.as_ref(), &messages))).await?;
        return Ok(envelope::success(summary));
    }

    let title = non_blank(body.title)
        .ok_or_else(|| ApiError::new(ErrorCode::ValidationError, "title and body are required"))?;
    let text = non_blank(body.body)
        .ok_or_else(|| ApiError::new(ErrorCode::ValidationError, "title and body are required"))?;
    // Ok holds an explicit token, Err the user whose latest token is looked up.
    let target = match (non_blank(body.push_token), non_blank(body.user_id)) {
        (Some(token), _) => Ok(token),
        (None, Some(user_id)) => Err(user_id),
        (None, None) => {
            return Err(ApiError::new(
                ErrorCode::ValidationError,
                "push_token or user_id is required",
            ));
        }
    };

    let data = body.data.unwrap_or_else(|| json!({}));
    let summary = blocking(move || {
        let token = match target {
            Ok(token) => token,
            Err(user_id) => ctx.open_database()?.latest_push_token(&user_id)?.ok_or_else(|| {
                ReportError::NotFound(format!("No active push token found for user {user_id}"))
            })?,
        };

        let message = PushMessage::new(token, title, text, data);
        Ok(push::dispatch(ctx.push.as_ref(), std::slice::from_ref(&message)))
    })
    .await?;

    Ok(envelope::success(summary))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CoachingCaller {
    user_id: Option<String>,
}

async fn ai_coaching(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> ApiResult {
    authorize(&state.ctx.config, &headers)?;
    let raw: Value = parse_body(&body)?;
    let caller: CoachingCaller = parse_body(&body)?;
    let request = CoachingRequest::from_value(raw, state.ctx.config.default_language)?;

    let ctx = state.ctx.clone();
    let result = blocking(move || {
        let database = ctx.open_database()?;
        coaching::run(
            ctx.chat.as_ref(),
            &database,
            &ctx.config.ai_model,
            ctx.config.ai_max_tokens,
            caller.user_id.as_deref(),
            &request,
        )
    })
    .await?;

    Ok(envelope::success(result))
}
