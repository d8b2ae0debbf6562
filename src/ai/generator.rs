use crate::ai::{ChatCompletion, ChatRequest, TokenUsage, prompts};
use crate::config::GenerationSettings;
use crate::model::{Language, ReportType};
use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct GeneratedReport {
    pub content: String,
    pub model: String,
    pub valid_json: bool,
    pub used_fallback: bool,
    pub usage: TokenUsage,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("response is not valid JSON")]
    NotJson,
    #[error("response is not a JSON object")]
    NotObject,
    #[error("response is missing required fields: {0:?}")]
    MissingFields(Vec<&'static str>),
}

/// Removes a leading ```json / ``` fence and its closing fence.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    let rest = rest.strip_prefix("json").or_else(|| rest.strip_prefix("JSON")).unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parses model output as a JSON object, repairing surrounding prose when
/// the payload is embedded in it.
pub fn parse_json_object(raw: &str) -> Result<serde_json::Map<String, Value>, ParseFailure> {
    let cleaned = strip_code_fences(raw);

    let parsed = serde_json::from_str::<Value>(cleaned).ok().or_else(|| {
        outermost_object(cleaned).and_then(|span| serde_json::from_str::<Value>(span).ok())
    });

    match parsed {
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ParseFailure::NotObject),
        None => Err(ParseFailure::NotJson),
    }
}

pub fn parse_report(raw: &str, report_type: ReportType) -> Result<Value, ParseFailure> {
    let map = parse_json_object(raw)?;

    let missing = report_type
        .required_fields()
        .iter()
        .copied()
        .filter(|field| map.get(*field).is_none_or(Value::is_null))
        .collect::<Vec<_>>();

    if !missing.is_empty() {
        return Err(ParseFailure::MissingFields(missing));
    }

    Ok(Value::Object(map))
}

/// Generates report content. Always reaches a terminal state: valid JSON
/// from the primary model, valid JSON from one fallback attempt, or the
/// primary model's raw text.
pub fn generate(
    client: &dyn ChatCompletion,
    settings: &GenerationSettings,
    report_type: ReportType,
    language: Language,
    data: &Value,
) -> Result<GeneratedReport> {
    let prompt = prompts::build(report_type, language, data);
    let request_for = |model: &str| ChatRequest {
        model: model.to_string(),
        system: prompt.system.clone(),
        user: prompt.user.clone(),
        max_tokens: settings.max_tokens,
        temperature: settings.temperature,
    };

    let primary = client.complete(&request_for(&settings.model))?;

    let failure = match parse_report(&primary.content, report_type) {
        Ok(value) => {
            return Ok(GeneratedReport {
                content: value.to_string(),
                model: primary.model,
                valid_json: true,
                used_fallback: false,
                usage: primary.usage,
            });
        }
        Err(failure) => failure,
    };

    let raw_primary = GeneratedReport {
        content: strip_code_fences(&primary.content).to_string(),
        model: primary.model.clone(),
        valid_json: false,
        used_fallback: false,
        usage: primary.usage,
    };

    let Some(fallback_model) = settings.distinct_fallback() else {
        warn!(
            report_type = %report_type,
            model = %primary.model,
            reason = %failure,
            "AI response invalid and no fallback model configured; storing raw text"
        );
        return Ok(raw_primary);
    };

    info!(
        report_type = %report_type,
        model = %primary.model,
        fallback_model = %fallback_model,
        reason = %failure,
        "AI response invalid; retrying with fallback model"
    );

    let fallback = match client.complete(&request_for(fallback_model)) {
        Ok(response) => response,
        Err(error) => {
            warn!(
                report_type = %report_type,
                fallback_model = %fallback_model,
                "Fallback model call failed; storing primary raw text: {error:#}"
            );
            return Ok(raw_primary);
        }
    };

    let usage = TokenUsage {
        prompt_tokens: primary.usage.prompt_tokens + fallback.usage.prompt_tokens,
        completion_tokens: primary.usage.completion_tokens + fallback.usage.completion_tokens,
    };

    match parse_report(&fallback.content, report_type) {
        Ok(value) => Ok(GeneratedReport {
            content: value.to_string(),
            model: fallback.model,
            valid_json: true,
            used_fallback: true,
            usage,
        }),
        Err(failure) => {
            warn!(
                report_type = %report_type,
                fallback_model = %fallback_model,
                reason = %failure,
                "Fallback response also invalid; storing primary raw text"
            );
            Ok(GeneratedReport { usage, ..raw_primary })
        }
    }
}
