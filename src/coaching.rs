//! Goal-setting assistance: sub-goal suggestions, tiered actions and a
//! reality check of a whole plan.

use crate::ai::generator::parse_json_object;
use crate::ai::{ChatCompletion, ChatRequest, TokenUsage};
use crate::db::Database;
use crate::error::ReportError;
use crate::model::Language;
use anyhow::Result;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{info, warn};

const COACHING_TEMPERATURE: f32 = 0.1;
/// Rough Sonar price per 1k tokens, in USD.
const COST_PER_1K_TOKENS: f64 = 0.0002;

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubGoalPayload {
    pub persona: String,
    pub core_goal: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub available_time: String,
    #[serde(default)]
    pub energy_peak: String,
    #[serde(default)]
    pub priority_area: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionsPayload {
    pub sub_goals: Vec<String>,
    #[serde(default)]
    pub persona: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub available_time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealityCheckPayload {
    pub core_goal: String,
    #[serde(default)]
    pub sub_goals: Vec<String>,
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub available_time: String,
    #[serde(default)]
    pub energy_peak: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum CoachingCall {
    SuggestSubGoals(SubGoalPayload),
    GenerateActions(ActionsPayload),
    RealityCheck(RealityCheckPayload),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoachingEnvelope {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    language: Option<Language>,
}

#[derive(Debug, Clone)]
pub struct CoachingRequest {
    pub call: CoachingCall,
    pub session_id: Option<String>,
    pub language: Language,
}

impl CoachingRequest {
    pub fn from_value(body: Value, default_language: Language) -> Result<Self, ReportError> {
        if body.get("action").and_then(Value::as_str).is_none() {
            return Err(ReportError::Validation("action is required".to_string()));
        }

        let envelope: CoachingEnvelope = serde_json::from_value(body.clone()).unwrap_or_default();
        let call: CoachingCall = serde_json::from_value(body)
            .map_err(|error| ReportError::Validation(format!("Invalid coaching request: {error}")))?;

        Ok(Self {
            call,
            session_id: envelope.session_id,
            language: envelope.language.unwrap_or(default_language),
        })
    }
}

fn prompts(call: &CoachingCall, language: Language) -> (String, String) {
    match (call, language) {
        (CoachingCall::SuggestSubGoals(payload), Language::Ko) => (
            "당신은 만다라트 목표 설정을 돕는 따뜻하고 전문적인 코치입니다. 사용자의 페르소나와 핵심 목표를 바탕으로 균형 잡힌 8개의 서브 목표를 제안하세요. 우선순위 영역을 반영하세요.\n\n응답 형식 (JSON):\n{\"sub_goals\": [\"목표1\", \"...\", \"목표8\"]}".to_string(),
            format!(
                "페르소나: {}\n핵심 목표: {}\n확보 가능 시간: {}분\n에너지 피크: {}\n우선순위 영역: {}",
                payload.persona, payload.core_goal, payload.available_time, payload.energy_peak, payload.priority_area
            ),
        ),
        (CoachingCall::SuggestSubGoals(payload), Language::En) => (
            "You are a warm, expert coach helping users set up a mandalart. Based on the persona and core goal, propose 8 balanced sub-goals that reflect the priority area.\n\nResponse format (JSON):\n{\"sub_goals\": [\"goal1\", \"...\", \"goal8\"]}".to_string(),
            format!(
                "Persona: {}\nCore goal: {}\nAvailable time: {} minutes\nEnergy peak: {}\nPriority area: {}",
                payload.persona, payload.core_goal, payload.available_time, payload.energy_peak, payload.priority_area
            ),
        ),
        (CoachingCall::GenerateActions(payload), Language::Ko) => (
            format!(
                "당신은 만다라트의 각 서브 목표에 대해 3단계 실천 항목을 만드는 전문가입니다. base(20~30분), minimum(5~10분), challenge(40~60분) 버전을 만드세요. 각 항목은 구체적이고 측정 가능해야 합니다. 확보 가능 시간은 {}분입니다.\n\n응답 형식 (JSON):\n{{\"actions\": [{{\"sub_goal\": \"...\", \"base\": \"...\", \"minimum\": \"...\", \"challenge\": \"...\"}}]}}",
                payload.available_time
            ),
            format!(
                "서브 목표 목록: {}\n페르소나: {}\n확보 가능 시간: {}분",
                payload.sub_goals.join(", "),
                payload.persona,
                payload.available_time
            ),
        ),
        (CoachingCall::GenerateActions(payload), Language::En) => (
            format!(
                "You write three tiers of actions for each mandalart sub-goal: base (20-30 min), minimum (5-10 min) and challenge (40-60 min). Every action must be concrete and measurable. The user has {} minutes available.\n\nResponse format (JSON):\n{{\"actions\": [{{\"sub_goal\": \"...\", \"base\": \"...\", \"minimum\": \"...\", \"challenge\": \"...\"}}]}}",
                payload.available_time
            ),
            format!(
                "Sub-goals: {}\nPersona: {}\nAvailable time: {} minutes",
                payload.sub_goals.join(", "),
                payload.persona,
                payload.available_time
            ),
        ),
        (CoachingCall::RealityCheck(payload), Language::Ko) => (
            "당신은 목표의 현실성을 점검하고 수정을 제안하는 코치입니다. 시간 과부하, 측정 가능성, 에너지 매칭 기준으로 계획을 분석하세요.\n\n응답 형식 (JSON):\n{\"corrections\": [{\"original\": \"...\", \"suggested\": \"...\", \"reason\": \"...\"}], \"overall_feedback\": \"...\"}".to_string(),
            format!(
                "확보 가능 시간: {}분\n에너지 피크: {}\n핵심 목표: {}\n서브 목표: {}\n계획 상세: {}",
                payload.available_time,
                payload.energy_peak,
                payload.core_goal,
                payload.sub_goals.join(", "),
                Value::Array(payload.actions.clone())
            ),
        ),
        (CoachingCall::RealityCheck(payload), Language::En) => (
            "You check whether a plan is realistic and suggest corrections. Judge time overload, measurability and energy matching.\n\nResponse format (JSON):\n{\"corrections\": [{\"original\": \"...\", \"suggested\": \"...\", \"reason\": \"...\"}], \"overall_feedback\": \"...\"}".to_string(),
            format!(
                "Available time: {} minutes\nEnergy peak: {}\nCore goal: {}\nSub-goals: {}\nPlan: {}",
                payload.available_time,
                payload.energy_peak,
                payload.core_goal,
                payload.sub_goals.join(", "),
                Value::Array(payload.actions.clone())
            ),
        ),
    }
}

pub fn estimate_cost(usage: TokenUsage) -> f64 {
    (usage.prompt_tokens + usage.completion_tokens) as f64 * COST_PER_1K_TOKENS / 1000.0
}

pub fn run(
    chat: &dyn ChatCompletion,
    database: &Database,
    model: &str,
    max_tokens: u32,
    user_id: Option<&str>,
    request: &CoachingRequest,
) -> Result<Value> {
    let (system, user) = prompts(&request.call, request.language);
    let response = chat.complete(&ChatRequest {
        model: model.to_string(),
        system,
        user,
        max_tokens,
        temperature: COACHING_TEMPERATURE,
    })?;

    if user_id.is_some() || request.session_id.is_some() {
        let cost = estimate_cost(response.usage);
        if let Err(log_error) = database.insert_coaching_cost(
            user_id,
            request.session_id.as_deref(),
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
            cost,
        ) {
            warn!("Failed to record coaching cost: {log_error:#}");
        }
    }

    let parsed = parse_json_object(&response.content).map_err(|failure| {
        ReportError::ExternalService(format!("Coaching response was not usable JSON: {failure}"))
    })?;

    info!(session_id = ?request.session_id, "Coaching response generated");
    Ok(Value::Object(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, classify};
    use crate::test_support::{FakeChat, seeded_database};
    use serde_json::json;

    #[test]
    fn parses_tagged_actions() {
        let request = CoachingRequest::from_value(
            json!({
                "action": "suggest_sub_goals",
                "sessionId": "s-1",
                "payload": {"persona": "직장인", "coreGoal": "건강", "availableTime": 30, "energyPeak": "아침", "priorityArea": "운동"}
            }),
            Language::Ko,
        )
        .unwrap();

        assert_eq!(request.session_id.as_deref(), Some("s-1"));
        match request.call {
            CoachingCall::SuggestSubGoals(payload) => assert_eq!(payload.available_time, "30"),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_or_missing_action() {
        let missing = CoachingRequest::from_value(json!({"payload": {}}), Language::Ko).unwrap_err();
        assert_eq!(missing.code(), ErrorCode::ValidationError);

        let unknown = CoachingRequest::from_value(json!({"action": "dance", "payload": {}}), Language::Ko);
        assert!(unknown.is_err());
    }

    #[test]
    fn records_cost_and_returns_json() {
        let (_dir, database) = seeded_database();
        let chat = FakeChat::always(r#"{"sub_goals": ["a","b"]}"#.to_string());
        let request = CoachingRequest::from_value(
            json!({"action": "generate_actions", "payload": {"subGoals": ["운동"], "availableTime": "20"}}),
            Language::Ko,
        )
        .unwrap();

        let value = run(&chat, &database, "sonar", 800, Some("u1"), &request).unwrap();
        assert_eq!(value["sub_goals"][1], "b");
        assert_eq!(chat.calls(), vec!["sonar".to_string()]);
    }

    #[test]
    fn invalid_json_is_an_external_service_error() {
        let (_dir, database) = seeded_database();
        let chat = FakeChat::always("I cannot help with that".to_string());
        let request = CoachingRequest::from_value(
            json!({"action": "reality_check", "payload": {"coreGoal": "x"}}),
            Language::En,
        )
        .unwrap();

        let error = run(&chat, &database, "sonar", 800, None, &request).unwrap_err();
        assert_eq!(classify(&error), ErrorCode::ExternalServiceError);
    }

    #[test]
    fn cost_estimate() {
        let usage = TokenUsage {
            prompt_tokens: 600,
            completion_tokens: 400,
        };
        assert!((estimate_cost(usage) - 0.0002).abs() < f64::EPSILON);
    }
}
