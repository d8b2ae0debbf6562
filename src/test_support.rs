use crate::ai::{ChatCompletion, ChatRequest, ChatResponse, TokenUsage};
use crate::config::Config;
use crate::db::Database;
use crate::db::snapshot::Snapshot;
use crate::error::ReportError;
use crate::pipeline::ReportContext;
use crate::push::{PushGateway, PushMessage, PushTicket, TicketStatus};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid RFC 3339 timestamp")
        .with_timezone(&Utc)
}

pub fn valid_weekly_json() -> String {
    json!({
        "headline": "꾸준함이 빛난 한 주",
        "key_metrics": [{"label": "실천", "value": "3회"}],
        "strengths": ["아침 루틴"],
        "improvements": {"focus": "독서"},
        "action_plan": {"next_week": ["주 3회 독서"]}
    })
    .to_string()
}

/// Chat model double. Scripted replies are consumed in order; `always`
/// repeats one reply forever.
#[derive(Default)]
pub struct FakeChat {
    script: Mutex<VecDeque<Result<String, String>>>,
    always: Option<String>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeChat {
    pub fn always(reply: String) -> Self {
        Self {
            always: Some(reply),
            ..Self::default()
        }
    }

    pub fn scripted(replies: Vec<Result<String, String>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|request| request.model.clone())
            .collect()
    }

    pub fn last_user_prompt(&self) -> String {
        self.requests
            .lock()
            .expect("requests lock")
            .last()
            .map(|request| request.user.clone())
            .unwrap_or_default()
    }
}

impl ChatCompletion for FakeChat {
    fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().expect("requests lock").push(request.clone());

        let scripted = self.script.lock().expect("script lock").pop_front();
        let reply = match (scripted, &self.always) {
            (Some(reply), _) => reply,
            (None, Some(always)) => Ok(always.clone()),
            (None, None) => Err("script exhausted".to_string()),
        };

        match reply {
            Ok(content) => Ok(ChatResponse {
                content,
                model: request.model.clone(),
                usage: TokenUsage {
                    prompt_tokens: 120,
                    completion_tokens: 80,
                },
            }),
            Err(message) => Err(anyhow!(ReportError::ExternalService(message))),
        }
    }
}

#[derive(Default)]
pub struct FakePush {
    fail: bool,
    batches: Mutex<Vec<usize>>,
}

impl FakePush {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().expect("batches lock").clone()
    }
}

impl PushGateway for FakePush {
    fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>> {
        self.batches.lock().expect("batches lock").push(messages.len());

        if self.fail {
            return Err(ReportError::ExternalService("Push API error 503".to_string()).into());
        }

        Ok(messages
            .iter()
            .enumerate()
            .map(|(index, _)| PushTicket {
                status: TicketStatus::Ok,
                id: Some(format!("ticket-{index}")),
                message: None,
                details: None,
            })
            .collect())
    }
}

pub fn context_with(dir: &TempDir, chat: Arc<dyn ChatCompletion>, push: Arc<dyn PushGateway>) -> ReportContext {
    let config = Config {
        db_path: dir.path().join("reports.db"),
        ..Config::default()
    };
    ReportContext::with_env(config, chat, push, |_| None)
}

/// Two users in Seoul's default zone. u1 has three checks in the week of
/// 2026-03-03 and one in the week before; u2 has none.
pub fn seeded_database() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("temp dir");
    let database = Database::open(&dir.path().join("reports.db")).expect("open database");

    let snapshot: Snapshot = serde_json::from_value(json!({
        "users": [
            {"id": "u1", "email": "minji@example.com", "nickname": "민지", "timezone": "Asia/Seoul", "language": "ko"},
            {"id": "u2", "email": "sam@example.com", "nickname": "", "timezone": null, "language": "en"}
        ],
        "mandalarts": [
            {"id": "m1", "user_id": "u1", "title": "2026 건강", "center_goal": "건강한 한 해"},
            {"id": "m2", "user_id": "u2", "title": "Focus", "center_goal": "Ship more"}
        ],
        "sub_goals": [
            {"id": "s2", "mandalart_id": "m1", "title": "Read", "position": 2},
            {"id": "s1", "mandalart_id": "m1", "title": "Run", "position": 1}
        ],
        "actions": [
            {"id": "a1", "sub_goal_id": "s1", "title": "Run 5km", "position": 1, "type": "routine", "routine_frequency": "daily"},
            {"id": "a2", "sub_goal_id": "s1", "title": "Stretch", "position": 2, "type": "mission", "mission_completion_type": "once"},
            {"id": "a3", "sub_goal_id": "s2", "title": "Read 20 pages", "position": 1, "type": "routine"}
        ],
        "check_history": [
            {"user_id": "u1", "action_id": "a1", "checked_at": "2026-02-25T01:00:00Z"},
            {"user_id": "u1", "action_id": "a1", "checked_at": "2026-03-03T01:00:00Z"},
            {"user_id": "u1", "action_id": "a1", "checked_at": "2026-03-04T01:00:00Z"},
            {"user_id": "u1", "action_id": "a3", "checked_at": "2026-03-04T10:00:00Z"}
        ],
        "user_stats": [
            {"user_id": "u1", "current_streak": 4, "longest_streak": 10},
            {"user_id": "u2", "current_streak": 5, "longest_streak": 5}
        ],
        "achievements": [{"id": "b1", "title": "First week"}],
        "user_achievements": [{"user_id": "u1", "achievement_id": "b1", "earned_at": "2026-03-05T00:00:00Z"}],
        "push_tokens": [
            {"user_id": "u1", "token": "ExponentPushToken[u1]"},
            {"user_id": "u2", "token": "ExpoPushToken[u2]"}
        ]
    }))
    .expect("seed snapshot");

    database.import_snapshot(&snapshot).expect("import seed");
    (dir, database)
}

/// Adds a user with one empty active mandalart and no push token.
pub fn add_user(database: &Database, user_id: &str, timezone: Option<&str>) {
    let snapshot: Snapshot = serde_json::from_value(json!({
        "users": [{"id": user_id, "email": format!("{user_id}@example.com"), "timezone": timezone}],
        "mandalarts": [{"id": format!("m-{user_id}"), "user_id": user_id, "title": "Plan"}]
    }))
    .expect("user snapshot");

    database.import_snapshot(&snapshot).expect("import user");
}
