use super::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Export of the hosted tables the reporting jobs read.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub users: Vec<SnapshotUser>,
    pub mandalarts: Vec<SnapshotMandalart>,
    pub sub_goals: Vec<SnapshotSubGoal>,
    pub actions: Vec<SnapshotAction>,
    pub check_history: Vec<SnapshotCheck>,
    pub user_stats: Vec<SnapshotUserStats>,
    pub achievements: Vec<SnapshotAchievement>,
    pub user_achievements: Vec<SnapshotUserAchievement>,
    pub push_tokens: Vec<SnapshotPushToken>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub nickname: String,
    pub timezone: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotMandalart {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub center_goal: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotSubGoal {
    pub id: String,
    pub mandalart_id: String,
    #[serde(default)]
    pub title: String,
    pub position: i64,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotAction {
    pub id: String,
    pub sub_goal_id: String,
    #[serde(default)]
    pub title: String,
    pub position: i64,
    #[serde(rename = "type")]
    pub action_type: Option<String>,
    pub routine_frequency: Option<String>,
    pub mission_completion_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotCheck {
    pub user_id: String,
    pub action_id: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotUserStats {
    pub user_id: String,
    #[serde(default)]
    pub current_streak: i64,
    #[serde(default)]
    pub longest_streak: i64,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotAchievement {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotUserAchievement {
    pub user_id: String,
    pub achievement_id: String,
    pub earned_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotPushToken {
    pub user_id: String,
    pub token: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub users: usize,
    pub mandalarts: usize,
    pub actions: usize,
    pub checks: usize,
    pub push_tokens: usize,
}

impl Snapshot {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))
    }
}

impl Database {
    /// Upserts every row of the snapshot in one transaction. Check history and
    /// earned badges are appended.
    pub fn import_snapshot(&self, snapshot: &Snapshot) -> Result<ImportSummary> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to start import transaction")?;

        for user in &snapshot.users {
            tx.execute(
                "INSERT INTO users (id, email, nickname, timezone, language) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET email = excluded.email, nickname = excluded.nickname,
                   timezone = excluded.timezone, language = excluded.language",
                params![user.id, user.email, user.nickname, user.timezone, user.language],
            )
            .with_context(|| format!("Failed to import user {}", user.id))?;
        }

        for mandalart in &snapshot.mandalarts {
            tx.execute(
                "INSERT OR REPLACE INTO mandalarts (id, user_id, title, center_goal, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    mandalart.id,
                    mandalart.user_id,
                    mandalart.title,
                    mandalart.center_goal,
                    mandalart.is_active
                ],
            )
            .with_context(|| format!("Failed to import mandalart {}", mandalart.id))?;
        }

        for sub_goal in &snapshot.sub_goals {
            tx.execute(
                "INSERT OR REPLACE INTO sub_goals (id, mandalart_id, title, position) VALUES (?1, ?2, ?3, ?4)",
                params![sub_goal.id, sub_goal.mandalart_id, sub_goal.title, sub_goal.position],
            )
            .with_context(|| format!("Failed to import sub goal {}", sub_goal.id))?;
        }

        for action in &snapshot.actions {
            tx.execute(
                "INSERT OR REPLACE INTO actions
                   (id, sub_goal_id, title, position, type, routine_frequency, mission_completion_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    action.id,
                    action.sub_goal_id,
                    action.title,
                    action.position,
                    action.action_type,
                    action.routine_frequency,
                    action.mission_completion_type
                ],
            )
            .with_context(|| format!("Failed to import action {}", action.id))?;
        }

        for check in &snapshot.check_history {
            tx.execute(
                "INSERT INTO check_history (user_id, action_id, checked_at) VALUES (?1, ?2, ?3)",
                params![check.user_id, check.action_id, check.checked_at.timestamp()],
            )
            .context("Failed to import check history")?;
        }

        for stats in &snapshot.user_stats {
            tx.execute(
                "INSERT OR REPLACE INTO user_stats (user_id, current_streak, longest_streak) VALUES (?1, ?2, ?3)",
                params![stats.user_id, stats.current_streak, stats.longest_streak],
            )
            .with_context(|| format!("Failed to import stats for {}", stats.user_id))?;
        }

        for achievement in &snapshot.achievements {
            tx.execute(
                "INSERT OR REPLACE INTO achievements (id, title) VALUES (?1, ?2)",
                params![achievement.id, achievement.title],
            )
            .with_context(|| format!("Failed to import achievement {}", achievement.id))?;
        }

        for earned in &snapshot.user_achievements {
            tx.execute(
                "INSERT INTO user_achievements (user_id, achievement_id, earned_at) VALUES (?1, ?2, ?3)",
                params![earned.user_id, earned.achievement_id, earned.earned_at.timestamp()],
            )
            .context("Failed to import earned achievements")?;
        }

        let now = Utc::now().timestamp();
        for token in &snapshot.push_tokens {
            tx.execute(
                "INSERT INTO push_tokens (user_id, token, is_active, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, token) DO UPDATE SET is_active = excluded.is_active,
                   updated_at = excluded.updated_at",
                params![
                    token.user_id,
                    token.token,
                    token.is_active,
                    token.updated_at.map(|value| value.timestamp()).unwrap_or(now)
                ],
            )
            .with_context(|| format!("Failed to import push token for {}", token.user_id))?;
        }

        tx.commit().context("Failed to commit snapshot import")?;

        Ok(ImportSummary {
            users: snapshot.users.len(),
            mandalarts: snapshot.mandalarts.len(),
            actions: snapshot.actions.len(),
            checks: snapshot.check_history.len(),
            push_tokens: snapshot.push_tokens.len(),
        })
    }
}
