pub mod queries;
pub mod snapshot;

use crate::model::{ActionType, ReportType};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub nickname: String,
    pub timezone: Option<String>,
    pub language: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        if !self.nickname.trim().is_empty() {
            return self.nickname.trim().to_string();
        }

        self.email
            .split('@')
            .next()
            .filter(|local| !local.is_empty())
            .unwrap_or("friend")
            .to_string()
    }
}

/// A user the push-driven jobs may address.
#[derive(Debug, Clone)]
pub struct PushCandidate {
    pub profile: UserProfile,
    pub push_token: Option<String>,
    pub current_streak: i64,
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionNode {
    pub id: String,
    pub title: String,
    pub position: i64,
    pub action_type: ActionType,
    pub routine_frequency: Option<String>,
    pub mission_completion_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubGoalNode {
    pub id: String,
    pub title: String,
    pub position: i64,
    pub actions: Vec<ActionNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MandalartTree {
    pub id: String,
    pub title: String,
    pub center_goal: String,
    pub sub_goals: Vec<SubGoalNode>,
}

#[derive(Debug, Clone)]
pub struct CheckRecord {
    pub id: i64,
    pub checked_at: DateTime<Utc>,
    pub action_type: ActionType,
    pub sub_goal_id: Option<String>,
    pub sub_goal_title: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UserStats {
    pub current_streak: i64,
    pub longest_streak: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredReport {
    pub id: i64,
    pub user_id: String,
    pub report_type: String,
    pub content: String,
    pub cache_key: Option<String>,
    pub input_hash: Option<String>,
    pub prompt_version: Option<String>,
    pub model: Option<String>,
    pub cached_from: Option<i64>,
    pub metadata: serde_json::Value,
    pub generated_at: i64,
}

#[derive(Debug, Clone)]
pub struct ReportCompletion<'a> {
    pub content: &'a str,
    pub cache_key: &'a str,
    pub input_hash: &'a str,
    pub prompt_version: &'a str,
    pub model: &'a str,
    pub cached_from: Option<i64>,
    pub bypass_cache: bool,
    pub metadata: &'a serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Stored,
    /// Another run already persisted a generated row for the same key and hash.
    DuplicateGenerated,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create DB directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite DB: {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set SQLite busy timeout")?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal mode")?;

        let database = Self { conn };
        database.init_schema()?;

        Ok(database)
    }

    pub fn init_schema(&self) -> Result<()> {
        queries::schema_statements()
            .iter()
            .try_for_each(|statement| {
                self.conn
                    .execute(statement, [])
                    .context("Failed to initialize schema")
                    .map(|_| ())
            })
    }

    pub fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.conn
            .query_row(
                "SELECT id, email, nickname, timezone, language FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(UserProfile {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        nickname: row.get(2)?,
                        timezone: row.get(3)?,
                        language: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to load user profile")
    }

    /// Users with at least one active mandalart, oldest id first.
    pub fn users_for_weekly_report(&self) -> Result<Vec<UserProfile>> {
        let mut statement = self.conn.prepare(
            "SELECT u.id, u.email, u.nickname, u.timezone, u.language
             FROM users u
             WHERE EXISTS (SELECT 1 FROM mandalarts m WHERE m.user_id = u.id AND m.is_active = 1)
             ORDER BY u.id ASC",
        )?;

        let rows = statement
            .query_map([], |row| {
                Ok(UserProfile {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    nickname: row.get(2)?,
                    timezone: row.get(3)?,
                    language: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query users for weekly report")?;

        Ok(rows)
    }

    pub fn push_candidates(&self) -> Result<Vec<PushCandidate>> {
        let mut statement = self
            .conn
            .prepare(&format!("{} ORDER BY u.id ASC", queries::SELECT_PUSH_CANDIDATES))?;

        let rows = statement
            .query_map([], |row| {
                let last_checked_at: Option<i64> = row.get(7)?;
                Ok(PushCandidate {
                    profile: UserProfile {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        nickname: row.get(2)?,
                        timezone: row.get(3)?,
                        language: row.get(4)?,
                    },
                    push_token: row.get(5)?,
                    current_streak: row.get(6)?,
                    last_checked_at: last_checked_at.map(|secs| utc_column(7, secs)).transpose()?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query push candidates")?;

        Ok(rows)
    }

    pub fn latest_push_token(&self, user_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT token FROM push_tokens
                 WHERE user_id = ?1 AND is_active = 1
                 ORDER BY updated_at DESC, id DESC LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load push token")
    }

    /// Active mandalarts of a user with their full sub-goal/action tree,
    /// optionally narrowed to one mandalart.
    pub fn active_mandalarts(
        &self,
        user_id: &str,
        mandalart_id: Option<&str>,
    ) -> Result<Vec<MandalartTree>> {
        let mut statement = self.conn.prepare(
            "SELECT id, title, center_goal FROM mandalarts
             WHERE user_id = ?1 AND is_active = 1 AND (?2 IS NULL OR id = ?2)
             ORDER BY id ASC",
        )?;

        let mandalarts = statement
            .query_map(params![user_id, mandalart_id], |row| {
                Ok(MandalartTree {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    center_goal: row.get(2)?,
                    sub_goals: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query mandalarts")?;

        mandalarts
            .into_iter()
            .map(|mut mandalart| {
                mandalart.sub_goals = self.sub_goal_tree(&mandalart.id)?;
                Ok(mandalart)
            })
            .collect()
    }

    fn sub_goal_tree(&self, mandalart_id: &str) -> Result<Vec<SubGoalNode>> {
        let mut statement = self.conn.prepare(
            "SELECT sg.id, sg.title, sg.position,
                    a.id, a.title, a.position, a.type, a.routine_frequency, a.mission_completion_type
             FROM sub_goals sg
             LEFT JOIN actions a ON a.sub_goal_id = sg.id
             WHERE sg.mandalart_id = ?1
             ORDER BY sg.position ASC, sg.id ASC, a.position ASC, a.id ASC",
        )?;

        let mut sub_goals: Vec<SubGoalNode> = Vec::new();
        let mut index_by_id: HashMap<String, usize> = HashMap::new();

        let mut rows = statement.query(params![mandalart_id])?;
        while let Some(row) = rows.next()? {
            let sub_goal_id: String = row.get(0)?;
            let slot = match index_by_id.get(&sub_goal_id) {
                Some(slot) => *slot,
                None => {
                    sub_goals.push(SubGoalNode {
                        id: sub_goal_id.clone(),
                        title: row.get(1)?,
                        position: row.get(2)?,
                        actions: Vec::new(),
                    });
                    index_by_id.insert(sub_goal_id, sub_goals.len() - 1);
                    sub_goals.len() - 1
                }
            };

            let action_id: Option<String> = row.get(3)?;
            if let Some(action_id) = action_id {
                let raw_type: Option<String> = row.get(6)?;
                sub_goals[slot].actions.push(ActionNode {
                    id: action_id,
                    title: row.get(4)?,
                    position: row.get(5)?,
                    action_type: ActionType::parse_lenient(raw_type.as_deref()),
                    routine_frequency: row.get(7)?,
                    mission_completion_type: row.get(8)?,
                });
            }
        }

        Ok(sub_goals)
    }

    pub fn checks_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to_exclusive: DateTime<Utc>,
    ) -> Result<Vec<CheckRecord>> {
        let mut statement = self.conn.prepare(queries::SELECT_CHECKS_IN_RANGE)?;

        let rows = statement
            .query_map(
                params![user_id, from.timestamp(), to_exclusive.timestamp()],
                |row| {
                    let checked_at: i64 = row.get(1)?;
                    let raw_type: Option<String> = row.get(2)?;
                    Ok(CheckRecord {
                        id: row.get(0)?,
                        checked_at: utc_column(1, checked_at)?,
                        action_type: ActionType::parse_lenient(raw_type.as_deref()),
                        sub_goal_id: row.get(3)?,
                        sub_goal_title: row.get(4)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query check history")?;

        Ok(rows)
    }

    pub fn count_checks_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to_exclusive: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM check_history
                 WHERE user_id = ?1 AND checked_at >= ?2 AND checked_at < ?3",
                params![user_id, from.timestamp(), to_exclusive.timestamp()],
                |row| row.get(0),
            )
            .context("Failed to count check history")
    }

    pub fn user_stats(&self, user_id: &str) -> Result<UserStats> {
        let stats = self
            .conn
            .query_row(
                "SELECT current_streak, longest_streak FROM user_stats WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserStats {
                        current_streak: row.get(0)?,
                        longest_streak: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to load user stats")?;

        Ok(stats.unwrap_or_default())
    }

    pub fn badges_earned_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to_exclusive: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut statement = self.conn.prepare(
            "SELECT a.title FROM user_achievements ua
             JOIN achievements a ON a.id = ua.achievement_id
             WHERE ua.user_id = ?1 AND ua.earned_at >= ?2 AND ua.earned_at < ?3
             ORDER BY ua.earned_at DESC, ua.id DESC",
        )?;

        let rows = statement
            .query_map(
                params![user_id, from.timestamp(), to_exclusive.timestamp()],
                |row| row.get(0),
            )?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to query earned badges")?;

        Ok(rows)
    }

    pub fn insert_pending_report(
        &self,
        user_id: &str,
        report_type: ReportType,
        generated_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO ai_reports (user_id, report_type, content, generated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    user_id,
                    report_type.as_str(),
                    crate::cache::PENDING_CONTENT,
                    generated_at.timestamp()
                ],
            )
            .context("Failed to insert pending report")?;

        Ok(self.conn.last_insert_rowid())
    }

    pub fn complete_report(&self, id: i64, completion: &ReportCompletion<'_>) -> Result<CompletionOutcome> {
        let metadata =
            serde_json::to_string(completion.metadata).context("Failed to serialize report metadata")?;

        let result = self.conn.execute(
            "UPDATE ai_reports
             SET content = ?2, cache_key = ?3, input_hash = ?4, prompt_version = ?5,
                 model = ?6, cached_from = ?7, metadata = ?8, bypass_cache = ?9
             WHERE id = ?1",
            params![
                id,
                completion.content,
                completion.cache_key,
                completion.input_hash,
                completion.prompt_version,
                completion.model,
                completion.cached_from,
                metadata,
                completion.bypass_cache
            ],
        );

        match result {
            Ok(_) => Ok(CompletionOutcome::Stored),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Ok(CompletionOutcome::DuplicateGenerated)
            }
            Err(error) => Err(error).context("Failed to store report content"),
        }
    }

    pub fn delete_report(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM ai_reports WHERE id = ?1", params![id])
            .context("Failed to delete report")?;
        Ok(())
    }

    pub fn report_by_id(&self, id: i64) -> Result<Option<StoredReport>> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", queries::SELECT_REPORT_COLUMNS),
                params![id],
                map_stored_report,
            )
            .optional()
            .context("Failed to load report")
    }

    /// Candidate rows for cache reuse, newest first.
    pub fn reports_matching(
        &self,
        user_id: &str,
        report_type: ReportType,
        cache_key: &str,
        input_hash: &str,
        exclude_id: Option<i64>,
    ) -> Result<Vec<StoredReport>> {
        let mut statement = self.conn.prepare(&format!(
            "{} WHERE user_id = ?1 AND report_type = ?2 AND cache_key = ?3 AND input_hash = ?4
               AND (?5 IS NULL OR id <> ?5)
             ORDER BY generated_at DESC, id DESC
             LIMIT 5",
            queries::SELECT_REPORT_COLUMNS
        ))?;

        let rows = statement
            .query_map(
                params![user_id, report_type.as_str(), cache_key, input_hash, exclude_id],
                map_stored_report,
            )?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query cached reports")?;

        Ok(rows)
    }

    pub fn latest_reports(&self, user_id: &str, limit: usize) -> Result<Vec<StoredReport>> {
        let mut statement = self.conn.prepare(&format!(
            "{} WHERE user_id = ?1 ORDER BY generated_at DESC, id DESC LIMIT ?2",
            queries::SELECT_REPORT_COLUMNS
        ))?;

        let rows = statement
            .query_map(params![user_id, limit as i64], map_stored_report)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list reports")?;

        Ok(rows)
    }

    pub fn notification_sent(&self, user_id: &str, notification_type: &str, local_date: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM notification_log
                 WHERE user_id = ?1 AND notification_type = ?2 AND local_date = ?3",
                params![user_id, notification_type, local_date],
                |row| row.get(0),
            )
            .context("Failed to query notification log")?;

        Ok(count > 0)
    }

    /// Returns false when the same notification was already recorded for the day.
    pub fn record_notification(
        &self,
        user_id: &str,
        notification_type: &str,
        local_date: &str,
        metadata: &serde_json::Value,
        sent_at: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO notification_log (user_id, notification_type, local_date, metadata, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user_id,
                    notification_type,
                    local_date,
                    metadata.to_string(),
                    sent_at.timestamp()
                ],
            )
            .context("Failed to record notification")?;

        Ok(inserted > 0)
    }

    pub fn insert_coaching_cost(
        &self,
        user_id: Option<&str>,
        session_id: Option<&str>,
        tokens_in: u64,
        tokens_out: u64,
        cost_usd: f64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO coaching_costs (user_id, session_id, tokens_in, tokens_out, cost_usd, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user_id,
                    session_id,
                    tokens_in as i64,
                    tokens_out as i64,
                    cost_usd,
                    Utc::now().timestamp()
                ],
            )
            .context("Failed to record coaching cost")?;

        Ok(())
    }
}

fn map_stored_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredReport> {
    let metadata: String = row.get(9)?;
    Ok(StoredReport {
        id: row.get(0)?,
        user_id: row.get(1)?,
        report_type: row.get(2)?,
        content: row.get(3)?,
        cache_key: row.get(4)?,
        input_hash: row.get(5)?,
        prompt_version: row.get(6)?,
        model: row.get(7)?,
        cached_from: row.get(8)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        generated_at: row.get(10)?,
    })
}

fn utc_column(index: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {secs}").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seeded_database, ts};
    use serde_json::json;

    #[test]
    fn out_of_range_check_timestamp_is_a_database_error() {
        let (_dir, database) = seeded_database();
        database
            .conn
            .execute(
                "INSERT INTO check_history (user_id, action_id, checked_at) VALUES ('u1', 'a1', ?1)",
                params![i64::MAX],
            )
            .unwrap();

        let error = database.push_candidates().unwrap_err();
        assert_eq!(crate::error::classify(&error), crate::error::ErrorCode::DatabaseError);
        assert!(format!("{error:#}").contains("timestamp out of range"));
    }

    #[test]
    fn mandalart_tree_is_ordered_by_position() {
        let (_dir, database) = seeded_database();
        let trees = database.active_mandalarts("u1", None).unwrap();

        assert_eq!(trees.len(), 1);
        let positions = trees[0]
            .sub_goals
            .iter()
            .map(|sub_goal| sub_goal.position)
            .collect::<Vec<_>>();
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(trees[0].sub_goals[0].actions.len(), 2);
    }

    #[test]
    fn checks_range_is_end_exclusive() {
        let (_dir, database) = seeded_database();
        let checks = database
            .checks_between("u1", ts("2026-03-03T00:00:00Z"), ts("2026-03-04T00:00:00Z"))
            .unwrap();
        assert!(checks.iter().all(|check| check.checked_at < ts("2026-03-04T00:00:00Z")));
    }

    #[test]
    fn duplicate_generated_rows_are_rejected() {
        let (_dir, database) = seeded_database();
        let now = Utc::now();
        let metadata = json!({});
        let completion = ReportCompletion {
            content: "{\"headline\":\"x\"}",
            cache_key: "weekly:ko:Asia/Seoul:2026-03-03:2026-03-09",
            input_hash: "abc",
            prompt_version: "weekly-v3",
            model: "sonar",
            cached_from: None,
            bypass_cache: false,
            metadata: &metadata,
        };

        let first = database.insert_pending_report("u1", ReportType::Weekly, now).unwrap();
        let second = database.insert_pending_report("u1", ReportType::Weekly, now).unwrap();

        assert_eq!(database.complete_report(first, &completion).unwrap(), CompletionOutcome::Stored);
        assert_eq!(
            database.complete_report(second, &completion).unwrap(),
            CompletionOutcome::DuplicateGenerated
        );

        let reuse = ReportCompletion {
            cached_from: Some(first),
            ..completion.clone()
        };
        assert_eq!(database.complete_report(second, &reuse).unwrap(), CompletionOutcome::Stored);
    }

    #[test]
    fn notifications_are_recorded_once_per_day() {
        let (_dir, database) = seeded_database();
        let now = Utc::now();
        assert!(database.record_notification("u1", "streak_warning", "2026-03-10", &json!({}), now).unwrap());
        assert!(!database.record_notification("u1", "streak_warning", "2026-03-10", &json!({}), now).unwrap());
        assert!(database.notification_sent("u1", "streak_warning", "2026-03-10").unwrap());
        assert!(!database.notification_sent("u1", "streak_warning", "2026-03-11").unwrap());
    }

    #[test]
    fn display_name_falls_back_to_email() {
        let profile = UserProfile {
            id: "u9".to_string(),
            email: "jiwoo@example.com".to_string(),
            nickname: " ".to_string(),
            timezone: None,
            language: None,
        };
        assert_eq!(profile.display_name(), "jiwoo");
    }
}
