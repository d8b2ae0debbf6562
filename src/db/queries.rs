pub const CREATE_USERS: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id         TEXT PRIMARY KEY,
  email      TEXT NOT NULL DEFAULT '',
  nickname   TEXT NOT NULL DEFAULT '',
  timezone   TEXT,
  language   TEXT
);
"#;

pub const CREATE_MANDALARTS: &str = r#"
CREATE TABLE IF NOT EXISTS mandalarts (
  id          TEXT PRIMARY KEY,
  user_id     TEXT NOT NULL,
  title       TEXT NOT NULL DEFAULT '',
  center_goal TEXT NOT NULL DEFAULT '',
  is_active   INTEGER NOT NULL DEFAULT 1
);
"#;

pub const CREATE_SUB_GOALS: &str = r#"
CREATE TABLE IF NOT EXISTS sub_goals (
  id           TEXT PRIMARY KEY,
  mandalart_id TEXT NOT NULL,
  title        TEXT NOT NULL DEFAULT '',
  position     INTEGER NOT NULL
);
"#;

pub const CREATE_ACTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS actions (
  id                      TEXT PRIMARY KEY,
  sub_goal_id             TEXT NOT NULL,
  title                   TEXT NOT NULL DEFAULT '',
  position                INTEGER NOT NULL,
  type                    TEXT,
  routine_frequency       TEXT,
  mission_completion_type TEXT
);
"#;

pub const CREATE_CHECK_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS check_history (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id    TEXT NOT NULL,
  action_id  TEXT NOT NULL,
  checked_at INTEGER NOT NULL
);
"#;

pub const CREATE_USER_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS user_stats (
  user_id        TEXT PRIMARY KEY,
  current_streak INTEGER NOT NULL DEFAULT 0,
  longest_streak INTEGER NOT NULL DEFAULT 0
);
"#;

pub const CREATE_ACHIEVEMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS achievements (
  id    TEXT PRIMARY KEY,
  title TEXT NOT NULL
);
"#;

pub const CREATE_USER_ACHIEVEMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS user_achievements (
  id             INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id        TEXT NOT NULL,
  achievement_id TEXT NOT NULL,
  earned_at      INTEGER NOT NULL
);
"#;

pub const CREATE_PUSH_TOKENS: &str = r#"
CREATE TABLE IF NOT EXISTS push_tokens (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id    TEXT NOT NULL,
  token      TEXT NOT NULL,
  is_active  INTEGER NOT NULL DEFAULT 1,
  updated_at INTEGER NOT NULL,
  UNIQUE(user_id, token)
);
"#;

pub const CREATE_AI_REPORTS: &str = r#"
CREATE TABLE IF NOT EXISTS ai_reports (
  id             INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id        TEXT NOT NULL,
  report_type    TEXT NOT NULL,
  content        TEXT NOT NULL DEFAULT 'pending',
  cache_key      TEXT,
  input_hash     TEXT,
  prompt_version TEXT,
  model          TEXT,
  cached_from    INTEGER,
  bypass_cache   INTEGER NOT NULL DEFAULT 0,
  metadata       TEXT NOT NULL DEFAULT '{}',
  generated_at   INTEGER NOT NULL
);
"#;

pub const CREATE_NOTIFICATION_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS notification_log (
  id                INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id           TEXT NOT NULL,
  notification_type TEXT NOT NULL,
  local_date        TEXT NOT NULL,
  metadata          TEXT NOT NULL DEFAULT '{}',
  sent_at           INTEGER NOT NULL,
  UNIQUE(user_id, notification_type, local_date)
);
"#;

pub const CREATE_COACHING_COSTS: &str = r#"
CREATE TABLE IF NOT EXISTS coaching_costs (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id    TEXT,
  session_id TEXT,
  tokens_in  INTEGER NOT NULL,
  tokens_out INTEGER NOT NULL,
  cost_usd   REAL NOT NULL,
  created_at INTEGER NOT NULL
);
"#;

pub const INDEX_CHECK_HISTORY_USER_TIME: &str =
    "CREATE INDEX IF NOT EXISTS idx_check_history_user_time ON check_history(user_id, checked_at);";

pub const INDEX_AI_REPORTS_LOOKUP: &str = "CREATE INDEX IF NOT EXISTS idx_ai_reports_lookup ON ai_reports(user_id, report_type, cache_key, input_hash);";

/// At most one generated (non-reused, non-placeholder) row per key and hash,
/// so two racing runs cannot both persist a fresh generation. Rows written
/// with the cache switched off are exempt.
pub const UNIQUE_AI_REPORTS_GENERATED: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS uq_ai_reports_generated
ON ai_reports(user_id, report_type, cache_key, input_hash)
WHERE cached_from IS NULL
  AND bypass_cache = 0
  AND cache_key IS NOT NULL
  AND input_hash IS NOT NULL
  AND content <> 'pending'
  AND content <> '';
"#;

pub const INDEX_SUB_GOALS_MANDALART: &str =
    "CREATE INDEX IF NOT EXISTS idx_sub_goals_mandalart ON sub_goals(mandalart_id);";

pub const INDEX_ACTIONS_SUB_GOAL: &str =
    "CREATE INDEX IF NOT EXISTS idx_actions_sub_goal ON actions(sub_goal_id);";

pub fn schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_USERS,
        CREATE_MANDALARTS,
        CREATE_SUB_GOALS,
        CREATE_ACTIONS,
        CREATE_CHECK_HISTORY,
        CREATE_USER_STATS,
        CREATE_ACHIEVEMENTS,
        CREATE_USER_ACHIEVEMENTS,
        CREATE_PUSH_TOKENS,
        CREATE_AI_REPORTS,
        CREATE_NOTIFICATION_LOG,
        CREATE_COACHING_COSTS,
        INDEX_CHECK_HISTORY_USER_TIME,
        INDEX_AI_REPORTS_LOOKUP,
        UNIQUE_AI_REPORTS_GENERATED,
        INDEX_SUB_GOALS_MANDALART,
        INDEX_ACTIONS_SUB_GOAL,
    ]
}

pub const SELECT_CHECKS_IN_RANGE: &str = r#"
SELECT ch.id, ch.checked_at, a.type, sg.id, sg.title
FROM check_history ch
LEFT JOIN actions a ON a.id = ch.action_id
LEFT JOIN sub_goals sg ON sg.id = a.sub_goal_id
WHERE ch.user_id = ?1 AND ch.checked_at >= ?2 AND ch.checked_at < ?3
ORDER BY ch.checked_at ASC, ch.id ASC
"#;

pub const SELECT_REPORT_COLUMNS: &str = "SELECT id, user_id, report_type, content, cache_key, input_hash, prompt_version, model, cached_from, metadata, generated_at FROM ai_reports";

pub const SELECT_PUSH_CANDIDATES: &str = r#"
SELECT u.id, u.email, u.nickname, u.timezone, u.language,
       (SELECT pt.token FROM push_tokens pt
         WHERE pt.user_id = u.id AND pt.is_active = 1
         ORDER BY pt.updated_at DESC, pt.id DESC LIMIT 1) AS push_token,
       COALESCE(us.current_streak, 0),
       (SELECT MAX(ch.checked_at) FROM check_history ch WHERE ch.user_id = u.id) AS last_checked_at
FROM users u
LEFT JOIN user_stats us ON us.user_id = u.id
"#;
