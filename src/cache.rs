//! Cache keys and content fingerprints for generated reports.
//!
//! A stored report is reused only when both the coarse scope key and the
//! fine input hash match. The key alone would survive a prompt-version bump;
//! the hash alone is not indexable by scope.

use crate::db::{Database, MandalartTree, StoredReport};
use crate::model::{Language, ReportType};
use crate::period::PeriodBounds;
use anyhow::Result;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

pub const PENDING_CONTENT: &str = "pending";

/// Deterministic JSON text: object keys sorted, arrays in order.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(text) => push_json_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();

            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                push_json_string(key, out);
                out.push(':');
                write_stable(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn push_json_string(text: &str, out: &mut String) {
    // serde_json's string escaping is already canonical.
    out.push_str(&Value::String(text.to_string()).to_string());
}

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    format!("{digest:x}")
}

/// Coarse key for time-windowed report types.
pub fn period_cache_key(report_type: ReportType, language: Language, bounds: &PeriodBounds) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        report_type, language, bounds.user_timezone, bounds.period_start_date, bounds.period_end_date
    )
}

/// Coarse key for diagnosis. Editing any title in the plan changes
/// `content_hash` and therefore the key.
pub fn diagnosis_cache_key(language: Language, mandalart_id: &str, content_hash: &str) -> String {
    format!("diagnosis:{language}:{mandalart_id}:{content_hash}")
}

pub fn mandalart_content_hash(tree: &MandalartTree) -> String {
    let mut sub_goals = tree.sub_goals.iter().collect::<Vec<_>>();
    sub_goals.sort_by_key(|sub_goal| sub_goal.position);

    let sub_goal_values = sub_goals
        .into_iter()
        .map(|sub_goal| {
            let mut actions = sub_goal.actions.iter().collect::<Vec<_>>();
            actions.sort_by_key(|action| action.position);

            json!({
                "position": sub_goal.position,
                "title": sub_goal.title,
                "actions": actions
                    .into_iter()
                    .map(|action| json!({
                        "position": action.position,
                        "title": action.title,
                        "type": action.action_type.as_str(),
                        "routine_frequency": action.routine_frequency,
                        "mission_completion_type": action.mission_completion_type,
                    }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect::<Vec<_>>();

    let value = json!({
        "id": tree.id,
        "title": tree.title,
        "center_goal": tree.center_goal,
        "sub_goals": sub_goal_values,
    });

    sha256_hex(&stable_stringify(&value))
}

pub fn input_hash(
    prompt_version: &str,
    report_type: ReportType,
    language: Language,
    data: &Value,
) -> String {
    let envelope = json!({
        "promptVersion": prompt_version,
        "reportType": report_type.as_str(),
        "language": language.as_str(),
        "data": data,
    });

    sha256_hex(&stable_stringify(&envelope))
}

pub fn is_placeholder_content(content: &str) -> bool {
    let trimmed = content.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case(PENDING_CONTENT)
}

/// Newest stored report with the same scope key and input hash, skipping the
/// row currently being written and any placeholder rows.
pub fn find_reusable(
    database: &Database,
    user_id: &str,
    report_type: ReportType,
    cache_key: &str,
    input_hash: &str,
    exclude_id: Option<i64>,
) -> Result<Option<StoredReport>> {
    let candidates =
        database.reports_matching(user_id, report_type, cache_key, input_hash, exclude_id)?;

    Ok(candidates
        .into_iter()
        .find(|report| !is_placeholder_content(&report.content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ActionNode, SubGoalNode};
    use crate::model::ActionType;

    #[test]
    fn key_order_does_not_change_serialization() {
        let left: Value = serde_json::from_str(r#"{"b":1,"a":{"y":[1,2],"x":null}}"#).unwrap();
        let right: Value = serde_json::from_str(r#"{"a":{"x":null,"y":[1,2]},"b":1}"#).unwrap();
        assert_eq!(stable_stringify(&left), stable_stringify(&right));
        assert_eq!(stable_stringify(&left), r#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
    }

    #[test]
    fn array_order_is_significant() {
        assert_ne!(
            stable_stringify(&json!([1, 2])),
            stable_stringify(&json!([2, 1]))
        );
    }

    #[test]
    fn distinct_values_serialize_distinctly() {
        let corpus = [
            json!(null),
            json!(false),
            json!(0),
            json!("0"),
            json!(""),
            json!([]),
            json!({}),
            json!([null]),
            json!({"a": null}),
            json!({"a": "b"}),
            json!({"a,b": 1}),
            json!({"a": 1, "b": 2}),
            json!("a\"b"),
        ];
        let rendered = corpus.iter().map(stable_stringify).collect::<Vec<_>>();
        for (i, left) in rendered.iter().enumerate() {
            for right in rendered.iter().skip(i + 1) {
                assert_ne!(left, right);
            }
        }
    }

    #[test]
    fn escapes_strings_like_json() {
        assert_eq!(stable_stringify(&json!({"k\n": "줄\"바꿈"})), "{\"k\\n\":\"줄\\\"바꿈\"}");
    }

    #[test]
    fn sha256_is_lowercase_hex() {
        let digest = sha256_hex("");
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let other = sha256_hex("mandalart");
        assert_eq!(other.len(), 64);
        assert!(other.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(other, sha256_hex("mandalart"));
    }

    #[test]
    fn input_hash_tracks_prompt_version_and_data() {
        let data = json!({"totalChecks": 3});
        let base = input_hash("weekly-v3", ReportType::Weekly, Language::Ko, &data);
        assert_eq!(base, input_hash("weekly-v3", ReportType::Weekly, Language::Ko, &data));
        assert_ne!(base, input_hash("weekly-v4", ReportType::Weekly, Language::Ko, &data));
        assert_ne!(base, input_hash("weekly-v3", ReportType::Weekly, Language::En, &data));
        assert_ne!(
            base,
            input_hash("weekly-v3", ReportType::Weekly, Language::Ko, &json!({"totalChecks": 4}))
        );
    }

    fn tree() -> MandalartTree {
        MandalartTree {
            id: "m1".to_string(),
            title: "2026".to_string(),
            center_goal: "Run a marathon".to_string(),
            sub_goals: vec![SubGoalNode {
                id: "s1".to_string(),
                title: "Endurance".to_string(),
                position: 1,
                actions: vec![ActionNode {
                    id: "a1".to_string(),
                    title: "Run 5km".to_string(),
                    position: 1,
                    action_type: ActionType::Routine,
                    routine_frequency: Some("daily".to_string()),
                    mission_completion_type: None,
                }],
            }],
        }
    }

    #[test]
    fn editing_an_action_title_changes_the_diagnosis_key() {
        let original = tree();
        let mut edited = tree();
        edited.sub_goals[0].actions[0].title = "Run 10km".to_string();

        let before = diagnosis_cache_key(Language::Ko, "m1", &mandalart_content_hash(&original));
        let after = diagnosis_cache_key(Language::Ko, "m1", &mandalart_content_hash(&edited));
        assert_ne!(before, after);
        assert_eq!(
            before,
            diagnosis_cache_key(Language::Ko, "m1", &mandalart_content_hash(&tree()))
        );
    }

    #[test]
    fn editing_a_sub_goal_title_changes_the_content_hash() {
        let mut edited = tree();
        edited.sub_goals[0].title = "Speed".to_string();
        assert_ne!(mandalart_content_hash(&tree()), mandalart_content_hash(&edited));
    }

    #[test]
    fn placeholders_are_detected() {
        assert!(is_placeholder_content(""));
        assert!(is_placeholder_content(" pending "));
        assert!(!is_placeholder_content("{\"headline\":\"ok\"}"));
    }
}
