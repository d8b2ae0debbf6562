pub mod activity;
pub mod structure;

use crate::analyzer::activity::ActivitySummary;
use crate::analyzer::structure::StructureAnalysis;
use crate::db::{Database, MandalartTree, UserStats};
use crate::error::ReportError;
use crate::model::Language;
use crate::period::{self, PeriodBounds};
use anyhow::Result;
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MandalartBrief {
    pub id: String,
    pub title: String,
    pub center_goal: String,
}

impl From<&MandalartTree> for MandalartBrief {
    fn from(tree: &MandalartTree) -> Self {
        Self {
            id: tree.id.clone(),
            title: tree.title.clone(),
            center_goal: tree.center_goal.clone(),
        }
    }
}

/// Input for the time-windowed report types.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodReportInput {
    pub period: PeriodBounds,
    pub mandalarts: Vec<MandalartBrief>,
    #[serde(flatten)]
    pub activity: ActivitySummary,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub week_over_week_change: Option<i64>,
    pub recent_badges: Vec<String>,
    pub structure_analysis: StructureAnalysis,
}

/// Input for diagnosis. Structural only, so the same plan hashes the same
/// regardless of when it is diagnosed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisInput {
    pub mandalart: MandalartTree,
    pub structure_analysis: StructureAnalysis,
}

pub fn collect_period_input(
    database: &Database,
    user_id: &str,
    mandalart_id: Option<&str>,
    tz: Tz,
    language: Language,
    bounds: &PeriodBounds,
) -> Result<PeriodReportInput> {
    let mandalarts = database.active_mandalarts(user_id, mandalart_id)?;
    let checks = database.checks_between(
        user_id,
        bounds.period_start_timestamp,
        bounds.period_end_timestamp_exclusive,
    )?;

    let previous = period::previous_window(tz, bounds)?;
    let previous_count = database.count_checks_between(
        user_id,
        previous.period_start_timestamp,
        previous.period_end_timestamp_exclusive,
    )?;

    let UserStats {
        current_streak,
        longest_streak,
    } = database.user_stats(user_id)?;
    let recent_badges = database.badges_earned_between(
        user_id,
        bounds.period_start_timestamp,
        bounds.period_end_timestamp_exclusive,
    )?;

    let activity = activity::summarize_checks(&checks, tz, language);
    let week_over_week_change =
        activity::period_over_period_change(i64::from(activity.total_checks), previous_count);

    Ok(PeriodReportInput {
        period: bounds.clone(),
        mandalarts: mandalarts.iter().map(MandalartBrief::from).collect(),
        activity,
        current_streak,
        longest_streak,
        week_over_week_change,
        recent_badges,
        structure_analysis: structure::analyze(&mandalarts),
    })
}

/// Picks the requested mandalart, or the user's first active one.
pub fn collect_diagnosis_input(
    database: &Database,
    user_id: &str,
    mandalart_id: Option<&str>,
) -> Result<DiagnosisInput> {
    let mandalart = database
        .active_mandalarts(user_id, mandalart_id)?
        .into_iter()
        .next()
        .ok_or_else(|| ReportError::NotFound("No active mandalart to diagnose".to_string()))?;

    let structure_analysis = structure::analyze(std::slice::from_ref(&mandalart));

    Ok(DiagnosisInput {
        mandalart,
        structure_analysis,
    })
}

pub fn to_summary<T: Serialize>(input: &T) -> Result<Value> {
    Ok(serde_json::to_value(input)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seeded_database, ts};
    use chrono_tz::Asia;

    #[test]
    fn period_input_counts_checks_inside_the_window() {
        let (_dir, database) = seeded_database();
        let bounds = period::resolve(Asia::Seoul, 7, ts("2026-03-10T03:00:00Z")).unwrap();

        let input =
            collect_period_input(&database, "u1", None, Asia::Seoul, Language::Ko, &bounds).unwrap();

        assert_eq!(input.activity.total_checks, 3);
        assert_eq!(input.activity.unique_days, 2);
        assert_eq!(input.current_streak, 4);
        assert_eq!(input.mandalarts.len(), 1);
        assert_eq!(input.week_over_week_change, Some(200));
        assert_eq!(input.recent_badges, vec!["First week".to_string()]);
    }

    #[test]
    fn summary_uses_camel_case_keys() {
        let (_dir, database) = seeded_database();
        let bounds = period::resolve(Asia::Seoul, 7, ts("2026-03-10T03:00:00Z")).unwrap();
        let input =
            collect_period_input(&database, "u1", None, Asia::Seoul, Language::Ko, &bounds).unwrap();
        let summary = to_summary(&input).unwrap();

        assert_eq!(summary["totalChecks"], 3);
        assert!(summary["bestDay"].is_object());
        assert_eq!(summary["period"]["period_start_date"], "2026-03-03");
    }

    #[test]
    fn diagnosis_without_mandalart_is_not_found() {
        let (_dir, database) = seeded_database();
        let error = collect_diagnosis_input(&database, "nobody", None).unwrap_err();
        assert_eq!(crate::error::classify(&error), crate::error::ErrorCode::NotFound);
    }
}
