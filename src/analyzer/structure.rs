use crate::db::MandalartTree;
use crate::model::ActionType;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// 1 center goal + 8 sub-goals + 64 actions.
pub const ITEMS_PER_MANDALART: u32 = 73;

static SPECIFIC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)",
        r"\d+\s*(개|회|시간|시|분|초|일|주|월|년|번|차|명|페이지|쪽|권|km|k|m|kg|%|점)",
        r"|\d+\s*[~-]\s*\d+",
        r"|\d+\s*(times?|x|hours?|hrs?|minutes?|mins?|seconds?|days?|weeks?|months?|pages?|books?|reps?|sets?|steps?)\b",
        r"|\d{1,2}:\d{2}",
        r"|\b\d{1,2}\s*(am|pm)\b",
        r"|(매일|매주|매월|평일|주말|아침|저녁|월요일|화요일|수요일|목요일|금요일|토요일|일요일)",
        r"|\b(daily|weekly|monthly|every|weekdays?|weekends?|mondays?|tuesdays?|wednesdays?|thursdays?|fridays?|saturdays?|sundays?)\b",
    ))
    .expect("valid specificity pattern")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeDistribution {
    pub routine: u32,
    pub mission: u32,
    pub reference: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureAnalysis {
    pub total_mandalarts: u32,
    pub total_items: u32,
    pub filled_items: u32,
    pub empty_items: u32,
    pub fill_rate: u32,
    pub avg_text_length: u32,
    pub type_distribution: TypeDistribution,
    pub trackable_items: u32,
    pub measurable_items: u32,
    pub measurable_rate: u32,
    pub specific_items: u32,
    pub specificity_rate: u32,
}

pub fn is_specific_text(title: &str) -> bool {
    SPECIFIC_PATTERN.is_match(title)
}

pub fn analyze(mandalarts: &[MandalartTree]) -> StructureAnalysis {
    let total_items = mandalarts.len() as u32 * ITEMS_PER_MANDALART;

    let mut filled_items = 0_u32;
    let mut text_chars = 0_usize;
    let mut type_distribution = TypeDistribution::default();
    let mut trackable_items = 0_u32;
    let mut measurable_items = 0_u32;
    let mut specific_items = 0_u32;

    let mut count_text = |text: &str| -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return false;
        }
        filled_items += 1;
        text_chars += trimmed.chars().count();
        true
    };

    for mandalart in mandalarts {
        count_text(&mandalart.center_goal);

        for sub_goal in &mandalart.sub_goals {
            count_text(&sub_goal.title);

            for action in &sub_goal.actions {
                if !count_text(&action.title) {
                    continue;
                }

                match action.action_type {
                    ActionType::Routine => type_distribution.routine += 1,
                    ActionType::Mission => type_distribution.mission += 1,
                    ActionType::Reference => type_distribution.reference += 1,
                }

                if !action.action_type.is_trackable() {
                    continue;
                }
                trackable_items += 1;

                let criterion = match action.action_type {
                    ActionType::Routine => action.routine_frequency.as_deref(),
                    ActionType::Mission => action.mission_completion_type.as_deref(),
                    ActionType::Reference => None,
                };
                let measurable = criterion.is_some_and(|value| !value.trim().is_empty());
                if measurable {
                    measurable_items += 1;
                }
                if measurable || is_specific_text(&action.title) {
                    specific_items += 1;
                }
            }
        }
    }

    StructureAnalysis {
        total_mandalarts: mandalarts.len() as u32,
        total_items,
        filled_items,
        empty_items: total_items.saturating_sub(filled_items),
        fill_rate: percent(filled_items as u64, total_items as u64),
        avg_text_length: rounded_average(text_chars as u64, filled_items as u64),
        type_distribution,
        trackable_items,
        measurable_items,
        measurable_rate: percent(measurable_items as u64, trackable_items as u64),
        specific_items,
        specificity_rate: percent(specific_items as u64, trackable_items as u64),
    }
}

fn percent(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        return 0;
    }
    ((part as f64 / whole as f64) * 100.0).round() as u32
}

fn rounded_average(total: u64, count: u64) -> u32 {
    if count == 0 {
        return 0;
    }
    (total as f64 / count as f64).round() as u32
}
