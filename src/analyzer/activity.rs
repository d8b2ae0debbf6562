use crate::db::CheckRecord;
use crate::model::{ActionType, Language};
use chrono::{Datelike, Timelike};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

const DAY_NAMES_KO: [&str; 7] = ["일요일", "월요일", "화요일", "수요일", "목요일", "금요일", "토요일"];
const DAY_NAMES_EN: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeBucket {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeBucket {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => TimeBucket::Morning,
            12..=17 => TimeBucket::Afternoon,
            18..=21 => TimeBucket::Evening,
            _ => TimeBucket::Night,
        }
    }

    pub fn label(self, language: Language) -> &'static str {
        match (self, language) {
            (TimeBucket::Morning, Language::Ko) => "아침",
            (TimeBucket::Afternoon, Language::Ko) => "오후",
            (TimeBucket::Evening, Language::Ko) => "저녁",
            (TimeBucket::Night, Language::Ko) => "밤",
            (TimeBucket::Morning, Language::En) => "morning",
            (TimeBucket::Afternoon, Language::En) => "afternoon",
            (TimeBucket::Evening, Language::En) => "evening",
            (TimeBucket::Night, Language::En) => "night",
        }
    }
}

pub fn day_name(weekday_from_sunday: u32, language: Language) -> &'static str {
    let names = match language {
        Language::Ko => &DAY_NAMES_KO,
        Language::En => &DAY_NAMES_EN,
    };
    names[(weekday_from_sunday % 7) as usize]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimePattern {
    pub morning: u32,
    pub afternoon: u32,
    pub evening: u32,
    pub night: u32,
}

impl TimePattern {
    fn bump(&mut self, bucket: TimeBucket) {
        match bucket {
            TimeBucket::Morning => self.morning += 1,
            TimeBucket::Afternoon => self.afternoon += 1,
            TimeBucket::Evening => self.evening += 1,
            TimeBucket::Night => self.night += 1,
        }
    }

    fn count(&self, bucket: TimeBucket) -> u32 {
        match bucket {
            TimeBucket::Morning => self.morning,
            TimeBucket::Afternoon => self.afternoon,
            TimeBucket::Evening => self.evening,
            TimeBucket::Night => self.night,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionTypePattern {
    pub routine: u32,
    pub mission: u32,
    pub reference: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub day: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeCount {
    pub period: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubGoalCount {
    pub id: String,
    pub title: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub total_checks: u32,
    pub unique_days: u32,
    pub weekday_pattern: BTreeMap<u32, u32>,
    pub time_pattern: TimePattern,
    pub action_type_pattern: ActionTypePattern,
    pub best_day: Option<DayCount>,
    pub worst_day: Option<DayCount>,
    pub best_time: Option<TimeCount>,
    pub best_sub_goal: Option<SubGoalCount>,
    pub worst_sub_goal: Option<SubGoalCount>,
    pub sub_goal_pattern: Vec<SubGoalCount>,
}

/// Aggregates checks in the user's local calendar. Ties keep whichever
/// value was seen first in `checks` order.
pub fn summarize_checks(checks: &[CheckRecord], tz: Tz, language: Language) -> ActivitySummary {
    let mut unique_days = HashSet::new();
    let mut weekday_order: Vec<(u32, u32)> = Vec::new();
    let mut bucket_order: Vec<TimeBucket> = Vec::new();
    let mut time_pattern = TimePattern::default();
    let mut action_type_pattern = ActionTypePattern::default();
    let mut sub_goal_pattern: Vec<SubGoalCount> = Vec::new();

    for check in checks {
        let local = check.checked_at.with_timezone(&tz);
        unique_days.insert(local.date_naive());

        let weekday = local.weekday().num_days_from_sunday();
        match weekday_order.iter_mut().find(|(day, _)| *day == weekday) {
            Some((_, count)) => *count += 1,
            None => weekday_order.push((weekday, 1)),
        }

        let bucket = TimeBucket::from_hour(local.hour());
        if !bucket_order.contains(&bucket) {
            bucket_order.push(bucket);
        }
        time_pattern.bump(bucket);

        match check.action_type {
            ActionType::Routine => action_type_pattern.routine += 1,
            ActionType::Mission => action_type_pattern.mission += 1,
            ActionType::Reference => action_type_pattern.reference += 1,
        }

        if let (Some(id), Some(title)) = (&check.sub_goal_id, &check.sub_goal_title) {
            match sub_goal_pattern.iter_mut().find(|entry| &entry.id == id) {
                Some(entry) => entry.count += 1,
                None => sub_goal_pattern.push(SubGoalCount {
                    id: id.clone(),
                    title: title.clone(),
                    count: 1,
                }),
            }
        }
    }

    let best_day = first_extreme(&weekday_order, |(_, count)| *count, |a, b| a > b)
        .map(|(day, count)| DayCount {
            day: day_name(*day, language).to_string(),
            count: *count,
        });
    let worst_day = first_extreme(&weekday_order, |(_, count)| *count, |a, b| a < b)
        .map(|(day, count)| DayCount {
            day: day_name(*day, language).to_string(),
            count: *count,
        });

    let best_time = first_extreme(&bucket_order, |bucket| time_pattern.count(*bucket), |a, b| a > b)
        .map(|bucket| TimeCount {
            period: bucket.label(language).to_string(),
            count: time_pattern.count(*bucket),
        });

    let best_sub_goal = first_extreme(&sub_goal_pattern, |entry| entry.count, |a, b| a > b).cloned();
    let worst_sub_goal = first_extreme(&sub_goal_pattern, |entry| entry.count, |a, b| a < b).cloned();

    ActivitySummary {
        total_checks: checks.len() as u32,
        unique_days: unique_days.len() as u32,
        weekday_pattern: weekday_order.iter().copied().collect(),
        time_pattern,
        action_type_pattern,
        best_day,
        worst_day,
        best_time,
        best_sub_goal,
        worst_sub_goal,
        sub_goal_pattern,
    }
}

fn first_extreme<T, K, F, C>(items: &[T], key: F, better: C) -> Option<&T>
where
    K: Copy,
    F: Fn(&T) -> K,
    C: Fn(K, K) -> bool,
{
    items.iter().fold(None, |current: Option<&T>, item| match current {
        Some(best) if !better(key(item), key(best)) => Some(best),
        _ => Some(item),
    })
}

/// Rounded percent change against the previous window, `None` without a baseline.
pub fn period_over_period_change(current: i64, previous: i64) -> Option<i64> {
    if previous <= 0 {
        return None;
    }

    let change = (current - previous) as f64 / previous as f64 * 100.0;
    Some(change.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use chrono_tz::Asia;

    fn check(id: i64, at: &str, kind: ActionType, sub_goal: Option<(&str, &str)>) -> CheckRecord {
        CheckRecord {
            id,
            checked_at: DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc),
            action_type: kind,
            sub_goal_id: sub_goal.map(|(id, _)| id.to_string()),
            sub_goal_title: sub_goal.map(|(_, title)| title.to_string()),
        }
    }

    #[test]
    fn empty_week_has_no_best_values() {
        let summary = summarize_checks(&[], Asia::Seoul, Language::Ko);
        assert_eq!(summary.total_checks, 0);
        assert_eq!(summary.unique_days, 0);
        assert!(summary.best_day.is_none());
        assert!(summary.best_time.is_none());
        assert!(summary.best_sub_goal.is_none());
    }

    #[test]
    fn buckets_use_local_hours() {
        // 22:30 UTC is 07:30 the next day in Seoul.
        let checks = vec![check(1, "2026-03-03T22:30:00Z", ActionType::Routine, None)];
        let summary = summarize_checks(&checks, Asia::Seoul, Language::Ko);

        assert_eq!(summary.time_pattern.morning, 1);
        assert_eq!(summary.best_time.unwrap().period, "아침");
        assert_eq!(summary.best_day.unwrap().day, "수요일");
    }

    #[test]
    fn ties_keep_first_encountered() {
        let checks = vec![
            check(1, "2026-03-05T01:00:00Z", ActionType::Routine, Some(("s2", "Sleep"))),
            check(2, "2026-03-03T01:00:00Z", ActionType::Mission, Some(("s1", "Run"))),
        ];
        let summary = summarize_checks(&checks, Asia::Seoul, Language::En);

        assert_eq!(summary.best_day.as_ref().unwrap().day, "Thursday");
        assert_eq!(summary.worst_day.as_ref().unwrap().day, "Thursday");
        assert_eq!(summary.best_sub_goal.as_ref().unwrap().id, "s2");
        assert_eq!(summary.worst_sub_goal.as_ref().unwrap().id, "s2");
        assert_eq!(summary.unique_days, 2);
        assert_eq!(summary.action_type_pattern.mission, 1);
    }

    #[test]
    fn best_and_worst_follow_counts() {
        let checks = vec![
            check(1, "2026-03-03T01:00:00Z", ActionType::Routine, Some(("s1", "Run"))),
            check(2, "2026-03-04T01:00:00Z", ActionType::Routine, Some(("s2", "Read"))),
            check(3, "2026-03-04T10:00:00Z", ActionType::Routine, Some(("s2", "Read"))),
        ];
        let summary = summarize_checks(&checks, Asia::Seoul, Language::En);

        assert_eq!(summary.best_day.unwrap(), DayCount { day: "Wednesday".to_string(), count: 2 });
        assert_eq!(summary.worst_day.unwrap().day, "Tuesday");
        assert_eq!(summary.best_sub_goal.unwrap().title, "Read");
        assert_eq!(summary.worst_sub_goal.unwrap().title, "Run");
        assert_eq!(summary.best_time.unwrap().period, "morning");
        assert_eq!(summary.time_pattern.evening, 1);
    }

    #[test]
    fn change_needs_a_baseline() {
        assert_eq!(period_over_period_change(5, 0), None);
        assert_eq!(period_over_period_change(6, 4), Some(50));
        assert_eq!(period_over_period_change(1, 3), Some(-67));
    }
}
