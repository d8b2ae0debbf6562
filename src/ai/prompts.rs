use crate::model::{Language, ReportType};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

pub fn build(report_type: ReportType, language: Language, data: &Value) -> Prompt {
    match report_type {
        ReportType::Weekly => weekly(language, data),
        ReportType::Diagnosis => diagnosis(language, data),
        ReportType::Monthly => monthly(language, data),
        ReportType::Insight | ReportType::Prediction | ReportType::Struggling => {
            generic(report_type, language, data)
        }
    }
}

fn text(value: &Value, pointer: &str, fallback: &str) -> String {
    match value.pointer(pointer) {
        Some(Value::String(raw)) if !raw.trim().is_empty() => raw.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => fallback.to_string(),
    }
}

fn number(value: &Value, pointer: &str) -> i64 {
    value.pointer(pointer).and_then(Value::as_i64).unwrap_or(0)
}

fn change_text(language: Language, data: &Value) -> String {
    match (data.get("weekOverWeekChange").and_then(Value::as_i64), language) {
        (Some(change), Language::Ko) => format!("이전 기간 대비 {change:+}%"),
        (Some(change), Language::En) => format!("{change:+}% vs previous period"),
        (None, Language::Ko) => "비교 데이터 없음".to_string(),
        (None, Language::En) => "no comparison data".to_string(),
    }
}

fn badges_text(language: Language, data: &Value) -> String {
    let badges = data
        .get("recentBadges")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    if !badges.is_empty() {
        return badges;
    }

    match language {
        Language::Ko => "없음".to_string(),
        Language::En => "none".to_string(),
    }
}

fn json_only_rules(language: Language) -> &'static str {
    match language {
        Language::Ko => {
            "반드시 유효한 JSON 객체 하나로만 응답하세요. 마크다운 코드 블록을 사용하지 마세요. 수치는 제공된 데이터를 그대로 사용하세요."
        }
        Language::En => {
            "Respond with exactly one valid JSON object and nothing else. Do not use markdown code fences. Use the numbers from the supplied data verbatim."
        }
    }
}

fn weekly(language: Language, data: &Value) -> Prompt {
    let schema = r#"{
  "headline": "...",
  "key_metrics": [{"label": "...", "value": "..."}, {"label": "...", "value": "..."}, {"label": "...", "value": "..."}],
  "strengths": ["..."],
  "improvements": {"problem": "...", "insight": "..."},
  "action_plan": {"goal": "...", "steps": ["..."]}
}"#;

    let unknown = "-";

    match language {
        Language::Ko => Prompt {
            system: format!(
                "당신은 데이터 분석 전문가입니다. 사용자의 실천 패턴을 분석하여 인사이트만 제공하세요.\n{}\n\n정확한 JSON 형식:\n{schema}\n\nkey_metrics는 총 실천 횟수, 실천일수, 이전 기간 대비 세 가지입니다.",
                json_only_rules(language)
            ),
            user: format!(
                "다음 데이터에서 패턴을 찾아 인사이트를 제공하세요:\n\n[기간] {} ~ {} ({})\n\n[실천 현황]\n- 총 실천 횟수: {}회 ({})\n- 실천일수: {}일\n- 스트릭: 현재 {}일, 최고 {}일\n- 새로 획득한 배지: {}\n\n[시간 패턴]\n- 요일별 분포: {}\n- 시간대 분포: {}\n- 최고 활동: {} {}회\n- 최저 활동: {} {}회\n- 선호 시간: {} {}회\n\n[목표 성과]\n- 최고 성과: {} ({}회)\n- 개선 필요: {} ({}회)\n\n[실천 타입]\n- 루틴: {}회\n- 미션: {}회",
                text(data, "/period/period_start_date", unknown),
                text(data, "/period/period_end_date", unknown),
                text(data, "/period/user_timezone", unknown),
                number(data, "/totalChecks"),
                change_text(language, data),
                number(data, "/uniqueDays"),
                number(data, "/currentStreak"),
                number(data, "/longestStreak"),
                badges_text(language, data),
                data.get("weekdayPattern").cloned().unwrap_or(Value::Null),
                data.get("timePattern").cloned().unwrap_or(Value::Null),
                text(data, "/bestDay/day", unknown),
                number(data, "/bestDay/count"),
                text(data, "/worstDay/day", unknown),
                number(data, "/worstDay/count"),
                text(data, "/bestTime/period", unknown),
                number(data, "/bestTime/count"),
                text(data, "/bestSubGoal/title", unknown),
                number(data, "/bestSubGoal/count"),
                text(data, "/worstSubGoal/title", unknown),
                number(data, "/worstSubGoal/count"),
                number(data, "/actionTypePattern/routine"),
                number(data, "/actionTypePattern/mission"),
            ),
        },
        Language::En => Prompt {
            system: format!(
                "You are a data analyst. Analyze the user's practice patterns and provide insights only.\n{}\n\nExact JSON shape:\n{schema}\n\nkey_metrics must be total checks, active days and change vs previous period.",
                json_only_rules(language)
            ),
            user: format!(
                "Find patterns in the following data:\n\n[Period] {} to {} ({})\n\n[Activity]\n- Total checks: {} ({})\n- Active days: {}\n- Streak: current {} days, longest {} days\n- New badges: {}\n\n[Timing]\n- By weekday: {}\n- By time of day: {}\n- Best day: {} ({})\n- Weakest day: {} ({})\n- Preferred time: {} ({})\n\n[Goals]\n- Strongest: {} ({})\n- Needs attention: {} ({})\n\n[Action types]\n- Routine: {}\n- Mission: {}",
                text(data, "/period/period_start_date", unknown),
                text(data, "/period/period_end_date", unknown),
                text(data, "/period/user_timezone", unknown),
                number(data, "/totalChecks"),
                change_text(language, data),
                number(data, "/uniqueDays"),
                number(data, "/currentStreak"),
                number(data, "/longestStreak"),
                badges_text(language, data),
                data.get("weekdayPattern").cloned().unwrap_or(Value::Null),
                data.get("timePattern").cloned().unwrap_or(Value::Null),
                text(data, "/bestDay/day", unknown),
                number(data, "/bestDay/count"),
                text(data, "/worstDay/day", unknown),
                number(data, "/worstDay/count"),
                text(data, "/bestTime/period", unknown),
                number(data, "/bestTime/count"),
                text(data, "/bestSubGoal/title", unknown),
                number(data, "/bestSubGoal/count"),
                text(data, "/worstSubGoal/title", unknown),
                number(data, "/worstSubGoal/count"),
                number(data, "/actionTypePattern/routine"),
                number(data, "/actionTypePattern/mission"),
            ),
        },
    }
}

fn diagnosis(language: Language, data: &Value) -> Prompt {
    let schema = r#"{
  "headline": "...",
  "structure_metrics": [{"label": "...", "value": "..."}, {"label": "...", "value": "..."}, {"label": "...", "value": "..."}],
  "strengths": ["..."],
  "improvements": [{"area": "...", "issue": "...", "solution": "..."}],
  "priority_tasks": ["..."]
}"#;
    let structure = |key: &str| number(data, &format!("/structureAnalysis/{key}"));

    match language {
        Language::Ko => Prompt {
            system: format!(
                "당신은 만다라트 구조 분석 전문가입니다. SMART 원칙 기반으로 개선 방향만 제시하세요.\n{}\n\n정확한 JSON 형식:\n{schema}\n\nstructure_metrics는 완성도, 구체성, 측정 가능성 세 가지입니다.",
                json_only_rules(language)
            ),
            user: format!(
                "만다라트 구조를 분석하여 개선점을 제시하세요:\n\n[기본 정보]\n- 중심 목표: \"{}\"\n\n[구조 분석]\n- 전체 항목: {}개 중 {}개 작성 ({}%)\n- 평균 텍스트 길이: {}자\n- 측정 가능성: {}% (실천 항목 {}개 중 {}개)\n- 구체성: {}% ({}개)\n- 타입 분포: 루틴 {}개, 미션 {}개, 참고 {}개",
                text(data, "/mandalart/center_goal", "미설정"),
                structure("totalItems"),
                structure("filledItems"),
                structure("fillRate"),
                structure("avgTextLength"),
                structure("measurableRate"),
                structure("trackableItems"),
                structure("measurableItems"),
                structure("specificityRate"),
                structure("specificItems"),
                number(data, "/structureAnalysis/typeDistribution/routine"),
                number(data, "/structureAnalysis/typeDistribution/mission"),
                number(data, "/structureAnalysis/typeDistribution/reference"),
            ),
        },
        Language::En => Prompt {
            system: format!(
                "You are a mandalart structure analyst. Suggest improvements based on SMART principles only.\n{}\n\nExact JSON shape:\n{schema}\n\nstructure_metrics must be completeness, specificity and measurability.",
                json_only_rules(language)
            ),
            user: format!(
                "Analyze this mandalart's structure and suggest improvements:\n\n[Basics]\n- Center goal: \"{}\"\n\n[Structure]\n- Items: {} of {} filled ({}%)\n- Average text length: {} chars\n- Measurability: {}% ({} of {} trackable items)\n- Specificity: {}% ({} items)\n- Types: routine {}, mission {}, reference {}",
                text(data, "/mandalart/center_goal", "not set"),
                structure("filledItems"),
                structure("totalItems"),
                structure("fillRate"),
                structure("avgTextLength"),
                structure("measurableRate"),
                structure("measurableItems"),
                structure("trackableItems"),
                structure("specificityRate"),
                structure("specificItems"),
                number(data, "/structureAnalysis/typeDistribution/routine"),
                number(data, "/structureAnalysis/typeDistribution/mission"),
                number(data, "/structureAnalysis/typeDistribution/reference"),
            ),
        },
    }
}

fn monthly(language: Language, data: &Value) -> Prompt {
    let schema = r#"{
  "headline": "...",
  "key_metrics": [{"label": "...", "value": "..."}],
  "trends": ["..."],
  "action_plan": {"goal": "...", "steps": ["...", "...", "..."]}
}"#;

    match language {
        Language::Ko => Prompt {
            system: format!(
                "당신은 사용자의 장기 목표 달성을 돕는 전문 코치입니다. 월간 활동을 분석해 성과, 트렌드, 다음 달 전략 3가지를 제시하세요.\n{}\n\n정확한 JSON 형식:\n{schema}",
                json_only_rules(language)
            ),
            user: format!(
                "지난 30일 활동 데이터 ({} ~ {}):\n- 총 실천 횟수: {}회 ({})\n- 활동 일수: {}일\n- 가장 활발했던 요일: {} ({}회)\n- 가장 부진했던 요일: {} ({}회)\n- 선호 시간대: {} ({}회)\n- 최고 성과 목표: {} ({}회)\n- 개선 필요 목표: {} ({}회)",
                text(data, "/period/period_start_date", "-"),
                text(data, "/period/period_end_date", "-"),
                number(data, "/totalChecks"),
                change_text(language, data),
                number(data, "/uniqueDays"),
                text(data, "/bestDay/day", "-"),
                number(data, "/bestDay/count"),
                text(data, "/worstDay/day", "-"),
                number(data, "/worstDay/count"),
                text(data, "/bestTime/period", "-"),
                number(data, "/bestTime/count"),
                text(data, "/bestSubGoal/title", "-"),
                number(data, "/bestSubGoal/count"),
                text(data, "/worstSubGoal/title", "-"),
                number(data, "/worstSubGoal/count"),
            ),
        },
        Language::En => Prompt {
            system: format!(
                "You are a coach helping the user reach long-term goals. Review the month: overall results, trends and three concrete strategies for next month.\n{}\n\nExact JSON shape:\n{schema}",
                json_only_rules(language)
            ),
            user: format!(
                "Activity for the last 30 days ({} to {}):\n- Total checks: {} ({})\n- Active days: {}\n- Most active day: {} ({})\n- Least active day: {} ({})\n- Preferred time: {} ({})\n- Strongest goal: {} ({})\n- Goal needing attention: {} ({})",
                text(data, "/period/period_start_date", "-"),
                text(data, "/period/period_end_date", "-"),
                number(data, "/totalChecks"),
                change_text(language, data),
                number(data, "/uniqueDays"),
                text(data, "/bestDay/day", "-"),
                number(data, "/bestDay/count"),
                text(data, "/worstDay/day", "-"),
                number(data, "/worstDay/count"),
                text(data, "/bestTime/period", "-"),
                number(data, "/bestTime/count"),
                text(data, "/bestSubGoal/title", "-"),
                number(data, "/bestSubGoal/count"),
                text(data, "/worstSubGoal/title", "-"),
                number(data, "/worstSubGoal/count"),
            ),
        },
    }
}

fn generic(report_type: ReportType, language: Language, data: &Value) -> Prompt {
    let schema = r#"{"headline": "...", "insights": ["..."]}"#;
    let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());

    let focus = match (report_type, language) {
        (ReportType::Prediction, Language::Ko) => "다음 주 실천 흐름을 예측하고 주의할 점을 알려주세요.",
        (ReportType::Prediction, Language::En) => "Predict next week's momentum and what to watch out for.",
        (ReportType::Struggling, Language::Ko) => "사용자가 어려움을 겪는 목표를 찾아 회복 방법을 제안하세요.",
        (ReportType::Struggling, Language::En) => "Find the goals the user is struggling with and suggest a way back.",
        (_, Language::Ko) => "간단하고 유용한 인사이트를 제공하세요.",
        (_, Language::En) => "Provide short, useful insights.",
    };

    match language {
        Language::Ko => Prompt {
            system: format!(
                "당신은 목표 달성 코치입니다. {focus}\n{}\n\n정확한 JSON 형식:\n{schema}",
                json_only_rules(language)
            ),
            user: format!("사용자의 활동 데이터:\n{pretty}"),
        },
        Language::En => Prompt {
            system: format!(
                "You are a goal achievement coach. {focus}\n{}\n\nExact JSON shape:\n{schema}",
                json_only_rules(language)
            ),
            user: format!("The user's activity data:\n{pretty}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn weekly_prompt_embeds_actual_metrics() {
        let data = json!({
            "totalChecks": 42,
            "uniqueDays": 6,
            "weekOverWeekChange": 15,
            "bestDay": {"day": "목요일", "count": 9},
            "recentBadges": ["7일 연속"],
            "period": {"period_start_date": "2026-03-03", "period_end_date": "2026-03-09", "user_timezone": "Asia/Seoul"}
        });
        let prompt = build(ReportType::Weekly, Language::Ko, &data);

        assert!(prompt.user.contains("총 실천 횟수: 42회 (이전 기간 대비 +15%)"));
        assert!(prompt.user.contains("목요일 9회"));
        assert!(prompt.user.contains("7일 연속"));
        assert!(prompt.system.contains("key_metrics"));
    }

    #[test]
    fn english_prompt_without_baseline() {
        let prompt = build(ReportType::Weekly, Language::En, &json!({"totalChecks": 0}));
        assert!(prompt.user.contains("Total checks: 0 (no comparison data)"));
        assert!(prompt.user.contains("New badges: none"));
    }

    #[test]
    fn diagnosis_prompt_uses_structure_numbers() {
        let data = json!({
            "mandalart": {"center_goal": "Run a marathon"},
            "structureAnalysis": {"totalItems": 73, "filledItems": 40, "fillRate": 55}
        });
        let prompt = build(ReportType::Diagnosis, Language::En, &data);
        assert!(prompt.user.contains("Items: 40 of 73 filled (55%)"));
        assert!(prompt.user.contains("Run a marathon"));
    }
}
