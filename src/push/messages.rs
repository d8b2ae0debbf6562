use crate::model::Language;

pub const COMEBACK_DAYS: [i64; 3] = [3, 7, 14];
pub const STREAK_WARNING_MIN: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub body: String,
}

pub fn weekly_report_ready(nickname: &str, language: Language) -> Notice {
    match language {
        Language::Ko => Notice {
            title: format!("{nickname}님의 주간 리포트가 도착했어요!"),
            body: "지난 주 실천 패턴을 확인해보세요.".to_string(),
        },
        Language::En => Notice {
            title: format!("{nickname}, your weekly report is ready!"),
            body: "Check how last week went.".to_string(),
        },
    }
}

pub fn streak_warning(nickname: &str, streak: i64, language: Language) -> Notice {
    match language {
        Language::Ko if streak >= 30 => Notice {
            title: format!("{nickname}님, 🏆 {streak}일 대기록을 지켜주세요!"),
            body: "한 달 넘게 이어온 스트릭이에요.".to_string(),
        },
        Language::Ko if streak >= 7 => Notice {
            title: format!("{nickname}님, {streak}일 스트릭이 위험해요! 🔥"),
            body: "오늘 놓치면 처음부터예요.".to_string(),
        },
        Language::Ko => Notice {
            title: format!("{nickname}님, {streak}일 스트릭을 이어가세요! 🔥"),
            body: "자정 전에 1개만 실천하면 유지돼요.".to_string(),
        },
        Language::En if streak >= 30 => Notice {
            title: format!("{nickname}, protect your 🏆 {streak}-day record!"),
            body: "You've kept this streak for over a month.".to_string(),
        },
        Language::En if streak >= 7 => Notice {
            title: format!("{nickname}, your {streak}-day streak is at risk! 🔥"),
            body: "Miss today and it starts over.".to_string(),
        },
        Language::En => Notice {
            title: format!("{nickname}, keep your {streak}-day streak going! 🔥"),
            body: "One check before midnight keeps it alive.".to_string(),
        },
    }
}

pub fn comeback(nickname: &str, days: i64, language: Language) -> Notice {
    let (title, body) = match (days, language) {
        (3, Language::Ko) => (format!("{nickname}님, 다시 시작해볼까요? 💪"), "오늘 1개만 실천해보세요."),
        (7, Language::Ko) => (format!("{nickname}님, 목표가 기다리고 있어요 🎯"), "언제든 다시 시작할 수 있어요."),
        (14, Language::Ko) => (
            format!("{nickname}님, 새로운 목표를 세워볼까요? ✨"),
            "만다라트를 수정하거나 새 목표를 만들어보세요.",
        ),
        (_, Language::Ko) => (format!("{nickname}님, 다시 시작해볼까요?"), "목표가 기다리고 있어요."),
        (3, Language::En) => (format!("{nickname}, ready to start again? 💪"), "Try just one check today."),
        (7, Language::En) => (format!("{nickname}, your goals are waiting 🎯"), "You can restart anytime."),
        (14, Language::En) => (
            format!("{nickname}, time for a fresh goal? ✨"),
            "Edit your mandalart or create a new one.",
        ),
        (_, Language::En) => (format!("{nickname}, ready to start again?"), "Your goals are waiting."),
    };

    Notice {
        title,
        body: body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streak_tiers() {
        assert!(streak_warning("민지", 3, Language::Ko).title.contains("이어가세요"));
        assert!(streak_warning("민지", 7, Language::Ko).title.contains("위험해요"));
        assert!(streak_warning("민지", 30, Language::Ko).title.contains("대기록"));
        assert!(streak_warning("Sam", 12, Language::En).title.contains("at risk"));
    }

    #[test]
    fn comeback_messages_by_day() {
        assert_eq!(comeback("민지", 3, Language::Ko).body, "오늘 1개만 실천해보세요.");
        assert!(comeback("Sam", 14, Language::En).body.contains("mandalart"));
        assert_eq!(comeback("Sam", 5, Language::En).body, "Your goals are waiting.");
    }
}
