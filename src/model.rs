use crate::error::ReportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Weekly,
    Diagnosis,
    Monthly,
    Insight,
    Prediction,
    Struggling,
}

impl ReportType {
    pub const ALL: [ReportType; 6] = [
        ReportType::Weekly,
        ReportType::Diagnosis,
        ReportType::Monthly,
        ReportType::Insight,
        ReportType::Prediction,
        ReportType::Struggling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReportType::Weekly => "weekly",
            ReportType::Diagnosis => "diagnosis",
            ReportType::Monthly => "monthly",
            ReportType::Insight => "insight",
            ReportType::Prediction => "prediction",
            ReportType::Struggling => "struggling",
        }
    }

    /// Bumped whenever the prompt template or the expected output shape
    /// changes, which invalidates every cached report of that type.
    pub fn prompt_version(self) -> &'static str {
        match self {
            ReportType::Weekly => "weekly-v3",
            ReportType::Diagnosis => "diagnosis-v3",
            ReportType::Monthly => "monthly-v2",
            ReportType::Insight | ReportType::Prediction | ReportType::Struggling => "generic-v1",
        }
    }

    /// Number of local calendar days the report looks back over. Diagnosis
    /// is structural and has no window.
    pub fn lookback_days(self) -> Option<u32> {
        match self {
            ReportType::Diagnosis => None,
            ReportType::Monthly => Some(30),
            ReportType::Weekly
            | ReportType::Insight
            | ReportType::Prediction
            | ReportType::Struggling => Some(7),
        }
    }

    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            ReportType::Weekly => &[
                "headline",
                "key_metrics",
                "strengths",
                "improvements",
                "action_plan",
            ],
            ReportType::Diagnosis => &[
                "headline",
                "structure_metrics",
                "strengths",
                "improvements",
                "priority_tasks",
            ],
            ReportType::Monthly => &["headline", "key_metrics", "trends", "action_plan"],
            ReportType::Insight | ReportType::Prediction | ReportType::Struggling => {
                &["headline", "insights"]
            }
        }
    }

    /// Env-var segment used for per-type overrides such as `REPORT_WEEKLY_MODEL`.
    pub fn env_segment(self) -> String {
        self.as_str().to_ascii_uppercase()
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportType {
    type Err = ReportError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        ReportType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                ReportError::Validation(format!(
                    "Unsupported report_type: {raw}. Expected one of weekly|diagnosis|monthly|insight|prediction|struggling"
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Ko,
    En,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Ko => "ko",
            Language::En => "en",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ReportError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ko" | "kr" | "korean" => Ok(Language::Ko),
            "en" | "english" => Ok(Language::En),
            other => Err(ReportError::Validation(format!(
                "Unsupported language: {other}. Expected ko|en"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Routine,
    Mission,
    Reference,
}

impl ActionType {
    /// Missing or unknown types count as routine.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("mission") => ActionType::Mission,
            Some("reference") => ActionType::Reference,
            _ => ActionType::Routine,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Routine => "routine",
            ActionType::Mission => "mission",
            ActionType::Reference => "reference",
        }
    }

    pub fn is_trackable(self) -> bool {
        !matches!(self, ActionType::Reference)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub report_type: ReportType,
    pub user_id: String,
    #[serde(default)]
    pub mandalart_id: Option<String>,
    #[serde(default)]
    pub language: Language,
}

impl ReportRequest {
    pub fn validate(&self) -> Result<(), ReportError> {
        if self.user_id.trim().is_empty() {
            return Err(ReportError::Validation("user_id is required".to_string()));
        }

        if let Some(mandalart_id) = &self.mandalart_id {
            if mandalart_id.trim().is_empty() {
                return Err(ReportError::Validation(
                    "mandalart_id must not be blank".to_string(),
                ));
            }
        }

        Ok(())
    }
}
