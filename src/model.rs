use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Email,
    Whatsapp,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Email => "email",
            DeliveryMode::Whatsapp => "whatsapp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Some(DeliveryMode::Email),
            "whatsapp" => Some(DeliveryMode::Whatsapp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobKind {
    DispatchSurvey,
    IngestSpreadsheet,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DispatchSurvey => "dispatch_survey",
            JobKind::IngestSpreadsheet => "ingest_spreadsheet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dispatch_survey" => Some(JobKind::DispatchSurvey),
            "ingest_spreadsheet" => Some(JobKind::IngestSpreadsheet),
            _ => None,
        }
    }
}

/// Survey send-status states. `Completed` and `Failed` are terminal; the db
/// layer rejects `Processing` updates once a terminal state is recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SendState {
    Processing,
    Completed,
    Failed,
}

impl SendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendState::Processing => "processing",
            SendState::Completed => "completed",
            SendState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PopulationState {
    Working,
    Completed,
    Failed,
}

impl PopulationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PopulationState::Working => "working",
            PopulationState::Completed => "completed",
            PopulationState::Failed => "failed",
        }
    }
}

/// Mutable dispatch-job payload; round-trips through the job queue on every
/// re-enqueue. `page` is 1-based; `total_persons` is fixed on page 1 and never
/// recomputed afterward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchPayload {
    pub survey_id: String,
    pub population_id: String,
    pub survey_title: String,
    pub delivery_modes: Vec<DeliveryMode>,
    pub page: i64,
    pub last_processed_index: i64,
    pub total_persons: Option<i64>,
    pub page_size: i64,
}

impl DispatchPayload {
    pub fn new(
        survey_id: String,
        population_id: String,
        survey_title: String,
        delivery_modes: Vec<DeliveryMode>,
        page_size: i64,
    ) -> Self {
        Self {
            survey_id,
            population_id,
            survey_title,
            delivery_modes,
            page: 1,
            last_processed_index: 0,
            total_persons: None,
            page_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PopulationRef {
    pub id: String,
    pub name: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionPayload {
    pub file_path: String,
    pub population: PopulationRef,
    pub last_row: i64,
    pub total: i64,
}

/// Typed custom-field value for extra spreadsheet columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CustomValue {
    Bool(bool),
    Number(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

pub type CustomFields = BTreeMap<String, CustomValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub id: String,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPerson {
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub custom_fields: CustomFields,
}

/// Whole-percent progress, floored. A zero or unknown total reports 100 so a
/// finished empty run still reads as done.
pub fn percent(processed: i64, total: i64) -> i64 {
    if total <= 0 {
        return 100;
    }
    (processed * 100 / total).min(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_floors_and_caps() {
        assert_eq!(percent(0, 250), 0);
        assert_eq!(percent(100, 250), 40);
        assert_eq!(percent(149, 250), 59);
        assert_eq!(percent(250, 250), 100);
        assert_eq!(percent(300, 250), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn dispatch_payload_round_trips_unchanged() {
        let payload = DispatchPayload::new(
            "survey-1".into(),
            "pop-1".into(),
            "Quarterly survey".into(),
            vec![DeliveryMode::Email, DeliveryMode::Whatsapp],
            100,
        );
        let json = serde_json::to_string(&payload).unwrap();
        let back: DispatchPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.page, 1);
        assert_eq!(back.last_processed_index, 0);
        assert!(back.total_persons.is_none());
    }

    #[test]
    fn custom_value_keeps_types_through_json() {
        let mut fields = CustomFields::new();
        fields.insert("team".into(), CustomValue::Text("ops".into()));
        fields.insert("score".into(), CustomValue::Number(3.5));
        fields.insert("active".into(), CustomValue::Bool(true));
        fields.insert(
            "joined_at".into(),
            CustomValue::Timestamp("2024-05-01T00:00:00Z".parse().unwrap()),
        );
        let json = serde_json::to_string(&fields).unwrap();
        let back: CustomFields = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fields);
    }
}
