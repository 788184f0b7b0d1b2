//! Action item commands, persisted records and captured processing errors

use crate::error::{IngestError, IngestResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Command decoded from an inbound record payload.
///
/// Every field is optional on the wire so that missing fields surface as
/// validation failures rather than format failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionItemCommand {
    pub title: Option<String>,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub category: Option<String>,
    pub type_code: Option<String>,
    pub status: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ActionItemCommand {
    /// Decode a JSON payload
    pub fn from_payload(payload: &[u8]) -> IngestResult<Self> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(IngestError::Deserialization(
                "record payload is empty".to_string(),
            ));
        }
        Ok(serde_json::from_slice(payload)?)
    }

    /// Field-presence checks
    pub fn validate(&self) -> IngestResult<()> {
        let mut violations = Vec::new();

        if is_blank(&self.title) {
            violations.push("title is required".to_string());
        }
        if is_blank(&self.type_code) {
            violations.push("typeCode is required".to_string());
        }
        if is_blank(&self.status) {
            violations.push("status is required".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(IngestError::Validation(violations))
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// A persisted action item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionItem {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub category: Option<String>,
    pub type_code: String,
    pub status: String,
    pub due_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionItem {
    /// Build a record from a command, validating it first
    pub fn from_command(id: Uuid, command: ActionItemCommand, now: DateTime<Utc>) -> IngestResult<Self> {
        command.validate()?;

        let created_at = command.created_at.unwrap_or(now);
        Ok(Self {
            id,
            title: command.title.unwrap_or_default(),
            description: command.description,
            assignee: command.assignee,
            category: command.category,
            type_code: command.type_code.unwrap_or_default(),
            status: command.status.unwrap_or_default(),
            due_date: command.due_date,
            created_at,
            updated_at: command.updated_at.unwrap_or(created_at),
        })
    }
}

/// Lifecycle marker of a captured error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStatus {
    /// Captured, not yet looked at
    New,
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStatus::New => write!(f, "NEW"),
        }
    }
}

/// Diagnostic record of a failed unit of work. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingError {
    pub id: Uuid,
    pub source: String,
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: String,
    /// Raw bytes of the failed record, base64 on the wire
    #[serde(default, with = "payload_bytes")]
    pub payload: Option<Vec<u8>>,
    pub occurred_at: DateTime<Utc>,
    pub status: ErrorStatus,
}

impl ProcessingError {
    /// Build from a failure and the original payload
    pub fn from_error(source: &str, error: &IngestError, payload: Option<&[u8]>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            error_type: error.kind().to_string(),
            error_message: error.to_string(),
            stack_trace: render_error_chain(error),
            payload: payload.map(<[u8]>::to_vec),
            occurred_at: Utc::now(),
            status: ErrorStatus::New,
        }
    }

    /// Payload as text, when it is valid UTF-8
    pub fn payload_text(&self) -> Option<&str> {
        self.payload
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

mod payload_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match payload {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Flatten an error and its sources into one line per cause
pub fn render_error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = format!("{}", error);
    let mut current = error.source();
    while let Some(cause) = current {
        rendered.push_str("\nCaused by: ");
        rendered.push_str(&cause.to_string());
        current = cause.source();
    }
    rendered
}
