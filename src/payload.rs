use serde::Deserialize;
use serde_json::Value;

use crate::error::HandlerError;

pub const DEFAULT_EMAIL_SUBJECT: &str = "Task Scheduler Email";
pub const DEFAULT_EMAIL_BODY: &str = "Hello from Task Scheduler!";
pub const DEFAULT_REPORT_TITLE: &str = "Task Report";
pub const DEFAULT_REPORT_CONTENT: &str = "No content provided";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailPayload {
  pub to: String,
  pub subject: String,
  pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPayload {
  pub title: String,
  pub content: String,
}

/// The validated, typed form of a task's `(task_type, payload)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
  SendMessage { text: String },
  SendEmail(EmailPayload),
  GenerateReport(ReportPayload),
  Unknown(String),
}

#[derive(Deserialize, Default)]
struct RawEmail {
  to: Option<String>,
  subject: Option<String>,
  content: Option<String>,
  body: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawReport {
  title: Option<String>,
  content: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.filter(|s| !s.trim().is_empty())
}

fn object_payload<T: for<'de> Deserialize<'de>>(task_type: &str, payload: &Value) -> Result<T, HandlerError> {
  if !payload.is_object() {
    return Err(HandlerError::Validation(format!("{task_type} payload must be a JSON object")));
  }
  serde_json::from_value(payload.clone())
    .map_err(|e| HandlerError::Validation(format!("invalid {task_type} payload: {e}")))
}

impl TaskKind {
  pub fn parse(task_type: &str, payload: &Value) -> Result<TaskKind, HandlerError> {
    match task_type {
      "send_message" => Ok(TaskKind::SendMessage { text: message_text(payload) }),
      "send_email" => {
        let raw: RawEmail = object_payload(task_type, payload)?;
        let to = non_empty(raw.to)
          .ok_or_else(|| HandlerError::Validation("Recipient email missing in payload".into()))?;
        Ok(TaskKind::SendEmail(EmailPayload {
          to,
          subject: non_empty(raw.subject).unwrap_or_else(|| DEFAULT_EMAIL_SUBJECT.into()),
          body: non_empty(raw.content)
            .or_else(|| non_empty(raw.body))
            .unwrap_or_else(|| DEFAULT_EMAIL_BODY.into()),
        }))
      }
      "generate_report" => {
        let raw: RawReport = if payload.is_null() { RawReport::default() } else { object_payload(task_type, payload)? };
        Ok(TaskKind::GenerateReport(ReportPayload {
          title: non_empty(raw.title).unwrap_or_else(|| DEFAULT_REPORT_TITLE.into()),
          content: non_empty(raw.content).unwrap_or_else(|| DEFAULT_REPORT_CONTENT.into()),
        }))
      }
      other => Ok(TaskKind::Unknown(other.to_string())),
    }
  }
}

/// Strings are used verbatim, anything else as compact JSON.
fn message_text(payload: &Value) -> String {
  match payload {
    Value::String(text) => text.clone(),
    other => other.to_string(),
  }
}
