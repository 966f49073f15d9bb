use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{HandlerError, StoreError};
use crate::mail::MailTransport;
use crate::models::LogEntry;
use crate::payload::{EmailPayload, ReportPayload, TaskKind};
use crate::report::ReportRenderer;
use crate::store::TaskStore;

/// External systems the type handlers delegate to.
#[derive(Clone)]
pub struct Collaborators {
  pub mail: Arc<dyn MailTransport>,
  pub reports: Arc<dyn ReportRenderer>,
}

/// Appends progress lines to one task's log as they happen.
pub struct TaskLog<'a> {
  store: &'a dyn TaskStore,
  task_id: Uuid,
}

impl<'a> TaskLog<'a> {
  pub fn new(store: &'a dyn TaskStore, task_id: Uuid) -> Self {
    Self { store, task_id }
  }

  pub async fn log_message(&self, message: impl Into<String>) -> Result<(), StoreError> {
    self.store.append_log(self.task_id, &LogEntry::new(message)).await
  }
}

/// Runs the handler for `kind` and returns the task's result text.
pub async fn process(
  kind: &TaskKind,
  task_id: Uuid,
  log: &TaskLog<'_>,
  collaborators: &Collaborators,
) -> Result<String, HandlerError> {
  match kind {
    TaskKind::SendMessage { text } => process_send_message(text, log).await,
    TaskKind::SendEmail(email) => process_send_email(email, log, collaborators.mail.as_ref()).await,
    TaskKind::GenerateReport(report) => {
      process_generate_report(report, task_id, log, collaborators.reports.as_ref()).await
    }
    TaskKind::Unknown(task_type) => {
      warn!(%task_id, "Unknown task type: {}", task_type);
      log.log_message(format!("Unknown task type received: {task_type}")).await?;
      Ok("Unknown task type".to_string())
    }
  }
}

pub async fn process_send_message(text: &str, log: &TaskLog<'_>) -> Result<String, HandlerError> {
  log.log_message("Sending message...").await?;
  let result = format!("Message sent: {text}");
  log.log_message("Message delivered successfully").await?;
  Ok(result)
}

pub async fn process_send_email(
  email: &EmailPayload,
  log: &TaskLog<'_>,
  mail: &dyn MailTransport,
) -> Result<String, HandlerError> {
  log.log_message("Email task triggered").await?;
  log.log_message(format!("Sending email to: {}", email.to)).await?;
  log.log_message(format!("Subject: {}", email.subject)).await?;
  log.log_message(format!("Body: {}", email.body)).await?;

  mail.send(&email.to, &email.subject, &email.body).await?;

  log.log_message("Email sent successfully").await?;
  Ok(format!("Email sent successfully to {}", email.to))
}

pub async fn process_generate_report(
  report: &ReportPayload,
  task_id: Uuid,
  log: &TaskLog<'_>,
  renderer: &dyn ReportRenderer,
) -> Result<String, HandlerError> {
  log.log_message("Generating PDF report...").await?;
  let path = renderer.render(&report.title, &report.content, task_id).await?;
  info!(%task_id, "Report generated at {}", path.display());
  log.log_message(format!("Report saved at {}", path.display())).await?;
  Ok(format!("PDF Report Generated: {}", path.display()))
}
