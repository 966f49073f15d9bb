use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::HandlerError;

#[async_trait]
pub trait MailTransport: Send + Sync {
  async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), HandlerError>;
}

/// SMTP over implicit TLS. A fresh transport (and connection) is built for every
/// message and dropped when the send completes.
pub struct SmtpMailTransport {
  config: SmtpConfig,
}

impl SmtpMailTransport {
  pub fn new(config: SmtpConfig) -> Self {
    Self { config }
  }
}

pub fn parse_recipient(to: &str) -> Result<Mailbox, HandlerError> {
  to.parse::<Mailbox>().map_err(|e| HandlerError::InvalidAddress {
    address: to.to_string(),
    reason: e.to_string(),
  })
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
  async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), HandlerError> {
    let (Some(user), Some(password)) = (&self.config.user, &self.config.password) else {
      return Err(HandlerError::Transport("EMAIL_USER or EMAIL_PASS missing".into()));
    };

    let from: Mailbox = user
      .parse()
      .map_err(|e| HandlerError::Transport(format!("invalid sender '{user}': {e}")))?;
    let email = Message::builder()
      .from(from)
      .to(parse_recipient(to)?)
      .subject(subject)
      .header(ContentType::TEXT_PLAIN)
      .body(body.to_string())
      .map_err(|e| HandlerError::Transport(format!("build email: {e}")))?;

    let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)
      .map_err(|e| HandlerError::Transport(format!("SMTP relay: {e}")))?
      .port(self.config.port)
      .credentials(Credentials::new(user.clone(), password.clone()))
      .build();

    mailer
      .send(email)
      .await
      .map_err(|e| HandlerError::Transport(format!("SMTP send: {e}")))?;

    info!("Email sent to {}", to);
    Ok(())
  }
}
