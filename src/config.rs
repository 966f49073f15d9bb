use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use uuid::Uuid;

use crate::dispatch::{DEFAULT_QUEUE, RoutingPolicy};
use crate::executor::ExecutorConfig;
use crate::poller::PollerConfig;
use crate::retry::RetryPolicy;
use crate::worker_scheduler::WorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpConfig {
  pub host: String,
  pub port: u16,
  pub user: Option<String>,
  pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  /// Only the processes that talk to the broker need it; see [`Config::broker_url`].
  pub rabbitmq_url: Option<String>,
  pub server_port: u16,
  pub db_max_connections: u32,
  pub poll_interval: Duration,
  pub recovery_grace: Duration,
  pub archive_after: Option<Duration>,
  pub retry: RetryPolicy,
  pub routing: RoutingPolicy,
  pub worker_id: String,
  pub worker_concurrency: usize,
  pub processing_delay: Duration,
  pub execution_timeout: Option<Duration>,
  pub report_dir: PathBuf,
  pub smtp: SmtpConfig,
}

struct Vars<F> {
  lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
  fn required(&self, key: &str) -> Result<String> {
    (self.lookup)(key).ok_or_else(|| anyhow!("{key} must be set"))
  }

  fn optional(&self, key: &str) -> Option<String> {
    (self.lookup)(key).filter(|v| !v.trim().is_empty())
  }

  fn parsed<T>(&self, key: &str) -> Result<Option<T>>
  where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
  {
    self
      .optional(key)
      .map(|raw| raw.trim().parse::<T>().with_context(|| format!("invalid value for {key}: '{raw}'")))
      .transpose()
  }

  fn or<T>(&self, key: &str, default: T) -> Result<T>
  where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
  {
    Ok(self.parsed(key)?.unwrap_or(default))
  }

  fn secs(&self, key: &str) -> Result<Option<Duration>> {
    Ok(self.parsed::<u64>(key)?.map(Duration::from_secs))
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let vars = Vars { lookup };

    let retry_delay = vars.secs("RETRY_DELAY_SECS")?.unwrap_or(crate::retry::DEFAULT_RETRY_DELAY);
    let retry = match vars.optional("RETRY_BACKOFF").as_deref() {
      None | Some("fixed") => RetryPolicy::fixed(retry_delay),
      Some("exponential") => {
        let cap = vars.secs("RETRY_BACKOFF_CAP_SECS")?.unwrap_or(Duration::from_secs(300));
        RetryPolicy::exponential(retry_delay, cap)
      }
      Some(other) => return Err(anyhow!("invalid value for RETRY_BACKOFF: '{other}' (expected fixed or exponential)")),
    };

    let routing = match vars.optional("ROUTING").as_deref() {
      None | Some("single") => RoutingPolicy::Single(vars.optional("DISPATCH_QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.into())),
      Some("priority") => RoutingPolicy::Priority,
      Some(other) => return Err(anyhow!("invalid value for ROUTING: '{other}' (expected single or priority)")),
    };

    let worker_concurrency = vars.or("WORKER_CONCURRENCY", 4usize)?;
    if worker_concurrency == 0 {
      return Err(anyhow!("WORKER_CONCURRENCY must be at least 1"));
    }

    Ok(Self {
      database_url: vars.required("DATABASE_URL")?,
      rabbitmq_url: vars.optional("RABBITMQ_URL"),
      server_port: vars.or("SERVER_PORT", 8080)?,
      db_max_connections: vars.or("DB_MAX_CONNECTIONS", 10)?,
      poll_interval: vars.secs("POLL_INTERVAL_SECS")?.unwrap_or(crate::poller::DEFAULT_POLL_INTERVAL),
      recovery_grace: vars.secs("RECOVERY_GRACE_SECS")?.unwrap_or(crate::poller::DEFAULT_RECOVERY_GRACE),
      archive_after: vars.secs("ARCHIVE_AFTER_SECS")?,
      retry,
      routing,
      worker_id: vars.optional("WORKER_ID").unwrap_or_else(|| format!("worker-{}", Uuid::new_v4())),
      worker_concurrency,
      processing_delay: Duration::from_millis(vars.or("PROCESSING_DELAY_MS", 0u64)?),
      execution_timeout: vars.secs("EXECUTION_TIMEOUT_SECS")?,
      report_dir: PathBuf::from(vars.optional("REPORT_DIR").unwrap_or_else(|| "reports".into())),
      smtp: SmtpConfig {
        host: vars.optional("SMTP_HOST").unwrap_or_else(|| "smtp.gmail.com".into()),
        port: vars.or("SMTP_PORT", 465)?,
        user: vars.optional("EMAIL_USER"),
        password: vars.optional("EMAIL_PASS"),
      },
    })
  }

  pub fn broker_url(&self) -> Result<&str> {
    self.rabbitmq_url.as_deref().ok_or_else(|| anyhow!("RABBITMQ_URL must be set"))
  }

  pub fn poller_config(&self) -> PollerConfig {
    PollerConfig {
      interval: self.poll_interval,
      recovery_grace: self.recovery_grace,
      archive_after: self.archive_after,
      routing: self.routing.clone(),
    }
  }

  pub fn executor_config(&self) -> ExecutorConfig {
    ExecutorConfig {
      retry: self.retry,
      routing: self.routing.clone(),
      processing_delay: self.processing_delay,
      timeout: self.execution_timeout,
    }
  }

  pub fn worker_config(&self) -> WorkerConfig {
    WorkerConfig {
      worker_id: self.worker_id.clone(),
      concurrency: self.worker_concurrency,
      routing: self.routing.clone(),
    }
  }
}
