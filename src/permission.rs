//! Permission requests that never open more than one prompt at a time.
//!
//! A request checks, in order: the live platform status, a remembered
//! decision, and finally the prompt itself behind a single-flight gate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::Database;
use crate::gate::SingleFlightGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
  Granted,
  Denied,
  /// Undecided; asking again is allowed
  Prompt,
}

impl PermissionStatus {
  pub fn is_terminal(self) -> bool {
    self != PermissionStatus::Prompt
  }
}

impl std::fmt::Display for PermissionStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      PermissionStatus::Granted => "granted",
      PermissionStatus::Denied => "denied",
      PermissionStatus::Prompt => "prompt",
    };
    write!(f, "{}", s)
  }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PermissionError {
  #[error("permission prompt failed: {0}")]
  Prompt(String),
  #[error("permission store error: {0}")]
  Storage(String),
}

#[async_trait]
pub trait PermissionPlatform: Send + Sync + 'static {
  /// Current status if the platform can report one.
  fn status(&self, name: &str) -> Option<PermissionStatus>;

  /// Ask the user. Only ever called through the broker's gate.
  async fn prompt(&self, name: &str) -> Result<PermissionStatus, PermissionError>;
}

fn meta_key(name: &str) -> String {
  format!("permission.{}", name)
}

pub struct PermissionBroker<P: PermissionPlatform> {
  platform: Arc<P>,
  db: Database,
  gate: SingleFlightGate<String, PermissionStatus, PermissionError>,
}

impl<P: PermissionPlatform> PermissionBroker<P> {
  pub fn new(platform: Arc<P>, db: Database) -> Self {
    Self {
      platform,
      db,
      gate: SingleFlightGate::new().with_retain(|status: &PermissionStatus| status.is_terminal()),
    }
  }

  pub async fn request(&self, name: &str) -> Result<PermissionStatus, PermissionError> {
    if let Some(status) = self.platform.status(name).filter(|s| s.is_terminal()) {
      debug!(permission = name, %status, "Platform reported permission");
      return Ok(status);
    }

    if let Some(status) = self.remembered(name)? {
      debug!(permission = name, %status, "Using remembered permission");
      return Ok(status);
    }

    let platform = Arc::clone(&self.platform);
    let prompt_name = name.to_string();
    let status = self
      .gate
      .run(name.to_string(), move || async move {
        platform.prompt(&prompt_name).await
      })
      .await?;

    if status.is_terminal() {
      self.remember(name, status)?;
      info!(permission = name, %status, "Permission decided");
    }
    Ok(status)
  }

  /// Drop a remembered decision so the next request prompts again.
  pub fn forget(&self, name: &str) -> Result<(), PermissionError> {
    self.gate.forget(&name.to_string());
    self
      .db
      .delete_meta(&meta_key(name))
      .map_err(|e| PermissionError::Storage(e.to_string()))
  }

  pub fn remembered(&self, name: &str) -> Result<Option<PermissionStatus>, PermissionError> {
    let value = self
      .db
      .get_meta(&meta_key(name))
      .map_err(|e| PermissionError::Storage(e.to_string()))?;

    Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
  }

  fn remember(&self, name: &str, status: PermissionStatus) -> Result<(), PermissionError> {
    let value =
      serde_json::to_string(&status).map_err(|e| PermissionError::Storage(e.to_string()))?;
    self
      .db
      .set_meta(&meta_key(name), &value)
      .map_err(|e| PermissionError::Storage(e.to_string()))
  }
}

/// Terminal yes/no prompt. A terminal has no platform status to report.
pub struct TerminalPlatform;

#[async_trait]
impl PermissionPlatform for TerminalPlatform {
  fn status(&self, _name: &str) -> Option<PermissionStatus> {
    None
  }

  async fn prompt(&self, name: &str) -> Result<PermissionStatus, PermissionError> {
    let question = format!("Allow stockroom to use {}? [y/n/later] ", name);
    tokio::task::spawn_blocking(move || {
      let mut stdout = std::io::stdout();
      write!(stdout, "{}", question).map_err(|e| PermissionError::Prompt(e.to_string()))?;
      stdout
        .flush()
        .map_err(|e| PermissionError::Prompt(e.to_string()))?;

      let mut answer = String::new();
      std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|e| PermissionError::Prompt(e.to_string()))?;

      Ok(match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => PermissionStatus::Granted,
        "n" | "no" => PermissionStatus::Denied,
        _ => PermissionStatus::Prompt,
      })
    })
    .await
    .map_err(|e| PermissionError::Prompt(e.to_string()))?
  }
}
