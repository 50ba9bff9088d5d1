use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type OperationId = i64;

/// What the queued mutation does to its target entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
  Pending,
  Syncing,
  /// Retries exhausted; stays until the user dismisses it
  Failed,
}

macro_rules! str_enum {
  ($ty:ty { $($variant:ident => $name:literal),+ $(,)? }) => {
    impl $ty {
      pub fn as_str(&self) -> &'static str {
        match self {
          $(Self::$variant => $name,)+
        }
      }
    }

    impl fmt::Display for $ty {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
      }
    }

    impl FromStr for $ty {
      type Err = color_eyre::Report;

      fn from_str(s: &str) -> Result<Self> {
        match s {
          $($name => Ok(Self::$variant),)+
          other => Err(eyre!("Unknown {} '{}'", stringify!($ty), other)),
        }
      }
    }
  };
}

str_enum!(OperationKind {
  Create => "create",
  Update => "update",
  Delete => "delete",
});

str_enum!(OperationStatus {
  Pending => "pending",
  Syncing => "syncing",
  Failed => "failed",
});

/// A user mutation waiting to be replayed against the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
  pub id: OperationId,
  /// Replay position; strictly increasing in enqueue order
  pub seq: i64,
  pub kind: OperationKind,
  pub target_entity: String,
  pub payload: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  pub status: OperationStatus,
  pub last_error: Option<String>,
}

/// Input to `PendingOperationQueue::enqueue`.
#[derive(Debug, Clone)]
pub struct NewOperation {
  /// Assigned by the queue when absent
  pub id: Option<OperationId>,
  pub kind: OperationKind,
  pub target_entity: String,
  pub payload: serde_json::Value,
}

impl NewOperation {
  pub fn new(kind: OperationKind, target_entity: impl Into<String>, payload: serde_json::Value) -> Self {
    Self {
      id: None,
      kind,
      target_entity: target_entity.into(),
      payload,
    }
  }

  pub fn with_id(mut self, id: OperationId) -> Self {
    self.id = Some(id);
    self
  }
}
