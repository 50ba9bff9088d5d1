//! Durable FIFO log of mutations that could not be applied immediately.
//!
//! Operations move `pending -> syncing -> (removed | pending | failed)`.
//! Nothing leaves the log except through `mark_succeeded` or an explicit
//! `dismiss` of a terminally failed operation.

mod types;

pub use types::{NewOperation, OperationId, OperationKind, OperationStatus, PendingOperation};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::db::Database;

const NEXT_ID_KEY: &str = "queue.next_id";

const SELECT_COLUMNS: &str =
  "id, seq, kind, target_entity, payload, created_at, retry_count, status, last_error";

pub struct PendingOperationQueue {
  db: Database,
  /// Failures allowed before an operation becomes terminal
  max_retries: u32,
}

impl PendingOperationQueue {
  pub fn new(db: Database, max_retries: u32) -> Self {
    Self { db, max_retries }
  }

  /// Append an operation, assigning the next id when none is supplied.
  pub fn enqueue(&self, op: NewOperation) -> Result<PendingOperation> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let next_id: OperationId = tx
      .query_row(
        "SELECT value FROM meta WHERE key = ?",
        params![NEXT_ID_KEY],
        |row| row.get::<_, String>(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read id counter: {}", e))?
      .and_then(|v| v.parse().ok())
      .unwrap_or(1);

    let id = op.id.unwrap_or(next_id);
    let after_id = id
      .checked_add(1)
      .ok_or_else(|| eyre!("Operation id {} is out of range", id))?;

    let exists: bool = tx
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM pending_operations WHERE id = ?)",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to check operation id: {}", e))?;
    if exists {
      return Err(eyre!("Operation {} is already queued", id));
    }

    let created_at = Utc::now();
    let payload = serde_json::to_string(&op.payload)
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    tx.execute(
      "INSERT INTO pending_operations (id, kind, target_entity, payload, created_at, retry_count, status)
       VALUES (?, ?, ?, ?, ?, 0, 'pending')",
      params![
        id,
        op.kind.as_str(),
        op.target_entity,
        payload,
        created_at.to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to enqueue operation: {}", e))?;
    let seq = tx.last_insert_rowid();

    // Keep assigned ids monotonic even past explicitly supplied ones
    tx.execute(
      "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
      params![NEXT_ID_KEY, next_id.max(after_id).to_string()],
    )
    .map_err(|e| eyre!("Failed to advance id counter: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(op_id = id, kind = %op.kind, entity = %op.target_entity, "Queued operation");

    Ok(PendingOperation {
      id,
      seq,
      kind: op.kind,
      target_entity: op.target_entity,
      payload: op.payload,
      created_at,
      retry_count: 0,
      status: OperationStatus::Pending,
      last_error: None,
    })
  }

  /// Claim up to `n` pending operations in FIFO order, marking them `syncing`.
  pub fn dequeue_batch(&self, n: usize) -> Result<Vec<PendingOperation>> {
    self.dequeue_batch_after(None, n)
  }

  /// Like `dequeue_batch`, but only operations positioned after `after_seq`.
  ///
  /// A sync pass uses this as a cursor so that an operation requeued during
  /// the pass is not picked up again by the same pass.
  pub fn dequeue_batch_after(
    &self,
    after_seq: Option<i64>,
    n: usize,
  ) -> Result<Vec<PendingOperation>> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let ops = {
      let mut stmt = tx
        .prepare(&format!(
          "SELECT {} FROM pending_operations
           WHERE status = 'pending' AND seq > ?
           ORDER BY seq LIMIT ?",
          SELECT_COLUMNS
        ))
        .map_err(|e| eyre!("Failed to prepare dequeue: {}", e))?;

      let rows = stmt
        .query_map(params![after_seq.unwrap_or(0), n as i64], read_row)
        .map_err(|e| eyre!("Failed to query pending operations: {}", e))?;

      rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read pending operation: {}", e))?
        .into_iter()
        .map(RawOperation::into_operation)
        .collect::<Result<Vec<_>>>()?
    };

    for op in &ops {
      tx.execute(
        "UPDATE pending_operations SET status = 'syncing' WHERE id = ?",
        params![op.id],
      )
      .map_err(|e| eyre!("Failed to mark operation {} syncing: {}", op.id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(
      ops
        .into_iter()
        .map(|op| PendingOperation {
          status: OperationStatus::Syncing,
          ..op
        })
        .collect(),
    )
  }

  /// Remove an operation after a confirmed replay. Returns false if unknown.
  pub fn mark_succeeded(&self, id: OperationId) -> Result<bool> {
    let removed = self
      .db
      .conn()?
      .execute("DELETE FROM pending_operations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove operation {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Record a failed replay.
  ///
  /// The operation goes back to `pending` with `retry_count + 1`, or to
  /// terminal `failed` once the count exceeds the retry ceiling.
  pub fn mark_failed(&self, id: OperationId, error: &str) -> Result<OperationStatus> {
    let conn = self.db.conn()?;

    let retry_count: u32 = conn
      .query_row(
        "SELECT retry_count FROM pending_operations WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read operation {}: {}", id, e))?
      .ok_or_else(|| eyre!("Operation {} is not queued", id))?;

    let retry_count = retry_count + 1;
    let status = if retry_count > self.max_retries {
      OperationStatus::Failed
    } else {
      OperationStatus::Pending
    };

    conn
      .execute(
        "UPDATE pending_operations SET retry_count = ?, status = ?, last_error = ? WHERE id = ?",
        params![retry_count, status.as_str(), error, id],
      )
      .map_err(|e| eyre!("Failed to update operation {}: {}", id, e))?;

    if status == OperationStatus::Failed {
      warn!(op_id = id, retry_count, "Operation exhausted retries: {}", error);
    } else {
      debug!(op_id = id, retry_count, "Operation requeued: {}", error);
    }

    Ok(status)
  }

  /// Put `syncing` operations back to `pending` without counting a retry.
  pub fn release(&self, ids: &[OperationId]) -> Result<usize> {
    if ids.is_empty() {
      return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let released = self
      .db
      .conn()?
      .execute(
        &format!(
          "UPDATE pending_operations SET status = 'pending'
           WHERE status = 'syncing' AND id IN ({})",
          placeholders
        ),
        params_from_iter(ids.iter()),
      )
      .map_err(|e| eyre!("Failed to release operations: {}", e))?;
    Ok(released)
  }

  /// Return operations orphaned in `syncing` by an interrupted pass.
  pub fn recover(&self) -> Result<usize> {
    let recovered = self
      .db
      .conn()?
      .execute(
        "UPDATE pending_operations SET status = 'pending' WHERE status = 'syncing'",
        [],
      )
      .map_err(|e| eyre!("Failed to recover operations: {}", e))?;
    if recovered > 0 {
      info!(recovered, "Recovered operations from an interrupted sync");
    }
    Ok(recovered)
  }

  /// Number of operations still awaiting replay (`pending` or `syncing`).
  pub fn size(&self) -> Result<usize> {
    self.count("status IN ('pending', 'syncing')")
  }

  pub fn failed_count(&self) -> Result<usize> {
    self.count("status = 'failed'")
  }

  fn count(&self, filter: &str) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row(
        &format!("SELECT COUNT(*) FROM pending_operations WHERE {}", filter),
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count operations: {}", e))?;
    Ok(count as usize)
  }

  /// All queued operations in replay order.
  pub fn list(&self) -> Result<Vec<PendingOperation>> {
    self.select("1 = 1")
  }

  /// Operations in terminal `failed` status.
  pub fn failed(&self) -> Result<Vec<PendingOperation>> {
    self.select("status = 'failed'")
  }

  fn select(&self, filter: &str) -> Result<Vec<PendingOperation>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM pending_operations WHERE {} ORDER BY seq",
        SELECT_COLUMNS, filter
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], read_row)
      .map_err(|e| eyre!("Failed to query operations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read operation: {}", e))?;

    rows.into_iter().map(RawOperation::into_operation).collect()
  }

  /// Explicitly discard a terminally failed operation.
  pub fn dismiss(&self, id: OperationId) -> Result<()> {
    let removed = self
      .db
      .conn()?
      .execute(
        "DELETE FROM pending_operations WHERE id = ? AND status = 'failed'",
        params![id],
      )
      .map_err(|e| eyre!("Failed to dismiss operation {}: {}", id, e))?;
    if removed == 0 {
      return Err(eyre!("Operation {} is not in failed status", id));
    }
    info!(op_id = id, "Dismissed failed operation");
    Ok(())
  }
}

/// Column values as stored, before parsing.
struct RawOperation {
  id: OperationId,
  seq: i64,
  kind: String,
  target_entity: String,
  payload: String,
  created_at: String,
  retry_count: u32,
  status: String,
  last_error: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawOperation> {
  Ok(RawOperation {
    id: row.get(0)?,
    seq: row.get(1)?,
    kind: row.get(2)?,
    target_entity: row.get(3)?,
    payload: row.get(4)?,
    created_at: row.get(5)?,
    retry_count: row.get(6)?,
    status: row.get(7)?,
    last_error: row.get(8)?,
  })
}

impl RawOperation {
  fn into_operation(self) -> Result<PendingOperation> {
    let created_at = DateTime::parse_from_rfc3339(&self.created_at)
      .map_err(|e| eyre!("Failed to parse created_at '{}': {}", self.created_at, e))?
      .with_timezone(&Utc);
    let payload = serde_json::from_str(&self.payload)
      .map_err(|e| eyre!("Failed to deserialize payload of {}: {}", self.id, e))?;

    Ok(PendingOperation {
      id: self.id,
      seq: self.seq,
      kind: self.kind.parse()?,
      target_entity: self.target_entity,
      payload,
      created_at,
      retry_count: self.retry_count,
      status: self.status.parse()?,
      last_error: self.last_error,
    })
  }
}
