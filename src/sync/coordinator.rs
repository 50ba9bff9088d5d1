//! Drains the pending-operation queue against the backend.
//!
//! Every trigger (connectivity coming back, a retry timer, a manual "sync
//! now") goes through one single-flight gate, so at most one pass drains the
//! queue at a time and late callers share the running pass's outcome. The
//! pass itself runs on its own task and holds the gate for its whole
//! duration.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backend::{Backend, BackendError};
use super::retry::RetryPolicy;
use crate::connectivity::ConnectivityMonitor;
use crate::gate::SingleFlightGate;
use crate::queue::{OperationStatus, PendingOperationQueue};

const SYNC_KEY: &str = "sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Syncing,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub synced: usize,
  /// Failed this pass, back to pending for the next one
  pub requeued: usize,
  /// Ran out of retries during this pass
  pub exhausted: usize,
  /// The pass stopped early (offline or a fatal backend error)
  pub abandoned: bool,
  /// Operations still awaiting replay after the pass
  pub pending: usize,
  /// Operations in terminal failed status, awaiting dismissal
  pub failed: usize,
}

impl SyncReport {
  pub fn is_drained(&self) -> bool {
    self.pending == 0
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  Started { pending: usize },
  Progress { pending: usize },
  Finished(SyncReport),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
  #[error("queue storage error: {0}")]
  Storage(String),
  #[error("sync pass aborted: {0}")]
  Aborted(String),
}

fn storage_err(e: color_eyre::Report) -> SyncError {
  SyncError::Storage(e.to_string())
}

struct Inner {
  queue: Arc<PendingOperationQueue>,
  backend: Arc<dyn Backend>,
  connectivity: Arc<ConnectivityMonitor>,
  batch_size: usize,
  state: watch::Sender<SyncState>,
  events: broadcast::Sender<SyncEvent>,
}

#[derive(Clone)]
pub struct SyncCoordinator {
  inner: Arc<Inner>,
  gate: Arc<SingleFlightGate<&'static str, SyncReport, SyncError>>,
  retry: RetryPolicy,
}

impl SyncCoordinator {
  pub fn new(
    queue: Arc<PendingOperationQueue>,
    backend: Arc<dyn Backend>,
    connectivity: Arc<ConnectivityMonitor>,
    batch_size: usize,
    retry: RetryPolicy,
  ) -> Self {
    let (state, _) = watch::channel(SyncState::Idle);
    let (events, _) = broadcast::channel(256);
    Self {
      inner: Arc::new(Inner {
        queue,
        backend,
        connectivity,
        batch_size: batch_size.max(1),
        state,
        events,
      }),
      gate: Arc::new(SingleFlightGate::new()),
      retry,
    }
  }

  pub fn state(&self) -> SyncState {
    *self.inner.state.borrow()
  }

  pub fn is_syncing(&self) -> bool {
    self.gate.is_in_flight(&SYNC_KEY)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  /// Run a pass, or join the one already running.
  pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
    let inner = Arc::clone(&self.inner);
    self
      .gate
      .run(SYNC_KEY, move || async move {
        // The pass outlives a caller that stops waiting for it
        tokio::spawn(inner.drain())
          .await
          .map_err(|e| SyncError::Aborted(e.to_string()))?
      })
      .await
  }

  /// Subscribe to connectivity and sync on every online transition.
  ///
  /// A pass that leaves work behind while still online schedules another one
  /// after the retry policy's backoff.
  pub fn start(&self) -> SyncHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let mut connectivity = self.inner.connectivity.subscribe();
    let coordinator = self.clone();

    let task = tokio::spawn(async move {
      let mut attempt = 0u32;
      // Work queued by an earlier session
      let mut retry_at = coordinator
        .inner
        .connectivity
        .is_online()
        .then(Instant::now);

      loop {
        tokio::select! {
          event = connectivity.recv() => match event {
            Ok(event) if event.is_online() => {}
            Ok(_) => {
              retry_at = None;
              continue;
            }
            Err(RecvError::Lagged(_)) if coordinator.inner.connectivity.is_online() => {}
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
          },
          _ = wait_until(retry_at) => {}
          _ = shutdown_rx.changed() => break,
        }

        retry_at = None;
        let outcome = tokio::select! {
          outcome = coordinator.sync_now() => outcome,
          _ = shutdown_rx.changed() => break,
        };

        match outcome {
          Ok(report) if report.is_drained() => attempt = 0,
          // The next online transition triggers the pass
          Ok(_) if !coordinator.inner.connectivity.is_online() => {}
          Ok(report) => {
            let delay = coordinator.retry.delay(attempt);
            attempt += 1;
            info!(pending = report.pending, ?delay, "Sync incomplete, retrying later");
            retry_at = Some(Instant::now() + delay);
          }
          Err(e) => {
            let delay = coordinator.retry.delay(attempt);
            attempt += 1;
            warn!(?delay, "Sync failed: {}", e);
            retry_at = Some(Instant::now() + delay);
          }
        }
      }
      debug!("Sync trigger loop stopped");
    });

    SyncHandle { shutdown, task }
  }
}

async fn wait_until(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}

/// Running trigger loop; dropping the subscription happens on shutdown.
pub struct SyncHandle {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

impl SyncHandle {
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    let _ = self.task.await;
  }
}

impl Inner {
  async fn drain(self: Arc<Self>) -> Result<SyncReport, SyncError> {
    // Nothing else can be mid-pass here; anything still syncing was orphaned
    self.queue.recover().map_err(storage_err)?;

    if !self.connectivity.is_online() {
      debug!("Offline, skipping sync");
      return self.finish(SyncReport {
        abandoned: true,
        ..SyncReport::default()
      });
    }

    let pending = self.queue.size().map_err(storage_err)?;
    self.state.send_replace(SyncState::Syncing);
    let _ = self.events.send(SyncEvent::Started { pending });
    info!(pending, "Sync started");

    let result = self.drain_queue().await;
    self.state.send_replace(SyncState::Idle);

    match result {
      Ok(report) => {
        let report = self.finish(report)?;
        let _ = self.events.send(SyncEvent::Finished(report.clone()));
        info!(
          synced = report.synced,
          requeued = report.requeued,
          exhausted = report.exhausted,
          pending = report.pending,
          "Sync finished"
        );
        Ok(report)
      }
      Err(e) => {
        // Put claimed operations back for the next pass
        if let Err(recover_err) = self.queue.recover() {
          warn!("Failed to recover operations: {}", recover_err);
        }
        Err(e)
      }
    }
  }

  fn finish(&self, mut report: SyncReport) -> Result<SyncReport, SyncError> {
    report.pending = self.queue.size().map_err(storage_err)?;
    report.failed = self.queue.failed_count().map_err(storage_err)?;
    Ok(report)
  }

  /// One operation at a time, in enqueue order.
  async fn drain_queue(&self) -> Result<SyncReport, SyncError> {
    let mut report = SyncReport::default();
    let mut cursor = None;

    'pass: loop {
      let batch = match cursor {
        None => self.queue.dequeue_batch(self.batch_size),
        after => self.queue.dequeue_batch_after(after, self.batch_size),
      }
      .map_err(storage_err)?;
      if batch.is_empty() {
        break;
      }

      let mut remaining = batch.into_iter();
      while let Some(op) = remaining.next() {
        cursor = Some(op.seq);

        let outcome = if self.connectivity.is_online() {
          self.backend.apply(&op).await
        } else {
          Err(BackendError::Fatal("connectivity lost".to_string()))
        };

        match outcome {
          Ok(()) => {
            self.queue.mark_succeeded(op.id).map_err(storage_err)?;
            report.synced += 1;
            debug!(op_id = op.id, kind = %op.kind, "Operation synced");
          }
          Err(BackendError::Retryable(message)) => {
            let status = self
              .queue
              .mark_failed(op.id, &message)
              .map_err(storage_err)?;
            if status == OperationStatus::Failed {
              report.exhausted += 1;
            } else {
              report.requeued += 1;
            }
          }
          Err(BackendError::Fatal(message)) => {
            let ids: Vec<_> = std::iter::once(op.id)
              .chain(remaining.map(|op| op.id))
              .collect();
            warn!(
              op_id = op.id,
              released = ids.len(),
              "Sync pass abandoned: {}",
              message
            );
            self.queue.release(&ids).map_err(storage_err)?;
            report.abandoned = true;
            break 'pass;
          }
        }

        let pending = self.queue.size().map_err(storage_err)?;
        let _ = self.events.send(SyncEvent::Progress { pending });
      }
    }

    Ok(report)
  }
}
