//! Online/offline state with a subscription channel.
//!
//! `ConnectivityMonitor::set_online` is the only mutator; it is fed by the
//! platform signal source (here, `ConnectivityProbe`). Every real transition is
//! published as-is, with no debouncing; consumers coalesce on their own.

use chrono::{DateTime, Utc};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
  pub is_online: bool,
  pub last_transition_at: DateTime<Utc>,
}

/// A single online/offline transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  Online { at: DateTime<Utc> },
  Offline { at: DateTime<Utc> },
}

impl ConnectivityEvent {
  pub fn is_online(&self) -> bool {
    matches!(self, ConnectivityEvent::Online { .. })
  }
}

pub struct ConnectivityMonitor {
  state: RwLock<ConnectivityState>,
  events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      state: RwLock::new(ConnectivityState {
        is_online: initially_online,
        last_transition_at: Utc::now(),
      }),
      events,
    }
  }

  pub fn is_online(&self) -> bool {
    self.state().is_online
  }

  pub fn state(&self) -> ConnectivityState {
    *self.state.read().unwrap_or_else(PoisonError::into_inner)
  }

  /// Subscribe to transitions. Dropping the receiver unsubscribes.
  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
    self.events.subscribe()
  }

  /// Record a platform signal. Returns true if it was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let event = {
      let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
      if state.is_online == online {
        return false;
      }
      let at = Utc::now();
      state.is_online = online;
      state.last_transition_at = at;
      if online {
        ConnectivityEvent::Online { at }
      } else {
        ConnectivityEvent::Offline { at }
      }
    };

    info!(online, "Connectivity changed");
    // No subscribers is fine
    let _ = self.events.send(event);
    true
  }
}

/// Periodic reachability check standing in for platform online/offline events.
pub struct ConnectivityProbe {
  client: reqwest::Client,
  url: Url,
  interval: Duration,
}

impl ConnectivityProbe {
  pub fn new(url: Url, interval: Duration, timeout: Duration) -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to build probe client: {}", e))?;
    Ok(Self {
      client,
      url,
      interval,
    })
  }

  /// One reachability check. Any HTTP response counts as online.
  pub async fn check(&self) -> bool {
    match self.client.head(self.url.clone()).send().await {
      Ok(response) => {
        debug!(status = %response.status(), "Probe reached {}", self.url);
        true
      }
      Err(e) => {
        debug!("Probe failed: {}", e);
        false
      }
    }
  }

  /// Check once and relay the result to the monitor.
  pub async fn check_and_report(&self, monitor: &ConnectivityMonitor) -> bool {
    let online = self.check().await;
    monitor.set_online(online);
    online
  }

  /// Spawn the probe loop. It stops when `shutdown` flips to true.
  pub fn spawn(
    self,
    monitor: std::sync::Arc<ConnectivityMonitor>,
    mut shutdown: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        tokio::select! {
          _ = ticker.tick() => {
            self.check_and_report(&monitor).await;
          }
          changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
              break;
            }
          }
        }
      }
      debug!("Connectivity probe stopped");
    })
  }
}
