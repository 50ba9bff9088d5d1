//! Registration of agent versions: which one serves, which one waits.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use super::agent::{ActivationReport, OfflineCacheAgent};
use super::storage::CacheStorage;
use super::traits::{CacheResult, Fetcher, Request, Response};

/// Messages accepted from the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMessage {
  /// Activate the waiting version now instead of waiting for views to close
  SkipWaiting,
}

/// Where a newly registered version ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
  Activated(Vec<String>),
  Waiting,
  /// This version is already the active one
  Unchanged,
}

type SharedAgent<S, F> = Arc<OfflineCacheAgent<S, F>>;

pub struct AgentRegistry<S: CacheStorage, F: Fetcher> {
  active: RwLock<Option<SharedAgent<S, F>>>,
  waiting: RwLock<Option<SharedAgent<S, F>>>,
  fetcher: Arc<F>,
  skip_waiting: bool,
}

impl<S: CacheStorage, F: Fetcher> AgentRegistry<S, F> {
  pub fn new(fetcher: Arc<F>, skip_waiting: bool) -> Self {
    Self {
      active: RwLock::new(None),
      waiting: RwLock::new(None),
      fetcher,
      skip_waiting,
    }
  }

  pub fn active(&self) -> Option<SharedAgent<S, F>> {
    self
      .active
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn waiting(&self) -> Option<SharedAgent<S, F>> {
    self
      .waiting
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn active_version(&self) -> Option<String> {
    self.active().map(|agent| agent.version().to_string())
  }

  /// Reinstate a version that a previous process activated.
  pub fn restore(&self, agent: OfflineCacheAgent<S, F>) -> Result<()> {
    agent.restore()?;
    info!(version = agent.version(), "Restored active cache agent");
    *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(agent));
    Ok(())
  }

  /// Install a new version.
  ///
  /// If installation fails the current active version keeps serving.
  pub async fn register(&self, agent: OfflineCacheAgent<S, F>) -> Result<Registration> {
    if self.active_version().as_deref() == Some(agent.version()) {
      return Ok(Registration::Unchanged);
    }

    let agent = Arc::new(agent);
    if let Err(e) = agent.install().await {
      warn!(
        version = agent.version(),
        active = ?self.active_version(),
        "Keeping previous cache agent"
      );
      return Err(e);
    }

    *self.waiting.write().unwrap_or_else(PoisonError::into_inner) = Some(agent);

    if self.skip_waiting {
      let report = self.promote_waiting().await?;
      Ok(Registration::Activated(report.deleted_stores))
    } else {
      Ok(Registration::Waiting)
    }
  }

  pub async fn post_message(&self, message: AgentMessage) -> Result<ActivationReport> {
    match message {
      AgentMessage::SkipWaiting => self.promote_waiting().await,
    }
  }

  async fn promote_waiting(&self) -> Result<ActivationReport> {
    let agent = self
      .waiting()
      .ok_or_else(|| eyre!("No cache agent is waiting to activate"))?;

    let report = agent.activate().await?;

    // Claim: every fetch from here on goes through the new version
    *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(agent);
    *self.waiting.write().unwrap_or_else(PoisonError::into_inner) = None;
    Ok(report)
  }

  /// Route a request through the active agent, or straight to the network.
  pub async fn fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    match self.active() {
      Some(agent) => agent.handle(request).await,
      None => Ok(CacheResult::passthrough(self.fetcher.fetch(request).await?)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::agent::tests::{agent, agent_with_manifest, shell_network, storage};
  use crate::cache::storage::{CacheStorage, SqliteStorage};
  use crate::cache::CacheSource;

  #[tokio::test]
  async fn test_no_active_agent_passes_through() {
    let net = shell_network();
    let registry: AgentRegistry<SqliteStorage, _> = AgentRegistry::new(net.clone(), true);
    let req = Request::get_str("https://app.example.com/").unwrap();

    let result = registry.fetch(&req).await.unwrap();
    assert_eq!(result.source, CacheSource::Passthrough);
  }

  #[tokio::test]
  async fn test_register_activates_immediately_with_skip_waiting() {
    let storage = storage();
    let net = shell_network();
    let registry = AgentRegistry::new(net.clone(), true);

    let outcome = registry.register(agent("v1", &storage, &net)).await.unwrap();
    assert_eq!(outcome, Registration::Activated(vec![]));
    assert_eq!(registry.active_version().as_deref(), Some("v1"));
    assert!(registry.waiting().is_none());

    let again = registry.register(agent("v1", &storage, &net)).await.unwrap();
    assert_eq!(again, Registration::Unchanged);
  }

  #[tokio::test]
  async fn test_waiting_until_skip_waiting_message() {
    let storage = storage();
    let net = shell_network();
    let registry = AgentRegistry::new(net.clone(), false);
    let v1 = agent("v1", &storage, &net);
    v1.install().await.unwrap();
    v1.activate().await.unwrap();
    registry.restore(v1).unwrap();

    let outcome = registry.register(agent("v2", &storage, &net)).await.unwrap();
    assert_eq!(outcome, Registration::Waiting);
    assert_eq!(registry.active_version().as_deref(), Some("v1"));

    let report = registry
      .post_message(AgentMessage::SkipWaiting)
      .await
      .unwrap();
    assert_eq!(report.deleted_stores, vec!["stockroom-precache-v1".to_string()]);
    assert_eq!(registry.active_version().as_deref(), Some("v2"));
    assert!(registry.post_message(AgentMessage::SkipWaiting).await.is_err());
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_generation_serving() {
    let storage = storage();
    let net = shell_network();
    let registry = AgentRegistry::new(net.clone(), true);
    registry.register(agent("v1", &storage, &net)).await.unwrap();

    net.serve("https://app.example.com/app.js", 200, "js");
    let js = Request::get_str("https://app.example.com/app.js").unwrap();
    registry.fetch(&js).await.unwrap();

    let broken = agent_with_manifest("v2", &storage, &net, &["/", "/unreachable.css"]);
    assert!(registry.register(broken).await.is_err());

    assert_eq!(registry.active_version().as_deref(), Some("v1"));
    assert_eq!(
      storage.store_names().unwrap(),
      vec![
        "stockroom-precache-v1".to_string(),
        "stockroom-runtime".to_string()
      ]
    );

    net.set_offline(true);
    let cached = registry.fetch(&js).await.unwrap();
    assert_eq!(cached.source, CacheSource::RuntimeCache);
    assert_eq!(cached.data.text(), "js");
  }

  #[tokio::test]
  async fn test_restore_across_processes() {
    let storage = storage();
    let net = shell_network();
    AgentRegistry::new(net.clone(), true)
      .register(agent("v1", &storage, &net))
      .await
      .unwrap();
    let fetched = net.requests.lock().unwrap().len();

    let registry = AgentRegistry::new(net.clone(), true);
    let version = storage.active_generation().unwrap().unwrap();
    registry.restore(agent(&version, &storage, &net)).unwrap();
    assert_eq!(registry.active_version().as_deref(), Some("v1"));
    assert_eq!(net.requests.lock().unwrap().len(), fetched);

    // Restoring a version whose stores were purged is refused
    assert!(registry.restore(agent("v0", &storage, &net)).is_err());
  }
}
