//! Cache agent: install/activate lifecycle and request interception.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use url::Url;

use super::policy::{RoutePolicy, Strategy};
use super::storage::CacheStorage;
use super::traits::{CacheResult, CacheSource, Fetcher, Request, Response};

/// Lifecycle phase of one agent version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  New,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Installation failed; this version will never serve
  Redundant,
}

/// Store names owned by one agent version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNames {
  pub precache: String,
  pub runtime: String,
}

impl StoreNames {
  pub fn new(prefix: &str, version: &str, runtime: &str) -> Self {
    Self {
      precache: format!("{}-precache-{}", prefix, version),
      runtime: runtime.to_string(),
    }
  }
}

/// The app shell fetched at install time.
#[derive(Debug, Clone)]
pub struct PrecacheManifest {
  pub entries: Vec<Url>,
  pub offline_page: Url,
}

impl PrecacheManifest {
  /// Resolve manifest paths against the app origin.
  pub fn resolve(origin: &Url, paths: &[String], offline_page: &str) -> Result<Self> {
    let join = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid manifest path '{}': {}", path, e))
    };

    let mut entries = paths
      .iter()
      .map(|p| join(p))
      .collect::<Result<Vec<_>>>()?;
    let offline_page = join(offline_page)?;
    if !entries.contains(&offline_page) {
      entries.push(offline_page.clone());
    }

    Ok(Self {
      entries,
      offline_page,
    })
  }
}

/// What activation cleaned up.
#[derive(Debug, Clone, Default)]
pub struct ActivationReport {
  pub deleted_stores: Vec<String>,
}

/// One version of the offline cache agent.
pub struct OfflineCacheAgent<S: CacheStorage, F: Fetcher> {
  version: String,
  names: StoreNames,
  manifest: PrecacheManifest,
  routes: RoutePolicy,
  storage: Arc<S>,
  fetcher: Arc<F>,
  phase: Mutex<Phase>,
}

impl<S: CacheStorage, F: Fetcher> OfflineCacheAgent<S, F> {
  pub fn new(
    version: impl Into<String>,
    names: StoreNames,
    manifest: PrecacheManifest,
    routes: RoutePolicy,
    storage: Arc<S>,
    fetcher: Arc<F>,
  ) -> Self {
    Self {
      version: version.into(),
      names,
      manifest,
      routes,
      storage,
      fetcher,
      phase: Mutex::new(Phase::New),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn names(&self) -> &StoreNames {
    &self.names
  }

  pub fn phase(&self) -> Phase {
    *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_phase(&self, phase: Phase) {
    *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
  }

  /// Move `from -> to`, refusing if the agent is elsewhere.
  fn enter_phase(&self, from: Phase, to: Phase) -> Result<()> {
    let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
    if *phase != from {
      return Err(eyre!(
        "Agent {} cannot enter {:?} from {:?}",
        self.version,
        to,
        *phase
      ));
    }
    *phase = to;
    Ok(())
  }

  /// Mark an agent whose stores already exist from an earlier process as active.
  pub fn restore(&self) -> Result<()> {
    if !self.storage.has_store(&self.names.precache)? {
      return Err(eyre!(
        "Precache store {} is missing; version {} must be reinstalled",
        self.names.precache,
        self.version
      ));
    }
    self.storage.open_store(&self.names.runtime)?;
    self.set_phase(Phase::Activated);
    Ok(())
  }

  /// Populate the precache store with the whole manifest, or nothing.
  pub async fn install(&self) -> Result<()> {
    match self.phase() {
      Phase::Installed | Phase::Activating | Phase::Activated => return Ok(()),
      _ => {}
    }
    self.enter_phase(Phase::New, Phase::Installing)?;

    match self.precache().await {
      Ok(()) => {
        self.set_phase(Phase::Installed);
        info!(version = %self.version, "Cache agent installed");
        Ok(())
      }
      Err(e) => {
        self.set_phase(Phase::Redundant);
        warn!(version = %self.version, "Cache agent install failed: {}", e);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<()> {
    let requests: Vec<Request> = self
      .manifest
      .entries
      .iter()
      .map(|url| Request::get(url.clone()))
      .collect();

    if self.storage.has_store(&self.names.precache)? && self.is_precached(&requests)? {
      debug!(store = %self.names.precache, "Precache already populated");
      return Ok(());
    }

    let responses = try_join_all(requests.iter().map(|req| async move {
      let response = self
        .fetcher
        .fetch(req)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", req.url, e))?;
      if !response.is_ok() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          req.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>(response)
    }))
    .await?;

    let entries: Vec<(Request, Response)> = requests.into_iter().zip(responses).collect();
    self.storage.put_all(&self.names.precache, &entries)
  }

  fn is_precached(&self, requests: &[Request]) -> Result<bool> {
    for req in requests {
      if self.storage.match_request(&self.names.precache, req)?.is_none() {
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Purge every store that is not one of this version's, then take control.
  pub async fn activate(&self) -> Result<ActivationReport> {
    if self.phase() == Phase::Activated {
      return Ok(ActivationReport::default());
    }
    self.enter_phase(Phase::Installed, Phase::Activating)?;

    let keep: HashSet<&str> = [self.names.precache.as_str(), self.names.runtime.as_str()]
      .into_iter()
      .collect();

    let mut report = ActivationReport::default();
    let mut cleanup = || -> Result<()> {
      for name in self.storage.store_names()? {
        if !keep.contains(name.as_str()) {
          self.storage.delete_store(&name)?;
          report.deleted_stores.push(name);
        }
      }
      self.storage.open_store(&self.names.runtime)?;
      self.storage.set_active_generation(&self.version)
    };

    if let Err(e) = cleanup() {
      // Still installed; activation can be retried
      self.set_phase(Phase::Installed);
      return Err(e);
    }

    self.set_phase(Phase::Activated);
    info!(
      version = %self.version,
      purged = report.deleted_stores.len(),
      "Cache agent activated"
    );
    Ok(report)
  }

  /// Handle an intercepted request.
  pub async fn handle(&self, request: &Request) -> Result<CacheResult<Response>> {
    let (route, strategy) = self.routes.resolve(request);
    debug!(route, url = %request.url, "Intercepted request");

    match strategy {
      Strategy::Passthrough => Ok(CacheResult::passthrough(
        self.fetcher.fetch(request).await?,
      )),
      Strategy::NetworkFirst => self.network_first(request).await,
    }
  }

  async fn network_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    let network_err = match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          // A failed cache write never fails the request
          if let Err(e) = self.storage.put(&self.names.runtime, request, &response) {
            warn!(url = %request.url, "Failed to cache response: {}", e);
          }
        }
        return Ok(CacheResult::from_network(response));
      }
      Err(e) => e,
    };

    debug!(url = %request.url, "Network failed, trying cache: {}", network_err);

    let stores = [
      (&self.names.runtime, CacheSource::RuntimeCache),
      (&self.names.precache, CacheSource::Precache),
    ];
    for (store, source) in stores {
      match self.storage.match_request(store, request) {
        Ok(Some(cached)) => {
          return Ok(CacheResult::from_cache(
            cached.response,
            source,
            cached.cached_at,
          ));
        }
        Ok(None) => {}
        Err(e) => warn!(store = %store, "Cache lookup failed: {}", e),
      }
    }

    if request.is_navigation() {
      let offline = Request::get(self.manifest.offline_page.clone());
      if let Some(cached) = self.storage.match_request(&self.names.precache, &offline)? {
        return Ok(CacheResult::from_cache(
          cached.response,
          CacheSource::OfflineFallback,
          cached.cached_at,
        ));
      }
    }

    Err(network_err.wrap_err(format!("No cached response for {}", request.url)))
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::db::Database;
  use async_trait::async_trait;
  use reqwest::Method;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};

  /// In-memory network with an on/off switch.
  #[derive(Default)]
  pub(crate) struct FakeNetwork {
    pub routes: Mutex<HashMap<String, Response>>,
    pub offline: AtomicBool,
    pub requests: Mutex<Vec<String>>,
  }

  impl FakeNetwork {
    pub fn serve(&self, url: &str, status: u16, body: &str) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), Response::new(status, body));
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }
  }

  #[async_trait]
  impl Fetcher for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      self.requests.lock().unwrap().push(request.identity());
      if self.offline.load(Ordering::SeqCst) {
        return Err(eyre!("network unreachable"));
      }
      self
        .routes
        .lock()
        .unwrap()
        .get(request.url.as_str())
        .cloned()
        .ok_or_else(|| eyre!("connection refused"))
    }
  }

  pub(crate) const ORIGIN: &str = "https://app.example.com/";

  pub(crate) fn shell_network() -> Arc<FakeNetwork> {
    let net = Arc::new(FakeNetwork::default());
    net.serve("https://app.example.com/", 200, "root");
    net.serve("https://app.example.com/index.html", 200, "index");
    net.serve("https://app.example.com/offline.html", 200, "you are offline");
    net
  }

  pub(crate) fn agent(
    version: &str,
    storage: &Arc<SqliteStorage>,
    net: &Arc<FakeNetwork>,
  ) -> OfflineCacheAgent<SqliteStorage, FakeNetwork> {
    agent_with_manifest(version, storage, net, &["/", "/index.html"])
  }

  pub(crate) fn agent_with_manifest(
    version: &str,
    storage: &Arc<SqliteStorage>,
    net: &Arc<FakeNetwork>,
    paths: &[&str],
  ) -> OfflineCacheAgent<SqliteStorage, FakeNetwork> {
    let origin = Url::parse(ORIGIN).unwrap();
    let paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
    OfflineCacheAgent::new(
      version,
      StoreNames::new("stockroom", version, "stockroom-runtime"),
      PrecacheManifest::resolve(&origin, &paths, "/offline.html").unwrap(),
      RoutePolicy::standard(&Url::parse("https://db.example.co").unwrap()),
      storage.clone(),
      net.clone(),
    )
  }

  pub(crate) fn storage() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new(Database::open_in_memory().unwrap()))
  }

  async fn activated(
    storage: &Arc<SqliteStorage>,
    net: &Arc<FakeNetwork>,
  ) -> OfflineCacheAgent<SqliteStorage, FakeNetwork> {
    let agent = agent("v1", storage, net);
    agent.install().await.unwrap();
    agent.activate().await.unwrap();
    agent
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let storage = storage();
    let net = shell_network();
    let agent = agent("v1", &storage, &net);

    agent.install().await.unwrap();
    assert_eq!(agent.phase(), Phase::Installed);

    let offline = Request::get_str("https://app.example.com/offline.html").unwrap();
    let hit = storage
      .match_request("stockroom-precache-v1", &offline)
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.text(), "you are offline");
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let storage = storage();
    let net = shell_network();
    let agent = agent_with_manifest("v2", &storage, &net, &["/", "/missing.css"]);

    assert!(agent.install().await.is_err());
    assert_eq!(agent.phase(), Phase::Redundant);
    assert!(!storage.has_store("stockroom-precache-v2").unwrap());
    assert!(agent.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_install_rejects_non_200() {
    let storage = storage();
    let net = shell_network();
    net.serve("https://app.example.com/index.html", 404, "nope");
    let agent = agent("v1", &storage, &net);

    assert!(agent.install().await.is_err());
    assert!(storage.store_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_idempotent_per_version() {
    let storage = storage();
    let net = shell_network();
    agent("v1", &storage, &net).install().await.unwrap();
    let fetched = net.requests.lock().unwrap().len();

    // A fresh agent for the same version finds the store populated
    let again = agent("v1", &storage, &net);
    again.install().await.unwrap();
    again.install().await.unwrap();
    assert_eq!(net.requests.lock().unwrap().len(), fetched);
  }

  #[tokio::test]
  async fn test_activate_evicts_old_generations() {
    let storage = storage();
    let net = shell_network();
    storage.open_store("stockroom-precache-v0").unwrap();
    storage.open_store("legacy-images").unwrap();

    let agent = agent("v1", &storage, &net);
    agent.install().await.unwrap();
    let report = agent.activate().await.unwrap();

    assert_eq!(
      report.deleted_stores,
      vec!["legacy-images".to_string(), "stockroom-precache-v0".to_string()]
    );
    assert_eq!(
      storage.store_names().unwrap(),
      vec![
        "stockroom-precache-v1".to_string(),
        "stockroom-runtime".to_string()
      ]
    );
    assert_eq!(storage.active_generation().unwrap().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let storage = storage();
    let net = shell_network();
    let agent = agent("v1", &storage, &net);
    assert!(agent.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_network_first_caches_ok_responses() {
    let storage = storage();
    let net = shell_network();
    let agent = activated(&storage, &net).await;
    net.serve("https://app.example.com/app.js", 200, "js v1");
    let req = Request::get_str("https://app.example.com/app.js").unwrap();

    let live = agent.handle(&req).await.unwrap();
    assert_eq!(live.source, CacheSource::Network);

    // Fresh network data wins over the cache while online
    net.serve("https://app.example.com/app.js", 200, "js v2");
    assert_eq!(agent.handle(&req).await.unwrap().data.text(), "js v2");

    net.set_offline(true);
    let cached = agent.handle(&req).await.unwrap();
    assert_eq!(cached.source, CacheSource::RuntimeCache);
    assert_eq!(cached.data.text(), "js v2");
    assert!(cached.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_non_200_not_cached() {
    let storage = storage();
    let net = shell_network();
    let agent = activated(&storage, &net).await;
    net.serve("https://app.example.com/gone", 500, "err");
    let req = Request::get_str("https://app.example.com/gone").unwrap();

    assert_eq!(agent.handle(&req).await.unwrap().data.status, 500);
    assert!(storage
      .match_request("stockroom-runtime", &req)
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_navigation_falls_back_to_offline_page() {
    let storage = storage();
    let net = shell_network();
    let agent = activated(&storage, &net).await;
    net.set_offline(true);

    let nav = Request::get_str("https://app.example.com/inventory/42")
      .unwrap()
      .with_header("Accept", "text/html");
    let result = agent.handle(&nav).await.unwrap();
    assert_eq!(result.source, CacheSource::OfflineFallback);
    assert_eq!(result.data.text(), "you are offline");
  }

  #[tokio::test]
  async fn test_non_navigation_miss_fails() {
    let storage = storage();
    let net = shell_network();
    let agent = activated(&storage, &net).await;
    net.set_offline(true);

    let req = Request::get_str("https://app.example.com/data.json")
      .unwrap()
      .with_header("Accept", "application/json");
    assert!(agent.handle(&req).await.is_err());
  }

  #[tokio::test]
  async fn test_precached_shell_served_offline() {
    let storage = storage();
    let net = shell_network();
    let agent = activated(&storage, &net).await;
    net.set_offline(true);

    let req = Request::get_str("https://app.example.com/index.html").unwrap();
    let result = agent.handle(&req).await.unwrap();
    assert_eq!(result.source, CacheSource::Precache);
    assert_eq!(result.data.text(), "index");
  }

  #[tokio::test]
  async fn test_passthrough_never_cached() {
    let storage = storage();
    let net = shell_network();
    let agent = activated(&storage, &net).await;

    let api = Request::get_str("https://db.example.co/rest/v1/items").unwrap();
    net.serve(api.url.as_str(), 200, "[]");
    let result = agent.handle(&api).await.unwrap();
    assert_eq!(result.source, CacheSource::Passthrough);
    assert!(storage
      .match_request("stockroom-runtime", &api)
      .unwrap()
      .is_none());

    let post = Request::new(
      Method::POST,
      Url::parse("https://app.example.com/form").unwrap(),
    );
    net.serve(post.url.as_str(), 200, "ok");
    assert_eq!(
      agent.handle(&post).await.unwrap().source,
      CacheSource::Passthrough
    );

    // Offline, passthrough traffic surfaces the network error
    net.set_offline(true);
    assert!(agent.handle(&api).await.is_err());
  }
}
