use crate::cache::{
  AgentMessage, AgentRegistry, CacheStorage, HttpFetcher, OfflineCacheAgent, PrecacheManifest,
  Registration, Request, RoutePolicy, SqliteStorage, StoreNames,
};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivityProbe};
use crate::db::Database;
use crate::permission::{PermissionBroker, TerminalPlatform};
use crate::queue::{NewOperation, OperationId, OperationKind, PendingOperationQueue};
use crate::sync::{HttpBackend, RetryPolicy, SyncCoordinator, SyncEvent, SyncReport};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

type Agent = OfflineCacheAgent<SqliteStorage, HttpFetcher>;

/// Main application state
pub struct App {
  config: Config,
  db: Database,
  queue: Arc<PendingOperationQueue>,
  connectivity: Arc<ConnectivityMonitor>,
  coordinator: SyncCoordinator,
  storage: Arc<SqliteStorage>,
  fetcher: Arc<HttpFetcher>,
  registry: AgentRegistry<SqliteStorage, HttpFetcher>,
}

impl App {
  pub fn new(config: Config, db: Database) -> Result<Self> {
    let queue = Arc::new(PendingOperationQueue::new(
      db.clone(),
      config.sync.max_retries,
    ));
    let recovered = queue.recover()?;
    if recovered > 0 {
      info!(recovered, "Recovered operations interrupted mid-sync");
    }

    let connectivity = Arc::new(ConnectivityMonitor::new(
      config.connectivity.assume_online,
    ));

    let api_key = match Config::get_api_key() {
      Ok(key) => Some(key),
      Err(e) => {
        warn!("{}", e);
        None
      }
    };
    let backend = Arc::new(HttpBackend::new(
      &config.api.url,
      &config.api.schema_path,
      api_key.as_deref(),
    )?);

    let coordinator = SyncCoordinator::new(
      queue.clone(),
      backend,
      connectivity.clone(),
      config.sync.batch_size,
      RetryPolicy::from(&config.sync),
    );

    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let fetcher = Arc::new(HttpFetcher::new(FETCH_TIMEOUT)?);
    let registry = AgentRegistry::new(fetcher.clone(), config.cache.skip_waiting);

    let app = Self {
      config,
      db,
      queue,
      connectivity,
      coordinator,
      storage,
      fetcher,
      registry,
    };
    app.restore_agent();
    Ok(app)
  }

  /// Build the agent for a cache version from configuration.
  fn agent(&self, version: &str) -> Result<Agent> {
    let cache = &self.config.cache;
    let names = StoreNames::new(&cache.prefix, version, &cache.runtime_store);
    let manifest =
      PrecacheManifest::resolve(&self.config.origin, &cache.manifest, &cache.offline_page)?;

    Ok(OfflineCacheAgent::new(
      version,
      names,
      manifest,
      RoutePolicy::standard(&self.config.api.url),
      self.storage.clone(),
      self.fetcher.clone(),
    ))
  }

  /// Reinstate the generation a previous run activated, if its stores survive.
  fn restore_agent(&self) {
    let version = match self.storage.active_generation() {
      Ok(Some(version)) => version,
      Ok(None) => return,
      Err(e) => {
        warn!("Failed to read active cache generation: {}", e);
        return;
      }
    };

    if let Err(e) = self.agent(&version).and_then(|agent| self.registry.restore(agent)) {
      warn!(version = %version, "Failed to restore cache agent: {}", e);
    }
  }

  fn probe(&self) -> Result<ConnectivityProbe> {
    ConnectivityProbe::new(
      self.config.probe_url(),
      self.config.connectivity.interval(),
      self.config.connectivity.timeout(),
    )
  }

  /// Register the configured version; a failed install leaves the previous one serving.
  async fn register_configured(&self) -> Result<Registration> {
    let agent = self.agent(&self.config.cache.version)?;
    self.registry.register(agent).await
  }

  /// Probe, keep the queue draining, and wait for Ctrl-C.
  pub async fn run(&self) -> Result<()> {
    if let Err(e) = self.register_configured().await {
      warn!("Cache install failed: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let probe = self.probe()?;
    probe.check_and_report(&self.connectivity).await;
    let probe_task = probe.spawn(self.connectivity.clone(), shutdown_rx);

    let mut events = self.coordinator.subscribe();
    let printer = tokio::spawn(async move {
      while let Ok(event) = events.recv().await {
        if let SyncEvent::Finished(report) = event {
          print_report(&report);
        }
      }
    });

    let sync = self.coordinator.start();
    println!(
      "Watching {} ({} pending). Press Ctrl-C to stop.",
      self.config.api.url,
      self.queue.size()?
    );

    tokio::signal::ctrl_c()
      .await
      .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

    info!(state = ?self.coordinator.state(), "Shutting down");
    if self.coordinator.is_syncing() {
      println!("Interrupting sync; unfinished operations resume on the next run");
    }
    sync.shutdown().await;
    let _ = shutdown_tx.send(true);
    let _ = probe_task.await;
    printer.abort();
    Ok(())
  }

  pub async fn sync(&self) -> Result<()> {
    let online = self.probe()?.check_and_report(&self.connectivity).await;
    if !online {
      println!("Offline: {} unreachable", self.config.probe_url());
    }
    let report = self.coordinator.sync_now().await?;
    print_report(&report);
    Ok(())
  }

  pub fn enqueue(
    &self,
    kind: OperationKind,
    entity: &str,
    payload: &str,
    id: Option<OperationId>,
  ) -> Result<()> {
    let payload: serde_json::Value =
      serde_json::from_str(payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;

    let mut op = NewOperation::new(kind, entity, payload);
    if let Some(id) = id {
      op = op.with_id(id);
    }
    let op = self.queue.enqueue(op)?;
    println!("Queued #{} {} {}", op.id, op.kind, op.target_entity);
    Ok(())
  }

  pub fn list_queue(&self) -> Result<()> {
    let ops = self.queue.list()?;
    if ops.is_empty() {
      println!("Queue is empty");
      return Ok(());
    }

    println!(
      "{:>6}  {:<7} {:<20} {:<8} {:>7}  {}",
      "ID", "KIND", "ENTITY", "STATUS", "RETRIES", "CREATED"
    );
    for op in &ops {
      println!(
        "{:>6}  {:<7} {:<20} {:<8} {:>7}  {}",
        op.id,
        op.kind,
        op.target_entity,
        op.status,
        op.retry_count,
        op.created_at.format("%Y-%m-%d %H:%M:%S")
      );
      if let Some(error) = &op.last_error {
        println!("{:>6}  last error: {}", "", error);
      }
    }

    println!(
      "\n{} pending, {} failed",
      self.queue.size()?,
      self.queue.failed_count()?
    );
    Ok(())
  }

  pub fn dismiss(&self, id: OperationId) -> Result<()> {
    self.queue.dismiss(id)?;
    println!("Dismissed #{}", id);
    Ok(())
  }

  pub async fn fetch(&self, url: &str, navigation: bool) -> Result<()> {
    let mut request = Request::get_str(url)?;
    if navigation {
      request = request.with_header("accept", "text/html");
    }

    let result = self.registry.fetch(&request).await?;
    match result.cached_at {
      Some(at) => println!(
        "{} {} (cached {})",
        result.data.status,
        result.source,
        at.format("%Y-%m-%d %H:%M:%S")
      ),
      None => println!("{} {}", result.data.status, result.source),
    }
    println!("{}", result.data.text());
    Ok(())
  }

  pub async fn install(&self) -> Result<()> {
    let version = &self.config.cache.version;
    match self.register_configured().await? {
      Registration::Activated(deleted) => print_activation(version, &deleted),
      Registration::Waiting => println!(
        "Installed {}; waiting (run `stockroom activate` to take over)",
        version
      ),
      Registration::Unchanged => println!("{} is already active", version),
    }
    Ok(())
  }

  pub async fn activate(&self) -> Result<()> {
    let version = &self.config.cache.version;
    match self.register_configured().await? {
      Registration::Waiting => {
        let report = self.registry.post_message(AgentMessage::SkipWaiting).await?;
        print_activation(version, &report.deleted_stores);
      }
      Registration::Activated(deleted) => print_activation(version, &deleted),
      Registration::Unchanged => println!("{} is already active", version),
    }
    Ok(())
  }

  pub fn list_caches(&self) -> Result<()> {
    let active = self.registry.active();
    for name in self.storage.store_names()? {
      let marker = match &active {
        Some(agent) if agent.names().precache == name || agent.names().runtime == name => "*",
        _ => " ",
      };
      println!("{} {}", marker, name);
    }
    if let Some(version) = self.registry.active_version() {
      println!("\nActive generation: {}", version);
    }
    Ok(())
  }

  pub async fn permission(&self, name: &str, forget: bool) -> Result<()> {
    let broker = PermissionBroker::new(Arc::new(TerminalPlatform), self.db.clone());
    if forget {
      broker.forget(name)?;
      println!("Forgot {} permission", name);
      return Ok(());
    }

    let status = broker.request(name).await?;
    println!("{}: {}", name, status);
    Ok(())
  }
}

fn print_report(report: &SyncReport) {
  println!(
    "Synced {}, requeued {}, failed {} ({} pending, {} awaiting dismissal){}",
    report.synced,
    report.requeued,
    report.exhausted,
    report.pending,
    report.failed,
    if report.abandoned { ", pass abandoned" } else { "" }
  );
}

fn print_activation(version: &str, deleted: &[String]) {
  println!("Activated {}", version);
  for store in deleted {
    println!("  deleted {}", store);
  }
}
