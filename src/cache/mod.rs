//! Offline cache agent for read traffic.
//!
//! This module keeps static and navigational resources available offline:
//! - Installs a versioned precache of the app shell (all-or-nothing)
//! - Activation purges every cache generation but the current two
//! - Intercepted GETs go network-first, falling back to the runtime cache
//! - Offline navigations that miss everything get the offline page
//!
//! Mutations and backend API traffic are never cached; see `policy`.

mod agent;
mod http;
mod policy;
mod registry;
mod storage;
mod traits;

pub use agent::{OfflineCacheAgent, PrecacheManifest, StoreNames};
pub use http::HttpFetcher;
pub use policy::RoutePolicy;
pub use registry::{AgentMessage, AgentRegistry, Registration};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheSource, Request};
