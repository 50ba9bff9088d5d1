//! Replay of queued mutations once the backend is reachable again.

mod backend;
mod coordinator;
mod retry;

pub use backend::HttpBackend;
pub use coordinator::{SyncCoordinator, SyncEvent, SyncReport};
pub use retry::RetryPolicy;
