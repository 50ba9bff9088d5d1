//! Single-flight gate: deduplicates concurrent invocations of an async operation.
//!
//! `run(key, factory)` starts `factory()` only when nothing is in flight for
//! `key`. Callers arriving while it runs await the same shared future and see
//! the same outcome. On settlement the slot is cleared; a success accepted by
//! the retain predicate is remembered and short-circuits later calls.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

type SharedOutcome<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

type RetainFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Slot<T, E> {
  /// Flight number plus the shared pending result
  in_flight: Option<(u64, SharedOutcome<T, E>)>,
  cached: Option<T>,
}

impl<T, E> Default for Slot<T, E> {
  fn default() -> Self {
    Self {
      in_flight: None,
      cached: None,
    }
  }
}

struct GateState<K, T, E> {
  slots: HashMap<K, Slot<T, E>>,
  next_flight: u64,
}

pub struct SingleFlightGate<K, T, E> {
  state: Mutex<GateState<K, T, E>>,
  retain: Option<RetainFn<T>>,
}

impl<K, T, E> SingleFlightGate<K, T, E>
where
  K: Eq + Hash + Clone,
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  /// A gate that never caches outcomes.
  pub fn new() -> Self {
    Self {
      state: Mutex::new(GateState {
        slots: HashMap::new(),
        next_flight: 0,
      }),
      retain: None,
    }
  }

  /// Cache successful outcomes for which `retain` returns true.
  pub fn with_retain<F>(mut self, retain: F) -> Self
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    self.retain = Some(Box::new(retain));
    self
  }

  // The lock is never held across an await, so a poisoned guard still
  // protects consistent data.
  fn lock(&self) -> MutexGuard<'_, GateState<K, T, E>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub async fn run<F, Fut>(&self, key: K, factory: F) -> Result<T, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let (flight, outcome) = {
      let mut guard = self.lock();
      let state = &mut *guard;
      let slot = state.slots.entry(key.clone()).or_default();

      if let Some(cached) = &slot.cached {
        return Ok(cached.clone());
      }

      // A settled flight whose callers all went away is not joined
      let live = slot
        .in_flight
        .as_ref()
        .filter(|(_, outcome)| outcome.peek().is_none());

      if let Some((flight, outcome)) = live {
        (*flight, outcome.clone())
      } else {
        let flight = state.next_flight;
        state.next_flight += 1;
        let outcome = factory().boxed().shared();
        slot.in_flight = Some((flight, outcome.clone()));
        (flight, outcome)
      }
    };

    let result = outcome.await;

    let mut state = self.lock();
    if let Some(slot) = state.slots.get_mut(&key) {
      // Only the first caller to observe this flight settles it
      if matches!(&slot.in_flight, Some((f, _)) if *f == flight) {
        slot.in_flight = None;
        if let (Ok(value), Some(retain)) = (&result, &self.retain) {
          if retain(value) {
            slot.cached = Some(value.clone());
          }
        }
      }
    }

    result
  }

  /// Whether an operation is currently in flight for `key`.
  pub fn is_in_flight(&self, key: &K) -> bool {
    self
      .lock()
      .slots
      .get(key)
      .and_then(|slot| slot.in_flight.as_ref())
      .is_some_and(|(_, outcome)| outcome.peek().is_none())
  }

  /// The cached terminal outcome for `key`, if any.
  #[cfg(test)]
  pub fn cached(&self, key: &K) -> Option<T> {
    self.lock().slots.get(key).and_then(|slot| slot.cached.clone())
  }

  /// Drop the cached outcome so the next call invokes the factory again.
  pub fn forget(&self, key: &K) {
    if let Some(slot) = self.lock().slots.get_mut(key) {
      slot.cached = None;
    }
  }
}

impl<K, T, E> Default for SingleFlightGate<K, T, E>
where
  K: Eq + Hash + Clone,
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}
