//! External session cache.
//!
//! Holds the last observed [`ExternalSession`] with a freshness window. Reads
//! never perform I/O. A fetch guard lets callers collapse concurrent fetches
//! into one, and a generation counter lets sign-out outrank writes that were
//! already in flight.

use bridge_traits::Clock;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::types::{CachedSession, ExternalSession};

#[derive(Default)]
struct CacheState {
    entry: Option<CachedSession>,
    generation: u64,
}

pub struct SessionCache {
    state: RwLock<CacheState>,
    clock: Arc<dyn Clock>,
    window: Duration,
    fetch_lock: Mutex<()>,
}

impl SessionCache {
    pub fn new(clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            clock,
            window,
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn get(&self) -> Option<CachedSession> {
        self.read(|state| state.entry.clone())
    }

    /// The cached session, only while fresh.
    pub fn fresh_session(&self) -> Option<ExternalSession> {
        let now = self.clock.now();
        self.read(|state| {
            state
                .entry
                .as_ref()
                .filter(|cached| cached.is_fresh(now, self.window))
                .map(|cached| cached.session.clone())
        })
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh_session().is_some()
    }

    /// Store `session`, stamped with the current time.
    pub fn set(&self, session: ExternalSession) {
        let fetched_at = self.clock.now();
        self.write(|state| {
            state.entry = Some(CachedSession {
                session,
                fetched_at,
            })
        });
    }

    /// Store `session` only if no invalidation happened since `generation`
    /// was read. Returns whether the write landed.
    pub fn set_if_current(&self, session: ExternalSession, generation: u64) -> bool {
        let fetched_at = self.clock.now();
        self.write(|state| {
            if state.generation != generation {
                debug!(
                    expected = generation,
                    current = state.generation,
                    "Dropping session write from before an invalidation"
                );
                return false;
            }
            state.entry = Some(CachedSession {
                session,
                fetched_at,
            });
            true
        })
    }

    pub fn clear(&self) {
        self.write(|state| state.entry = None);
    }

    /// Clear and reject every write started before this call.
    pub fn invalidate(&self) {
        self.write(|state| {
            state.entry = None;
            state.generation += 1;
        });
    }

    pub fn generation(&self) -> u64 {
        self.read(|state| state.generation)
    }

    /// Serialises fetchers. Re-check [`fresh_session`](Self::fresh_session)
    /// after acquiring: another fetcher may have filled the cache meanwhile.
    pub async fn fetch_guard(&self) -> MutexGuard<'_, ()> {
        self.fetch_lock.lock().await
    }

    fn read<T>(&self, f: impl FnOnce(&CacheState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut CacheState) -> T) -> T {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }
}
