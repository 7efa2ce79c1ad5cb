//! External session client.
//!
//! Front door to the identity provider: cached, retried session fetches,
//! forced refresh, redirect sign-in, sign-out with local cleanup, and the
//! provider's push notifications.

use bridge_traits::{Clock, KeyValueStore};
use chrono::{TimeZone, Utc};
use core_runtime::config::SessionSettings;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::SessionCache;
use crate::error::Result;
use crate::provider::{IdentityProvider, ProviderEvent};
use crate::retry::RetryPolicy;
use crate::storage_keys::is_auth_key;
use crate::types::{ExternalSession, ProviderKind};

pub struct SessionClient {
    provider: Arc<dyn IdentityProvider>,
    cache: Arc<SessionCache>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    storage_key: String,
    policy: RetryPolicy,
    refresh_timeout: Duration,
    sign_out_timeout: Duration,
    warmed: AtomicBool,
    last_fetch: Mutex<LastFetch>,
}

/// Result of a provider fetch, kept so callers that queued behind it can
/// share it instead of fetching again.
#[derive(Debug, Clone)]
enum FetchOutcome {
    Session(ExternalSession),
    NoSession,
    Failed,
}

#[derive(Debug)]
struct LastFetch {
    /// Number of fetches completed so far
    completed: u64,
    /// Cache generation the outcome was recorded under
    generation: u64,
    outcome: FetchOutcome,
}

impl SessionClient {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        cache: Arc<SessionCache>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        settings: &SessionSettings,
    ) -> Self {
        Self {
            provider,
            cache,
            store,
            clock,
            storage_key: settings.provider_storage_key(),
            policy: RetryPolicy::from_settings(settings),
            refresh_timeout: settings.refresh_timeout,
            sign_out_timeout: settings.sign_out_timeout,
            warmed: AtomicBool::new(false),
            last_fetch: Mutex::new(LastFetch {
                completed: 0,
                generation: 0,
                outcome: FetchOutcome::NoSession,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn provider(&self) -> &Arc<dyn IdentityProvider> {
        &self.provider
    }

    /// Let the provider restore its persisted state. Runs once; failures are
    /// logged and a later call tries again.
    #[instrument(skip(self))]
    pub async fn warm_up(&self) {
        if self.warmed.load(Ordering::SeqCst) {
            return;
        }
        if warm(self.provider.as_ref()).await {
            self.warmed.store(true, Ordering::SeqCst);
        }
    }

    /// Current session, served from the cache while fresh.
    ///
    /// Otherwise asks the provider under the retry policy: only a timed-out
    /// attempt is retried, after a backoff and a forced warm-up. Concurrent
    /// callers share one fetch and its outcome, failures included. With
    /// `use_fallback`, a failed fetch falls back to the raw access token in
    /// the provider's storage blob; that session has no user record and is
    /// not cached.
    #[instrument(skip(self))]
    pub async fn fetch_session(&self, use_fallback: bool) -> Option<ExternalSession> {
        if let Some(session) = self.cache.fresh_session() {
            debug!("Serving session from cache");
            return Some(session);
        }

        let seen = self.lock_last_fetch().completed;
        let _guard = self.cache.fetch_guard().await;
        if let Some(session) = self.cache.fresh_session() {
            debug!("Session fetched by a concurrent caller");
            return Some(session);
        }
        if let Some(outcome) = self.outcome_since(seen) {
            debug!("Sharing the outcome of a concurrent fetch");
            return self.settle(outcome, use_fallback);
        }

        let generation = self.cache.generation();
        let provider = self.provider.clone();
        let result = self
            .policy
            .run("session fetch", move |attempt| {
                let provider = provider.clone();
                async move {
                    if attempt.is_retry() {
                        warm(provider.as_ref()).await;
                    }
                    provider.get_session().await
                }
                .boxed()
            })
            .await;

        let outcome = match result {
            Ok(Some(session)) => {
                if self.cache.set_if_current(session.clone(), generation) {
                    FetchOutcome::Session(session)
                } else {
                    debug!("Signed out during fetch, dropping session");
                    FetchOutcome::NoSession
                }
            }
            Ok(None) => {
                debug!("Identity provider has no session");
                FetchOutcome::NoSession
            }
            Err(e) => {
                warn!(error = %e, "Session fetch failed");
                FetchOutcome::Failed
            }
        };

        {
            let mut last = self.lock_last_fetch();
            last.completed += 1;
            last.generation = generation;
            last.outcome = outcome.clone();
        }
        self.settle(outcome, use_fallback)
    }

    /// Outcome of a fetch completed after `seen` fetches, unless a sign-out
    /// has happened since.
    fn outcome_since(&self, seen: u64) -> Option<FetchOutcome> {
        let last = self.lock_last_fetch();
        if last.completed == seen {
            return None;
        }
        if last.generation != self.cache.generation() {
            return Some(FetchOutcome::NoSession);
        }
        Some(last.outcome.clone())
    }

    fn settle(&self, outcome: FetchOutcome, use_fallback: bool) -> Option<ExternalSession> {
        match outcome {
            FetchOutcome::Session(session) => Some(session),
            FetchOutcome::NoSession => None,
            FetchOutcome::Failed if use_fallback => self.fallback_session(),
            FetchOutcome::Failed => None,
        }
    }

    fn lock_last_fetch(&self) -> MutexGuard<'_, LastFetch> {
        self.last_fetch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fallback_session(&self) -> Option<ExternalSession> {
        let raw = match self.store.get_item(&self.storage_key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Failed to read stored session for fallback");
                return None;
            }
        };

        let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
        let access_token = value.get("access_token")?.as_str()?;
        let mut session = ExternalSession::new(access_token);
        if let Some(expires_at) = value
            .get("expires_at")
            .and_then(|v| v.as_i64())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        {
            session = session.with_expires_at(expires_at);
        }

        if session.is_expired(self.clock.now()) {
            debug!("Stored access token has expired, no fallback");
            return None;
        }

        info!("Using access token recovered from storage");
        Some(session)
    }

    /// Ask the provider for a new session, bypassing and clearing the cache.
    /// Failures are logged and reported as `None`.
    #[instrument(skip(self))]
    pub async fn refresh_session(&self) -> Option<ExternalSession> {
        self.cache.clear();
        let generation = self.cache.generation();
        let provider = self.provider.clone();

        let result = RetryPolicy::single(self.refresh_timeout)
            .run("session refresh", move |_| {
                let provider = provider.clone();
                async move { provider.refresh_session().await }.boxed()
            })
            .await;

        match result {
            Ok(Some(session)) => {
                if self.cache.set_if_current(session.clone(), generation) {
                    debug!(expires_at = ?session.expires_at, "Session refreshed");
                    Some(session)
                } else {
                    debug!("Signed out during refresh, dropping session");
                    None
                }
            }
            Ok(None) => {
                debug!("Nothing to refresh");
                None
            }
            Err(e) => {
                warn!(error = %e, "Session refresh failed");
                None
            }
        }
    }

    /// Start redirect sign-in. The outcome arrives later as a
    /// [`ProviderEvent::SignedIn`].
    #[instrument(skip(self), fields(provider = %provider))]
    pub async fn begin_sign_in(&self, provider: ProviderKind) -> Result<()> {
        self.provider.sign_in_with_redirect(provider).await
    }

    /// Sign out. Local state always goes, whatever the provider does.
    ///
    /// The cache is invalidated before the provider is contacted. The
    /// provider call gets the sign-out timeout; its errors are logged. Every
    /// auth-looking storage key is purged afterwards.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) {
        self.cache.invalidate();

        let provider = self.provider.clone();
        let result = RetryPolicy::single(self.sign_out_timeout)
            .run("provider sign-out", move |_| {
                let provider = provider.clone();
                async move { provider.sign_out().await }.boxed()
            })
            .await;

        match result {
            Ok(()) => debug!("Provider sign-out completed"),
            Err(e) if e.is_timeout() => {
                warn!("Provider sign-out timed out, continuing with local cleanup")
            }
            Err(e) => warn!(error = %e, "Provider sign-out failed, continuing with local cleanup"),
        }

        match self.store.remove_matching(&is_auth_key) {
            Ok(removed) => debug!(count = removed.len(), "Purged auth storage keys"),
            Err(e) => warn!(error = %e, "Failed to purge auth storage keys"),
        }

        // a fetch may have landed while the provider call was pending
        self.cache.invalidate();
        info!("Signed out");
    }

    /// Drainable stream of provider events. Receiving an event also applies
    /// it to the cache.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.provider.subscribe(),
            cache: self.cache.clone(),
        }
    }

    /// Run `callback` for every provider event until the returned handle is
    /// used to unsubscribe. Dropping the handle keeps the listener alive.
    pub fn on_state_change<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(ProviderEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => callback(event),
                        None => break,
                    },
                }
            }
        });

        Unsubscribe { token }
    }
}

/// Returns whether initialization succeeded.
async fn warm(provider: &dyn IdentityProvider) -> bool {
    match provider.initialize().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Identity provider warm-up failed");
            false
        }
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<ProviderEvent>,
    cache: Arc<SessionCache>,
}

impl Subscription {
    /// Next event, or `None` once the provider is gone. Lagged events are
    /// skipped.
    pub async fn recv(&mut self) -> Option<ProviderEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    self.apply(&event);
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Provider event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn apply(&self, event: &ProviderEvent) {
        match event {
            ProviderEvent::SignedIn(session) => self.cache.set(session.clone()),
            ProviderEvent::SignedOut => self.cache.invalidate(),
        }
    }
}

/// Handle returned by [`SessionClient::on_state_change`].
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    token: CancellationToken,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}
