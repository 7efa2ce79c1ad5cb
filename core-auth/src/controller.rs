//! # Auth State Controller
//!
//! Owns the application-visible [`AuthState`] and drives it from startup,
//! provider events, explicit user actions and a periodic refresh.
//!
//! ## State machine
//!
//! ```text
//! Idle ──start──> Loading ──no session / 401──> Unauthenticated
//!                    │                                 │
//!                    └──session──> Exchanging ──> Authenticated
//!                                                      │
//!          SignedIn event re-resolves; sign-out or SignedOut event ──> Unauthenticated
//! ```
//!
//! An exchange failure still ends in `Authenticated`: the external identity
//! is known, the internal credential is retried lazily through
//! [`AuthController::ensure_credential`]. Transient verification failures keep
//! the external identity too; only a genuine auth failure clears it.
//!
//! Every state write carries the epoch it was computed under. Sign-out and
//! provider events bump the epoch, so a resolution that started earlier
//! cannot overwrite what came after it.

use core_runtime::events::{CoreEvent, EventBus, EventStream, SessionEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::BackendUserService;
use crate::client::{SessionClient, Subscription};
use crate::error::{AuthError, Result};
use crate::exchange::TokenExchangeService;
use crate::provider::ProviderEvent;
use crate::types::{AuthPhase, AuthState, ExternalSession, ProviderKind};

pub struct AuthController {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    client: Arc<SessionClient>,
    exchange: Arc<TokenExchangeService>,
    users: Arc<BackendUserService>,
    events: EventBus,
    state: watch::Sender<AuthState>,
    epoch: AtomicU64,
    refresh_interval: Duration,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl AuthController {
    pub fn new(
        client: Arc<SessionClient>,
        exchange: Arc<TokenExchangeService>,
        users: Arc<BackendUserService>,
        events: EventBus,
        refresh_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::initial());
        Self {
            inner: Arc::new(Inner {
                client,
                exchange,
                users,
                events,
                state,
                epoch: AtomicU64::new(0),
                refresh_interval,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Resolve the startup session, then begin listening for provider events
    /// and refreshing in the background. Later calls do nothing.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("Auth controller already started");
            return;
        }

        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.publish(epoch, AuthState::loading());
        self.inner.emit(SessionEvent::Loading);

        self.inner.client.warm_up().await;
        // subscribe before fetching so nothing emitted meanwhile is lost
        let subscription = self.inner.client.subscribe();

        match self.inner.client.fetch_session(true).await {
            Some(session) => self.inner.establish(session, epoch).await,
            None => {
                info!("No session at startup");
                self.inner.publish(epoch, AuthState::unauthenticated());
            }
        }

        let listener = tokio::spawn(Inner::listen(self.inner.clone(), subscription));
        let refresher = tokio::spawn(Inner::refresh_loop(self.inner.clone()));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([listener, refresher]);
    }

    /// Start redirect sign-in with `provider`. The result arrives as a
    /// provider event.
    #[instrument(skip(self), fields(provider = %provider))]
    pub async fn sign_in(&self, provider: ProviderKind) -> Result<()> {
        self.inner.emit(SessionEvent::SigningIn {
            provider: provider.as_str().to_string(),
        });
        self.inner.client.begin_sign_in(provider).await
    }

    /// Tear down both layers. State is `Unauthenticated` and the internal
    /// credential is gone before the provider is contacted.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) {
        self.inner.reset(AuthState::unauthenticated());
        if let Err(e) = self.inner.exchange.clear() {
            warn!(error = %e, "Failed to clear internal credential");
        }
        self.inner.emit(SessionEvent::SignedOut {
            reason: "user request".to_string(),
        });

        self.inner.client.sign_out().await;
    }

    /// Refresh the external session now. Returns whether a new session was
    /// obtained.
    #[instrument(skip(self))]
    pub async fn force_refresh(&self) -> bool {
        self.inner.refresh().await
    }

    /// Make sure a valid internal credential is stored, minting one from the
    /// in-session internal user id if needed.
    #[instrument(skip(self))]
    pub async fn ensure_credential(&self) -> bool {
        if self.inner.exchange.is_valid() {
            return true;
        }

        // read before the state: a sign-out in between then voids the write
        let generation = self.inner.exchange.generation();
        let state = self.state();
        let user_id = match (state.phase, state.internal_user_id) {
            (AuthPhase::Authenticated, Some(user_id)) => user_id,
            _ => {
                debug!(phase = %state.phase, "No authenticated user to mint a credential for");
                return false;
            }
        };

        match self
            .inner
            .exchange
            .create_from_user_id_since(generation, user_id)
            .await
        {
            Ok(credential) => {
                self.inner.emit(SessionEvent::ExchangeCompleted {
                    internal_user_id: credential.user_id,
                });
                true
            }
            Err(e) => {
                warn!(error = %e, "Credential retry failed");
                self.inner.emit(SessionEvent::ExchangeFailed {
                    message: e.to_string(),
                });
                false
            }
        }
    }

    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    /// Receiver observing every state change.
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().is_loading
    }

    pub fn is_profile_incomplete(&self) -> bool {
        self.inner.state.borrow().is_profile_incomplete()
    }

    pub fn events(&self) -> EventStream {
        EventStream::new(self.inner.events.subscribe())
    }

    pub fn client(&self) -> &Arc<SessionClient> {
        &self.inner.client
    }

    pub fn exchange(&self) -> &Arc<TokenExchangeService> {
        &self.inner.exchange
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        debug!("Auth controller stopped");
    }
}

impl Drop for AuthController {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        self.events.emit(CoreEvent::Session(event)).ok();
    }

    /// Write `next` unless the epoch moved past `epoch`.
    fn publish(&self, epoch: u64, next: AuthState) -> bool {
        self.state.send_if_modified(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Start a new epoch and write `next` under it.
    fn reset(&self, next: AuthState) -> u64 {
        let mut epoch = 0;
        self.state.send_modify(|state| {
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *state = next;
        });
        epoch
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Resolve the backend user for `session` and exchange its token.
    async fn establish(&self, session: ExternalSession, epoch: u64) {
        // sign-out bumps the epoch before clearing the credential, so a
        // generation read while the epoch is current predates that clear
        let generation = self.exchange.generation();
        if !self.is_current(epoch) {
            return;
        }

        let external_user = session.user.clone();
        let external_user_id = session.user_id();

        let user = match self.users.resolve_user(&session.access_token).await {
            Ok(user) => user,
            Err(e) if e.is_auth_failure() => {
                warn!(error = %e, "Backend rejected the session");
                if !self.publish(epoch, AuthState::unauthenticated()) {
                    return;
                }
                if let Err(e) = self.exchange.clear() {
                    warn!(error = %e, "Failed to clear internal credential");
                }
                self.emit(SessionEvent::AuthError {
                    message: e.to_string(),
                    recoverable: false,
                });
                return;
            }
            Err(e) => {
                warn!(error = %e, "Could not verify session, keeping external identity");
                let internal_user_id = self.exchange.get_stored_user_id();
                let state = AuthState {
                    phase: AuthPhase::Authenticated,
                    external_user,
                    external_user_id: external_user_id.clone(),
                    internal_user_id,
                    is_loading: false,
                };
                if self.publish(epoch, state) {
                    self.emit(SessionEvent::AuthError {
                        message: e.to_string(),
                        recoverable: true,
                    });
                    self.emit_signed_in(external_user_id, internal_user_id);
                }
                return;
            }
        };

        if let Err(e) = self
            .exchange
            .remember_account_id_since(generation, user.account_id.as_deref())
        {
            warn!(error = %e, "Failed to cache account id");
        }

        let exchanging = AuthState {
            phase: AuthPhase::Exchanging,
            external_user: external_user.clone(),
            external_user_id: external_user_id.clone(),
            internal_user_id: Some(user.id),
            is_loading: true,
        };
        if !self.publish(epoch, exchanging) {
            return;
        }

        let exchanged = self
            .exchange
            .exchange_since(generation, &session.access_token)
            .await;
        let internal_user_id = match exchanged {
            Ok(credential) => {
                if self.is_current(epoch) {
                    self.emit(SessionEvent::ExchangeCompleted {
                        internal_user_id: credential.user_id,
                    });
                }
                credential.user_id
            }
            Err(AuthError::Superseded) => {
                debug!("Signed out during token exchange");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Token exchange failed, staying signed in");
                if self.is_current(epoch) {
                    self.emit(SessionEvent::ExchangeFailed {
                        message: e.to_string(),
                    });
                }
                user.id
            }
        };

        let authenticated = AuthState {
            phase: AuthPhase::Authenticated,
            external_user,
            external_user_id: external_user_id.clone(),
            internal_user_id: Some(internal_user_id),
            is_loading: false,
        };
        if self.publish(epoch, authenticated) {
            info!(internal_user_id, "Authenticated");
            self.emit_signed_in(external_user_id, Some(internal_user_id));
        }
    }

    fn emit_signed_in(&self, external_user_id: Option<String>, internal_user_id: Option<i64>) {
        if let Some(external_user_id) = external_user_id {
            self.emit(SessionEvent::SignedIn {
                external_user_id,
                internal_user_id,
            });
        }
    }

    async fn handle_event(&self, event: ProviderEvent) {
        match event {
            ProviderEvent::SignedIn(session) => {
                debug!("Provider reported sign-in");
                let epoch = self.next_epoch();
                self.establish(session, epoch).await;
            }
            ProviderEvent::SignedOut => {
                let already_out = {
                    let state = self.state.borrow();
                    state.phase == AuthPhase::Unauthenticated && state.external_user_id.is_none()
                };
                if already_out {
                    debug!("Provider sign-out already reflected");
                    return;
                }

                info!("Provider reported sign-out");
                self.reset(AuthState::unauthenticated());
                if let Err(e) = self.exchange.clear() {
                    warn!(error = %e, "Failed to clear internal credential");
                }
                self.emit(SessionEvent::SignedOut {
                    reason: "signed out by identity provider".to_string(),
                });
            }
        }
    }

    async fn refresh(&self) -> bool {
        match self.client.refresh_session().await {
            Some(session) => {
                self.emit(SessionEvent::SessionRefreshed {
                    expires_at: session.effective_expiry().map(|at| at.timestamp()),
                });
                true
            }
            None => {
                self.emit(SessionEvent::RefreshFailed {
                    message: "identity provider returned no session".to_string(),
                });
                false
            }
        }
    }

    async fn listen(inner: Arc<Inner>, mut subscription: Subscription) {
        loop {
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => inner.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("Provider event listener stopped");
    }

    async fn refresh_loop(inner: Arc<Inner>) {
        let period = inner.refresh_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !inner.state.borrow().is_authenticated() {
                continue;
            }

            debug!("Proactive session refresh");
            if !inner.refresh().await {
                warn!("Proactive refresh failed, keeping current state");
            }
        }
        debug!("Refresh loop stopped");
    }
}
