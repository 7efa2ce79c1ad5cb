//! Deterministic fakes for exercising the session core without a network.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{BridgeError, HttpClient, HttpMethod, HttpRequest, HttpResponse, Navigator};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::{AuthError, Result};
use crate::provider::{IdentityProvider, ProviderEvent};
use crate::types::{ExternalSession, ExternalUser, ProviderKind};

/// Token endpoint style session body.
pub fn session_json(access: &str, refresh: &str, expires_in: i64, user_id: &str) -> Value {
    json!({
        "access_token": access,
        "token_type": "bearer",
        "expires_in": expires_in,
        "refresh_token": refresh,
        "user": { "id": user_id, "email": format!("{}@example.com", user_id) }
    })
}

/// Session for `user_id` that never expires on its own.
pub fn session_for(user_id: &str) -> ExternalSession {
    ExternalSession::new(format!("access-{}", user_id))
        .with_refresh_token(format!("refresh-{}", user_id))
        .with_user(ExternalUser::new(user_id).with_email(format!("{}@example.com", user_id)))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Canned outcome of a scripted HTTP route.
#[derive(Debug, Clone)]
pub enum Reply {
    Respond {
        status: u16,
        body: String,
        delay: Duration,
    },
    Timeout,
    Offline,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Reply::Respond {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    /// Same reply, after `delay`.
    pub fn after(self, delay: Duration) -> Self {
        match self {
            Reply::Respond { status, body, .. } => Reply::Respond {
                status,
                body,
                delay,
            },
            other => other,
        }
    }
}

/// HTTP client answering from routes matched on method and URL fragment.
///
/// The most recently registered matching route wins. Unmatched requests
/// get a 404.
#[derive(Default)]
pub struct ScriptedHttp {
    routes: Mutex<Vec<(HttpMethod, String, Reply)>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, method: HttpMethod, fragment: &str, reply: Reply) {
        lock(&self.routes).push((method, fragment.to_string(), reply));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn last_request(&self) -> Option<HttpRequest> {
        lock(&self.requests).last().cloned()
    }

    /// Number of requests whose URL contains `fragment`.
    pub fn count(&self, fragment: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|request| request.url.contains(fragment))
            .count()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let reply = lock(&self.routes)
            .iter()
            .rev()
            .find(|(method, fragment, _)| {
                *method == request.method && request.url.contains(fragment.as_str())
            })
            .map(|(_, _, reply)| reply.clone());
        lock(&self.requests).push(request);

        match reply {
            Some(Reply::Respond {
                status,
                body,
                delay,
            }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(HttpResponse::new(status, body))
            }
            Some(Reply::Timeout) => Err(BridgeError::Timeout("scripted".to_string())),
            Some(Reply::Offline) => Err(BridgeError::OperationFailed(
                "connection refused".to_string(),
            )),
            None => Ok(HttpResponse::new(404, r#"{"message":"no route"}"#)),
        }
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    visited: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn last(&self) -> Option<String> {
        lock(&self.visited).last().cloned()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, url: &str) -> BridgeResult<()> {
        lock(&self.visited).push(url.to_string());
        Ok(())
    }
}

/// Scripted identity provider with call counters.
///
/// `get_session` pops one delay per call from the delay queue, so a test can
/// make the first call slow and the second fast.
pub struct FakeProvider {
    session: Mutex<Option<ExternalSession>>,
    get_delays: Mutex<VecDeque<Duration>>,
    get_error: Mutex<Option<fn() -> AuthError>>,
    refresh_delay: Mutex<Duration>,
    refreshed: Mutex<Option<ExternalSession>>,
    sign_out_delay: Mutex<Duration>,
    redirects: Mutex<Vec<ProviderKind>>,
    events: broadcast::Sender<ProviderEvent>,
    pub initialize_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub sign_out_calls: AtomicUsize,
}

impl Default for FakeProvider {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            session: Mutex::new(None),
            get_delays: Mutex::new(VecDeque::new()),
            get_error: Mutex::new(None),
            refresh_delay: Mutex::new(Duration::ZERO),
            refreshed: Mutex::new(None),
            sign_out_delay: Mutex::new(Duration::ZERO),
            redirects: Mutex::new(Vec::new()),
            events,
            initialize_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: ExternalSession) -> Self {
        let provider = Self::default();
        provider.set_session(Some(session));
        provider
    }

    pub fn set_session(&self, session: Option<ExternalSession>) {
        *lock(&self.session) = session;
    }

    pub fn push_get_delay(&self, delay: Duration) {
        lock(&self.get_delays).push_back(delay);
    }

    /// Make every `get_session` fail with the error `make` builds.
    pub fn fail_get_with(&self, make: fn() -> AuthError) {
        *lock(&self.get_error) = Some(make);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *lock(&self.refresh_delay) = delay;
    }

    /// Session handed out by the next refreshes.
    pub fn set_refreshed(&self, session: ExternalSession) {
        *lock(&self.refreshed) = Some(session);
    }

    pub fn set_sign_out_delay(&self, delay: Duration) {
        *lock(&self.sign_out_delay) = delay;
    }

    pub fn redirects(&self) -> Vec<ProviderKind> {
        lock(&self.redirects).clone()
    }

    /// Broadcast `event` as if it came from the provider.
    pub fn emit(&self, event: ProviderEvent) {
        if let ProviderEvent::SignedIn(session) = &event {
            self.set_session(Some(session.clone()));
        }
        let _ = self.events.send(event);
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn initialize(&self) -> Result<()> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<ExternalSession>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        // answer with the session as of the call, like a request in flight
        let snapshot = lock(&self.session).clone();
        let delay = lock(&self.get_delays).pop_front().unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(make) = *lock(&self.get_error) {
            return Err(make());
        }
        Ok(snapshot)
    }

    async fn refresh_session(&self) -> Result<Option<ExternalSession>> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.refresh_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let refreshed = lock(&self.refreshed).clone();
        match refreshed {
            Some(session) => {
                self.set_session(Some(session.clone()));
                Ok(Some(session))
            }
            None => Ok(lock(&self.session).clone()),
        }
    }

    async fn sign_in_with_redirect(&self, provider: ProviderKind) -> Result<()> {
        lock(&self.redirects).push(provider);
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.sign_out_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.set_session(None);
        let _ = self.events.send(ProviderEvent::SignedOut);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}
