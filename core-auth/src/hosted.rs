//! Hosted identity provider speaking the GoTrue REST dialect.
//!
//! Sessions are persisted as a JSON blob under the provider storage key so
//! they survive reloads and are visible to every component sharing the store.
//! Redirect sign-in uses the PKCE code flow: the verifier waits in storage
//! until the callback URL is handed to [`HostedIdentityProvider::complete_redirect`].

use async_trait::async_trait;
use bridge_traits::{
    Clock, HttpClient, HttpMethod, HttpRequest, HttpResponse, KeyValueStore, Navigator,
};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use core_runtime::config::SessionSettings;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{AuthError, Result};
use crate::pkce::PkceVerifier;
use crate::provider::{IdentityProvider, ProviderEvent};
use crate::storage_keys::CODE_VERIFIER_SUFFIX;
use crate::types::{ExternalSession, ExternalUser, ProviderKind};

/// Sessions this close to expiry are refreshed before being handed out.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const EVENT_CAPACITY: usize = 16;

/// Session blob as returned by the token endpoint and as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionPayload {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Unix seconds
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<ExternalUser>,
}

impl SessionPayload {
    fn into_session(self, now: DateTime<Utc>) -> ExternalSession {
        let expires_at = self
            .expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .or_else(|| {
                self.expires_in
                    .map(|secs| now + ChronoDuration::seconds(secs))
            });

        ExternalSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }

    fn from_session(session: &ExternalSession) -> Self {
        Self {
            access_token: session.access_token.clone(),
            token_type: Some("bearer".to_string()),
            expires_in: None,
            expires_at: session.expires_at.map(|at| at.timestamp()),
            refresh_token: session.refresh_token.clone(),
            user: session.user.clone(),
        }
    }
}

pub struct HostedIdentityProvider {
    http: Arc<dyn HttpClient>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    navigator: Arc<dyn Navigator>,
    identity_url: String,
    api_key: Option<String>,
    redirect_url: String,
    storage_key: String,
    session: RwLock<Option<ExternalSession>>,
    events: broadcast::Sender<ProviderEvent>,
    sign_out_generation: AtomicU64,
}

impl HostedIdentityProvider {
    pub fn new(
        settings: &SessionSettings,
        http: Arc<dyn HttpClient>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            http,
            store,
            clock,
            navigator,
            identity_url: settings.identity_url.clone(),
            api_key: settings.identity_api_key.clone(),
            redirect_url: settings.redirect_url.clone(),
            storage_key: settings.provider_storage_key(),
            session: RwLock::new(None),
            events,
            sign_out_generation: AtomicU64::new(0),
        }
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    fn verifier_key(&self) -> String {
        format!("{}{}", self.storage_key, CODE_VERIFIER_SUFFIX)
    }

    /// In-memory session without any I/O.
    pub fn current_session(&self) -> Option<ExternalSession> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Authorization URL for `provider` carrying the PKCE challenge.
    pub fn authorize_url(&self, provider: ProviderKind, verifier: &PkceVerifier) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint("auth/v1/authorize"))
            .map_err(|e| AuthError::InvalidState(format!("invalid identity URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("provider", provider.as_str())
            .append_pair("redirect_to", &self.redirect_url)
            .append_pair("code_challenge", &verifier.challenge())
            .append_pair("code_challenge_method", "s256");

        Ok(url)
    }

    /// Finish a redirect sign-in from the callback URL the browser landed on.
    ///
    /// Trades the authorization code plus the stored verifier for a session,
    /// persists it and broadcasts [`ProviderEvent::SignedIn`].
    #[instrument(skip(self, callback_url))]
    pub async fn complete_redirect(&self, callback_url: &str) -> Result<ExternalSession> {
        let url = Url::parse(callback_url)
            .map_err(|e| AuthError::InvalidState(format!("invalid callback URL: {}", e)))?;
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

        if let Some(error) = params.get("error") {
            self.discard_verifier();
            let description = params.get("error_description").unwrap_or(error);
            warn!(error = %error, "Identity provider rejected sign-in");
            return Err(AuthError::Provider(description.clone()));
        }

        let code = params.get("code").ok_or_else(|| {
            AuthError::InvalidState("callback carries no authorization code".to_string())
        })?;

        let verifier = self
            .store
            .get_item(&self.verifier_key())?
            .ok_or_else(|| AuthError::InvalidState("no sign-in in progress".to_string()))?;

        let request = self
            .request(HttpMethod::Post, "auth/v1/token?grant_type=pkce")
            .json(&json!({ "auth_code": code, "code_verifier": verifier }))?;
        let response = self.http.execute(request).await;
        self.discard_verifier();
        let response = response?;

        if !response.is_success() {
            let message = response
                .error_message()
                .unwrap_or_else(|| format!("HTTP {}", response.status));
            warn!(status = response.status, "Authorization code exchange rejected");
            return Err(AuthError::Provider(message));
        }

        let session = self.parse_session(&response)?;
        self.store_session(&session);
        let _ = self.events.send(ProviderEvent::SignedIn(session.clone()));

        info!(user_id = ?session.user.as_ref().map(|u| &u.id), "Redirect sign-in completed");
        Ok(session)
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.identity_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: HttpMethod, path: &str) -> HttpRequest {
        let request =
            HttpRequest::new(method, self.endpoint(path)).header("Accept", "application/json");
        match &self.api_key {
            Some(key) => request.header("apikey", key.as_str()),
            None => request,
        }
    }

    fn parse_session(&self, response: &HttpResponse) -> Result<ExternalSession> {
        let payload: SessionPayload = serde_json::from_slice(&response.body)?;
        Ok(payload.into_session(self.clock.now()))
    }

    fn load_persisted(&self) -> Option<ExternalSession> {
        let raw = match self.store.get_item(&self.storage_key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                return None;
            }
        };

        match serde_json::from_str::<SessionPayload>(&raw) {
            Ok(payload) => Some(payload.into_session(self.clock.now())),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable persisted session");
                let _ = self.store.remove_item(&self.storage_key);
                None
            }
        }
    }

    fn store_session(&self, session: &ExternalSession) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());

        match serde_json::to_string(&SessionPayload::from_session(session)) {
            Ok(json) => {
                if let Err(e) = self.store.set_item(&self.storage_key, &json) {
                    warn!(error = %e, "Failed to persist session");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode session"),
        }
    }

    fn forget_session(&self) -> Option<ExternalSession> {
        let previous = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Err(e) = self.store.remove_item(&self.storage_key) {
            warn!(error = %e, "Failed to remove persisted session");
        }
        previous
    }

    fn discard_verifier(&self) {
        if let Err(e) = self.store.remove_item(&self.verifier_key()) {
            warn!(error = %e, "Failed to remove PKCE verifier");
        }
    }

    async fn fetch_user(&self, access_token: &str) -> Result<ExternalUser> {
        let request = self
            .request(HttpMethod::Get, "auth/v1/user")
            .bearer_token(access_token);
        let response = self.http.execute(request).await?;

        match response.status {
            200..=299 => Ok(serde_json::from_slice(&response.body)?),
            401 | 403 => Err(AuthError::Unauthorized {
                status: response.status,
            }),
            status => Err(AuthError::Backend {
                status,
                message: response.error_message().unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl IdentityProvider for HostedIdentityProvider {
    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<()> {
        let restored = self.load_persisted();
        debug!(restored = restored.is_some(), "Identity provider initialized");
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = restored;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_session(&self) -> Result<Option<ExternalSession>> {
        let session = match self.current_session() {
            Some(session) => session,
            None => match self.load_persisted() {
                Some(session) => {
                    *self.session.write().unwrap_or_else(PoisonError::into_inner) =
                        Some(session.clone());
                    session
                }
                None => return Ok(None),
            },
        };

        if session.expires_within(self.clock.now(), EXPIRY_MARGIN) {
            if session.refresh_token.is_some() {
                debug!("Session expiring, refreshing before use");
                return self.refresh_session().await;
            }
            debug!("Session expired without a refresh token");
            self.forget_session();
            return Ok(None);
        }

        if session.user.is_some() {
            return Ok(Some(session));
        }

        match self.fetch_user(&session.access_token).await {
            Ok(user) => {
                let session = session.with_user(user);
                self.store_session(&session);
                Ok(Some(session))
            }
            Err(e) if e.is_auth_failure() => {
                warn!("Identity provider no longer accepts the stored session");
                self.forget_session();
                let _ = self.events.send(ProviderEvent::SignedOut);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn refresh_session(&self) -> Result<Option<ExternalSession>> {
        let generation = self.sign_out_generation.load(Ordering::SeqCst);

        let refresh_token = match self
            .current_session()
            .or_else(|| self.load_persisted())
            .and_then(|session| session.refresh_token)
        {
            Some(token) => token,
            None => {
                debug!("No refresh token, nothing to refresh");
                return Ok(None);
            }
        };

        let request = self
            .request(HttpMethod::Post, "auth/v1/token?grant_type=refresh_token")
            .json(&json!({ "refresh_token": refresh_token }))?;
        let response = self.http.execute(request).await?;

        match response.status {
            200..=299 => {}
            400 | 401 | 403 => {
                warn!(status = response.status, "Refresh token rejected");
                if self.sign_out_generation.load(Ordering::SeqCst) == generation {
                    self.forget_session();
                    let _ = self.events.send(ProviderEvent::SignedOut);
                }
                return Err(AuthError::Unauthorized {
                    status: response.status,
                });
            }
            status => {
                return Err(AuthError::Backend {
                    status,
                    message: response.error_message().unwrap_or_default(),
                })
            }
        }

        let session = self.parse_session(&response)?;

        if self.sign_out_generation.load(Ordering::SeqCst) != generation {
            debug!("Signed out while refreshing, discarding refreshed session");
            return Ok(None);
        }

        self.store_session(&session);
        debug!(expires_at = ?session.expires_at, "Session refreshed");
        Ok(Some(session))
    }

    #[instrument(skip(self), fields(provider = %provider))]
    async fn sign_in_with_redirect(&self, provider: ProviderKind) -> Result<()> {
        let verifier = PkceVerifier::new();
        self.store.set_item(&self.verifier_key(), verifier.secret())?;

        let url = self.authorize_url(provider, &verifier)?;
        info!("Redirecting to identity provider");
        self.navigator.navigate(url.as_str())?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn sign_out(&self) -> Result<()> {
        self.sign_out_generation.fetch_add(1, Ordering::SeqCst);
        let previous = self.forget_session();
        self.discard_verifier();
        let _ = self.events.send(ProviderEvent::SignedOut);

        let Some(session) = previous else {
            return Ok(());
        };

        let request = self
            .request(HttpMethod::Post, "auth/v1/logout")
            .bearer_token(session.access_token);
        let response = self.http.execute(request).await?;

        // 401/404: the server already forgot the session
        if response.is_success() || matches!(response.status, 401 | 404) {
            info!("Signed out of identity provider");
            Ok(())
        } else {
            Err(AuthError::Provider(
                response
                    .error_message()
                    .unwrap_or_else(|| format!("logout returned HTTP {}", response.status)),
            ))
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}
