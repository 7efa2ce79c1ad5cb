//! Token exchange service.
//!
//! Trades a verified external session for an internally issued signed token
//! and keeps that credential in durable storage. The signed token is opaque
//! here: only its `exp` claim is read, to answer [`TokenExchangeService::is_valid`].

use bridge_traits::{Clock, HttpClient, HttpRequest, HttpResponse, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

use crate::error::{AuthError, Result};
use crate::jwt;
use crate::storage_keys::{ACCOUNT_ID_KEY, CREDENTIAL_KEYS, SIGNED_TOKEN_KEY, USER_ID_KEY};
use crate::types::InternalCredential;

pub const EXCHANGE_PATH: &str = "api/auth/exchange-token";
pub const CREATE_FROM_USER_ID_PATH: &str = "api/auth/create-jwt-from-user-id";

#[derive(Debug, Deserialize)]
struct MintResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default, alias = "userId")]
    user_id: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct TokenExchangeService {
    http: Arc<dyn HttpClient>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    api_base_url: String,
    /// Bumped by every [`clear`](Self::clear). Writes are made under this
    /// lock, so a clear and a late write never interleave.
    generation: Mutex<u64>,
}

impl TokenExchangeService {
    pub fn new(
        http: Arc<dyn HttpClient>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        api_base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            store,
            clock,
            api_base_url: api_base_url.into(),
            generation: Mutex::new(0),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base_url.trim_end_matches('/'), path)
    }

    /// Current clear generation. Pass it to the `*_since` operations to
    /// drop their writes if a clear happens after this read.
    pub fn generation(&self) -> u64 {
        *self.lock_generation()
    }

    /// Exchange an external access token for an internal credential.
    ///
    /// Nothing is persisted unless the backend answered with both a token
    /// and a user id.
    pub async fn exchange(&self, external_token: &str) -> Result<InternalCredential> {
        self.exchange_since(self.generation(), external_token).await
    }

    /// [`exchange`](Self::exchange), failing with [`AuthError::Superseded`]
    /// instead of persisting if the credential was cleared after
    /// `generation` was read.
    #[instrument(skip(self, external_token))]
    pub async fn exchange_since(
        &self,
        generation: u64,
        external_token: &str,
    ) -> Result<InternalCredential> {
        let request = HttpRequest::post(self.endpoint(EXCHANGE_PATH))
            .bearer_token(external_token)
            .header("Content-Type", "application/json");

        let credential = self.mint(generation, request).await?;
        info!(user_id = credential.user_id, "Token exchange completed");
        Ok(credential)
    }

    /// Mint a credential for an internal user id already authenticated in
    /// this session. No external token is re-validated on this path.
    pub async fn create_from_user_id(&self, user_id: i64) -> Result<InternalCredential> {
        self.create_from_user_id_since(self.generation(), user_id).await
    }

    #[instrument(skip(self))]
    pub async fn create_from_user_id_since(
        &self,
        generation: u64,
        user_id: i64,
    ) -> Result<InternalCredential> {
        let request = HttpRequest::post(self.endpoint(CREATE_FROM_USER_ID_PATH))
            .json(&json!({ "userId": user_id }))?;

        let credential = self.mint(generation, request).await?;
        info!(user_id = credential.user_id, "Credential minted from user id");
        Ok(credential)
    }

    async fn mint(&self, generation: u64, request: HttpRequest) -> Result<InternalCredential> {
        let response = self.http.execute(request).await?;
        let credential = Self::parse_credential(&response)?;
        self.persist(generation, &credential)?;
        Ok(credential)
    }

    fn parse_credential(response: &HttpResponse) -> Result<InternalCredential> {
        let status = response.status;

        if !response.is_success() {
            let reason = response
                .error_message()
                .unwrap_or_else(|| format!("HTTP {}", status));
            warn!(status, "Backend refused to mint a credential");
            return Err(AuthError::ExchangeFailed {
                status: Some(status),
                reason,
            });
        }

        let body: MintResponse =
            serde_json::from_slice(&response.body).map_err(|e| AuthError::ExchangeFailed {
                status: Some(status),
                reason: format!("unreadable response: {}", e),
            })?;

        match body {
            MintResponse {
                success: true,
                token: Some(signed_token),
                user_id: Some(user_id),
                ..
            } if !signed_token.is_empty() => Ok(InternalCredential {
                signed_token,
                user_id,
            }),
            MintResponse { error, message, .. } => Err(AuthError::ExchangeFailed {
                status: Some(status),
                reason: error
                    .or(message)
                    .unwrap_or_else(|| "response carries no token or user id".to_string()),
            }),
        }
    }

    /// Writes token then user id. A failed second write rolls the first back
    /// so a token never sits in storage without its user id.
    fn persist(&self, generation: u64, credential: &InternalCredential) -> Result<()> {
        let current = self.lock_generation();
        if *current != generation {
            warn!(
                expected = generation,
                current = *current,
                "Credential cleared during the request, discarding it"
            );
            return Err(AuthError::Superseded);
        }

        self.store.set_item(SIGNED_TOKEN_KEY, &credential.signed_token)?;

        if let Err(e) = self
            .store
            .set_item(USER_ID_KEY, &credential.user_id.to_string())
        {
            let _ = self.store.remove_item(SIGNED_TOKEN_KEY);
            return Err(AuthError::Storage(e.to_string()));
        }

        Ok(())
    }

    pub fn get_stored_token(&self) -> Option<String> {
        self.read(SIGNED_TOKEN_KEY)
    }

    pub fn get_stored_user_id(&self) -> Option<i64> {
        let raw = self.read(USER_ID_KEY)?;
        match raw.trim().parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Stored user id is not numeric, ignoring it");
                None
            }
        }
    }

    pub fn stored_credential(&self) -> Option<InternalCredential> {
        Some(InternalCredential {
            signed_token: self.get_stored_token()?,
            user_id: self.get_stored_user_id()?,
        })
    }

    pub fn stored_account_id(&self) -> Option<String> {
        self.read(ACCOUNT_ID_KEY)
    }

    /// Cache the external-account identifier, or forget it with `None`.
    pub fn remember_account_id(&self, account_id: Option<&str>) -> Result<()> {
        self.remember_account_id_since(self.generation(), account_id)
    }

    /// Like [`remember_account_id`](Self::remember_account_id), skipped with
    /// [`AuthError::Superseded`] once a clear happened after `generation`.
    pub fn remember_account_id_since(
        &self,
        generation: u64,
        account_id: Option<&str>,
    ) -> Result<()> {
        let current = self.lock_generation();
        if *current != generation {
            return Err(AuthError::Superseded);
        }
        match account_id {
            Some(id) => self.store.set_item(ACCOUNT_ID_KEY, id)?,
            None => self.store.remove_item(ACCOUNT_ID_KEY)?,
        }
        Ok(())
    }

    /// Expiry of the stored token, if one is stored and readable.
    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        let token = self.get_stored_token()?;
        jwt::expires_at(&token).ok()
    }

    /// Whether a stored token exists and its `exp` lies in the future.
    /// Malformed tokens are invalid.
    pub fn is_valid(&self) -> bool {
        let Some(token) = self.get_stored_token() else {
            return false;
        };

        match jwt::expires_at(&token) {
            Ok(expires_at) => self.clock.now() < expires_at,
            Err(e) => {
                debug!(error = %e, "Stored token is unreadable");
                false
            }
        }
    }

    /// Attach the stored signed token to `request`.
    pub fn authorize(&self, request: HttpRequest) -> Result<HttpRequest> {
        let token = self.get_stored_token().ok_or(AuthError::NoToken)?;
        Ok(request.bearer_token(token))
    }

    /// Remove every persisted credential key. Keeps going past failures and
    /// reports the first one. Requests still in flight will not write their
    /// result.
    pub fn clear(&self) -> Result<()> {
        let mut generation = self.lock_generation();
        *generation += 1;

        let mut first_error = None;
        for key in CREDENTIAL_KEYS {
            if let Err(e) = self.store.remove_item(key) {
                warn!(key, error = %e, "Failed to remove credential key");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => {
                debug!("Internal credential cleared");
                Ok(())
            }
        }
    }

    fn lock_generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.store.get_item(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(key, error = %e, "Failed to read credential storage");
                None
            }
        }
    }
}
