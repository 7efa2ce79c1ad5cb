//! Session data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AuthError;
use crate::jwt;

/// Identity providers offered for redirect sign-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Discord,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Google, ProviderKind::Discord];

    /// Identifier understood by the identity provider's `authorize` endpoint
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Discord => "discord",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::Google => "Google",
            ProviderKind::Discord => "Discord",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(ProviderKind::Google),
            "discord" => Ok(ProviderKind::Discord),
            other => Err(AuthError::InvalidState(format!(
                "unsupported provider '{}'",
                other
            ))),
        }
    }
}

/// User record reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalUser {
    /// Stable external id
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl ExternalUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            user_metadata: HashMap::new(),
            created_at: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Best display name from provider metadata.
    pub fn display_name(&self) -> Option<&str> {
        ["full_name", "name", "user_name", "preferred_username"]
            .iter()
            .find_map(|key| self.user_metadata.get(*key).and_then(|v| v.as_str()))
    }
}

/// Identity provider session. Superseded, never mutated, on refresh.
#[derive(Clone, PartialEq)]
pub struct ExternalSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Absent for sessions recovered from raw storage
    pub user: Option<ExternalUser>,
}

impl ExternalSession {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            user: None,
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_user(mut self, user: ExternalUser) -> Self {
        self.user = Some(user);
        self
    }

    /// External user id, falling back to the `sub` claim of the access token.
    pub fn user_id(&self) -> Option<String> {
        match &self.user {
            Some(user) => Some(user.id.clone()),
            None => jwt::decode_claims(&self.access_token).ok()?.sub,
        }
    }

    /// Expiry, falling back to the `exp` claim of the access token.
    pub fn effective_expiry(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .or_else(|| jwt::expires_at(&self.access_token).ok())
    }

    /// True once `now + margin` reaches the expiry. Unknown expiry never expires.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin =
            chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        self.effective_expiry()
            .map_or(false, |expiry| now + margin >= expiry)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_within(now, Duration::ZERO)
    }
}

impl fmt::Debug for ExternalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSession")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user.as_ref().map(|u| u.id.as_str()))
            .finish()
    }
}

/// An [`ExternalSession`] plus the instant it was observed.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSession {
    pub session: ExternalSession,
    pub fetched_at: DateTime<Utc>,
}

impl CachedSession {
    /// Fresh iff `now - fetched_at < window`. A clock that went backwards
    /// counts as fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match (now - self.fetched_at).to_std() {
            Ok(elapsed) => elapsed < window,
            Err(_) => true,
        }
    }
}

/// Backend-issued credential. Opaque to this crate apart from its `exp` claim.
#[derive(Clone, PartialEq, Eq)]
pub struct InternalCredential {
    pub signed_token: String,
    pub user_id: i64,
}

impl fmt::Debug for InternalCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalCredential")
            .field("signed_token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// User record resolved by the backend from an external token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendUser {
    pub id: i64,
    #[serde(default)]
    pub email: Option<String>,
    /// Linked external account (e.g. a game account id)
    #[serde(default, alias = "accountId", alias = "riot_id")]
    pub account_id: Option<String>,
}

/// Phase of the auth state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthPhase {
    Idle,
    Loading,
    Authenticated,
    Unauthenticated,
    Exchanging,
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthPhase::Idle => "idle",
            AuthPhase::Loading => "loading",
            AuthPhase::Authenticated => "authenticated",
            AuthPhase::Unauthenticated => "unauthenticated",
            AuthPhase::Exchanging => "exchanging",
        };
        f.write_str(name)
    }
}

/// Application-visible auth state. Only the controller produces new values.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthState {
    pub phase: AuthPhase,
    pub external_user: Option<ExternalUser>,
    pub external_user_id: Option<String>,
    pub internal_user_id: Option<i64>,
    /// Authenticated content must not render while set
    pub is_loading: bool,
}

impl AuthState {
    /// State at application start.
    pub fn initial() -> Self {
        Self {
            phase: AuthPhase::Idle,
            external_user: None,
            external_user_id: None,
            internal_user_id: None,
            is_loading: true,
        }
    }

    pub fn loading() -> Self {
        Self {
            phase: AuthPhase::Loading,
            ..Self::initial()
        }
    }

    /// All identity cleared.
    pub fn unauthenticated() -> Self {
        Self {
            phase: AuthPhase::Unauthenticated,
            is_loading: false,
            ..Self::initial()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == AuthPhase::Authenticated
    }

    /// True whenever no authenticated external user is present.
    pub fn is_profile_incomplete(&self) -> bool {
        self.external_user_id.is_none()
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("Google".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        assert_eq!(" discord ".parse::<ProviderKind>().unwrap(), ProviderKind::Discord);
        assert!("github".parse::<ProviderKind>().is_err());
        assert_eq!(ProviderKind::Discord.to_string(), "discord");
        assert_eq!(ProviderKind::Google.display_name(), "Google");
    }

    #[test]
    fn test_cached_session_freshness_window() {
        let fetched_at = Utc::now();
        let cached = CachedSession {
            session: ExternalSession::new("token"),
            fetched_at,
        };
        let window = Duration::from_secs(300);

        assert!(cached.is_fresh(fetched_at, window));
        assert!(cached.is_fresh(fetched_at + chrono::Duration::seconds(299), window));
        assert!(!cached.is_fresh(fetched_at + chrono::Duration::seconds(300), window));
        assert!(cached.is_fresh(fetched_at - chrono::Duration::seconds(10), window));
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let session =
            ExternalSession::new("opaque").with_expires_at(now + chrono::Duration::seconds(30));

        assert!(!session.is_expired(now));
        assert!(session.expires_within(now, Duration::from_secs(60)));
        assert!(session.is_expired(now + chrono::Duration::seconds(30)));

        // Unknown expiry on an opaque token never expires
        assert!(!ExternalSession::new("opaque").is_expired(now));
    }

    #[test]
    fn test_debug_output_redacts_tokens() {
        let session = ExternalSession::new("secret-access")
            .with_refresh_token("secret-refresh")
            .with_user(ExternalUser::new("ext-1"));
        let rendered = format!("{:?}", session);
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
        assert!(rendered.contains("ext-1"));

        let credential = InternalCredential {
            signed_token: "signed-secret".into(),
            user_id: 9,
        };
        assert!(!format!("{:?}", credential).contains("signed-secret"));
    }

    #[test]
    fn test_auth_state_helpers() {
        let initial = AuthState::initial();
        assert_eq!(initial.phase, AuthPhase::Idle);
        assert!(initial.is_loading);
        assert!(initial.is_profile_incomplete());

        let signed_out = AuthState::unauthenticated();
        assert!(!signed_out.is_loading);
        assert!(!signed_out.is_authenticated());

        let signed_in = AuthState {
            phase: AuthPhase::Authenticated,
            external_user: None,
            external_user_id: Some("ext-1".into()),
            internal_user_id: Some(7),
            is_loading: false,
        };
        assert!(!signed_in.is_profile_incomplete());
    }

    #[test]
    fn test_backend_user_accepts_camel_case_account() {
        let user: BackendUser =
            serde_json::from_str(r#"{"id": 5, "email": "a@b.c", "accountId": "acct-1"}"#).unwrap();
        assert_eq!(user.account_id.as_deref(), Some("acct-1"));
    }

    #[test]
    fn test_display_name_from_metadata() {
        let mut user = ExternalUser::new("ext");
        user.user_metadata
            .insert("full_name".into(), serde_json::json!("Ada Lovelace"));
        assert_eq!(user.display_name(), Some("Ada Lovelace"));
    }
}
