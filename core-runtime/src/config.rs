//! # Core Configuration Module
//!
//! Session tunables plus the host bridges the session core runs on.
//!
//! ## Overview
//!
//! [`SessionSettings`] holds every timing constant and endpoint of the session
//! lifecycle. [`CoreConfig`] pairs those settings with the bridge
//! implementations and is assembled through [`CoreConfigBuilder`], which fails
//! fast with an actionable [`Error::CapabilityMissing`] when a required bridge
//! was not injected.
//!
//! ## Required Bridges
//!
//! - `HttpClient` - identity provider and backend calls
//! - `KeyValueStore` - durable storage for the provider blob and credential
//! - `Navigator` - leaves the app for redirect sign-in
//!
//! `Clock` defaults to [`SystemClock`]. With the `desktop-shims` feature the
//! other three default to the `bridge-desktop` implementations.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, SessionSettings};
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .settings(SessionSettings::from_env()?)
//!     .http_client(Arc::new(MyHttpClient))
//!     .key_value_store(Arc::new(MyLocalStorage))
//!     .navigator(Arc::new(MyNavigator))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{Clock, HttpClient, KeyValueStore, Navigator, SystemClock};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5001";
pub const DEFAULT_IDENTITY_URL: &str = "http://localhost:54321";
pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:3000/auth/callback";

/// Environment variables read by [`SessionSettings::from_env`].
pub const ENV_API_URL: &str = "SESSION_API_URL";
pub const ENV_IDENTITY_URL: &str = "SESSION_IDENTITY_URL";
pub const ENV_IDENTITY_KEY: &str = "SESSION_IDENTITY_KEY";
pub const ENV_REDIRECT_URL: &str = "SESSION_REDIRECT_URL";

/// Tunables of the session lifecycle.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Backend origin serving `/auth/*`
    pub api_base_url: String,
    /// Identity provider origin
    pub identity_url: String,
    /// Public (anon) key sent as `apikey` to the identity provider
    pub identity_api_key: Option<String>,
    /// Where the provider sends the browser after sign-in
    pub redirect_url: String,
    /// How long a fetched external session is served without I/O
    pub freshness_window: Duration,
    /// Per-attempt timeouts of a session fetch, in attempt order
    pub fetch_timeouts: Vec<Duration>,
    /// Delay before each retry, in retry order
    pub fetch_backoffs: Vec<Duration>,
    pub refresh_timeout: Duration,
    pub sign_out_timeout: Duration,
    /// Period of the proactive background refresh
    pub refresh_interval: Duration,
    /// Overrides the derived provider storage key
    pub storage_key: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            identity_url: DEFAULT_IDENTITY_URL.to_string(),
            identity_api_key: None,
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
            freshness_window: Duration::from_secs(5 * 60),
            fetch_timeouts: vec![Duration::from_secs(5), Duration::from_secs(10)],
            fetch_backoffs: vec![Duration::from_secs(1)],
            refresh_timeout: Duration::from_secs(10),
            sign_out_timeout: Duration::from_secs(3),
            refresh_interval: Duration::from_secs(45 * 60),
            storage_key: None,
        }
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("api_base_url", &self.api_base_url)
            .field("identity_url", &self.identity_url)
            .field(
                "identity_api_key",
                &self.identity_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("redirect_url", &self.redirect_url)
            .field("freshness_window", &self.freshness_window)
            .field("fetch_timeouts", &self.fetch_timeouts)
            .field("fetch_backoffs", &self.fetch_backoffs)
            .field("refresh_timeout", &self.refresh_timeout)
            .field("sign_out_timeout", &self.sign_out_timeout)
            .field("refresh_interval", &self.refresh_interval)
            .field("storage_key", &self.storage_key)
            .finish()
    }
}

impl SessionSettings {
    /// Defaults overridden by the `SESSION_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(ENV_API_URL) {
            settings.api_base_url = url;
        }
        if let Some(url) = non_empty(ENV_IDENTITY_URL) {
            settings.identity_url = url;
        }
        if let Some(url) = non_empty(ENV_REDIRECT_URL) {
            settings.redirect_url = url;
        }
        settings.identity_api_key = non_empty(ENV_IDENTITY_KEY);

        settings.validate()?;
        Ok(settings)
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_identity_url(mut self, url: impl Into<String>) -> Self {
        self.identity_url = url.into();
        self
    }

    pub fn with_identity_api_key(mut self, key: impl Into<String>) -> Self {
        self.identity_api_key = Some(key.into());
        self
    }

    pub fn with_redirect_url(mut self, url: impl Into<String>) -> Self {
        self.redirect_url = url.into();
        self
    }

    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }

    /// Key under which the identity provider keeps its session blob.
    ///
    /// Derived as `sb-<project>-auth-token`, where `<project>` is the first
    /// label of the identity host (`abcd` for `https://abcd.supabase.co`).
    pub fn provider_storage_key(&self) -> String {
        if let Some(key) = &self.storage_key {
            return key.clone();
        }

        let project = Url::parse(&self.identity_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .and_then(|host| host.split('.').next().map(str::to_string))
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| "local".to_string());

        format!("sb-{}-auth-token", project)
    }

    /// Join `path` onto the backend origin.
    pub fn api_endpoint(&self, path: &str) -> String {
        join_url(&self.api_base_url, path)
    }

    /// Join `path` onto the identity provider origin.
    pub fn identity_endpoint(&self, path: &str) -> String {
        join_url(&self.identity_url, path)
    }

    /// Worst-case wall time of one session fetch (all timeouts plus backoffs).
    pub fn max_fetch_duration(&self) -> Duration {
        self.fetch_timeouts.iter().sum::<Duration>() + self.fetch_backoffs.iter().sum::<Duration>()
    }

    /// Checks URLs parse and durations are non-zero.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("API base URL", &self.api_base_url),
            ("Identity URL", &self.identity_url),
            ("Redirect URL", &self.redirect_url),
        ] {
            Url::parse(value)
                .map_err(|e| Error::Config(format!("{} '{}' is invalid: {}", name, value, e)))?;
        }

        if self.fetch_timeouts.is_empty() {
            return Err(Error::Config(
                "At least one session fetch timeout is required".to_string(),
            ));
        }

        if self.fetch_backoffs.len() + 1 < self.fetch_timeouts.len() {
            return Err(Error::Config(format!(
                "{} fetch attempts need {} backoff delays, got {}",
                self.fetch_timeouts.len(),
                self.fetch_timeouts.len() - 1,
                self.fetch_backoffs.len()
            )));
        }

        let durations = [
            ("Freshness window", self.freshness_window),
            ("Refresh timeout", self.refresh_timeout),
            ("Sign-out timeout", self.sign_out_timeout),
            ("Refresh interval", self.refresh_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.fetch_timeouts.iter().any(Duration::is_zero) {
            return Err(Error::Config(
                "Session fetch timeouts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Settings plus the bridges the session core runs on.
///
/// Use [`CoreConfig::builder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    pub settings: SessionSettings,
    pub http_client: Arc<dyn HttpClient>,
    pub key_value_store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub navigator: Arc<dyn Navigator>,
    /// Buffer of the session event bus
    pub event_buffer_size: usize,
}

impl fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreConfig")
            .field("settings", &self.settings)
            .field("http_client", &"HttpClient { ... }")
            .field("key_value_store", &"KeyValueStore { ... }")
            .field("clock", &"Clock { ... }")
            .field("navigator", &"Navigator { ... }")
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn capability_missing(capability: &str, purpose: &str, web_hint: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: format!(
            "{} implementation is required for {}. \
             Desktop: enable the 'desktop-shims' feature to use the bridge-desktop default. \
             Web: inject {}.",
            capability, purpose, web_hint
        ),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::new().map_err(|e| {
        Error::Internal(format!("Failed to initialize default HttpClient: {}", e))
    })?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(capability_missing(
        "HttpClient",
        "identity provider and backend calls",
        "a fetch-based client",
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_key_value_store(
    storage_path: Option<PathBuf>,
) -> Result<Arc<dyn KeyValueStore>> {
    use bridge_desktop::FileKeyValueStore;

    let location = storage_path.as_ref().map_or_else(
        || "the user data directory".to_string(),
        |path| path.display().to_string(),
    );
    let store = match storage_path {
        Some(path) => FileKeyValueStore::open(path),
        None => FileKeyValueStore::open_default("session-core"),
    }
    .map_err(|e| Error::Storage {
        location,
        message: e.to_string(),
    })?;

    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_key_value_store(
    _storage_path: Option<PathBuf>,
) -> Result<Arc<dyn KeyValueStore>> {
    Err(capability_missing(
        "KeyValueStore",
        "session and credential persistence",
        "a localStorage-backed store",
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_navigator() -> Result<Arc<dyn Navigator>> {
    Ok(Arc::new(bridge_desktop::ConsoleNavigator))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_navigator() -> Result<Arc<dyn Navigator>> {
    Err(capability_missing(
        "Navigator",
        "redirect-based sign-in",
        "a window.location-based navigator",
    ))
}

/// Builder for [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    settings: Option<SessionSettings>,
    http_client: Option<Arc<dyn HttpClient>>,
    key_value_store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    navigator: Option<Arc<dyn Navigator>>,
    storage_path: Option<PathBuf>,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    /// Session tunables. Defaults to [`SessionSettings::default`].
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// Defaults to `ReqwestHttpClient` when the `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the durable key-value store.
    ///
    /// Defaults to `FileKeyValueStore` when the `desktop-shims` feature is enabled.
    pub fn key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.key_value_store = Some(store);
        self
    }

    /// File used by the desktop default store. Ignored when a store is injected.
    pub fn storage_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds the final `CoreConfig`.
    ///
    /// # Errors
    ///
    /// - [`Error::CapabilityMissing`] when a required bridge is absent and no
    ///   desktop default is compiled in
    /// - [`Error::Config`] when the settings do not validate
    pub fn build(self) -> Result<CoreConfig> {
        let settings = self.settings.unwrap_or_default();

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let key_value_store = match self.key_value_store {
            Some(store) => store,
            None => provide_default_key_value_store(self.storage_path)?,
        };

        let navigator = match self.navigator {
            Some(navigator) => navigator,
            None => provide_default_navigator()?,
        };

        let config = CoreConfig {
            settings,
            http_client,
            key_value_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            navigator,
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}
