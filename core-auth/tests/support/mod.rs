//! Shared fixtures for the session lifecycle integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    BridgeError, Clock, HttpClient, HttpMethod, HttpRequest, HttpResponse, KeyValueStore,
    ManualClock, MemoryKeyValueStore, Navigator,
};
use chrono::{Duration as ChronoDuration, Utc};
use core_auth::bootstrap::{build_controller, SessionStack};
use core_runtime::config::{CoreConfig, SessionSettings};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const IDENTITY_URL: &str = "https://proj.supabase.co";
pub const API_URL: &str = "http://api.test";
pub const SESSION_KEY: &str = "sb-proj-auth-token";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub enum Reply {
    Respond {
        status: u16,
        body: String,
        delay: Duration,
    },
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

struct Route {
    method: HttpMethod,
    fragment: String,
    /// Popped in order; the last one repeats
    replies: VecDeque<Reply>,
}

/// HTTP fake routing on method and URL fragment. Newer routes win.
#[derive(Default)]
pub struct ScriptedHttp {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttp {
    pub fn on(&self, method: HttpMethod, fragment: &str, reply: Reply) {
        self.queue(method, fragment, vec![reply]);
    }

    pub fn queue(&self, method: HttpMethod, fragment: &str, replies: Vec<Reply>) {
        lock(&self.routes).push(Route {
            method,
            fragment: fragment.to_string(),
            replies: replies.into(),
        });
    }

    pub fn count(&self, fragment: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|request| request.url.contains(fragment))
            .count()
    }

    pub fn requests_to(&self, fragment: &str) -> Vec<HttpRequest> {
        lock(&self.requests)
            .iter()
            .filter(|request| request.url.contains(fragment))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let reply = {
            let mut routes = lock(&self.routes);
            routes
                .iter_mut()
                .rev()
                .find(|route| {
                    route.method == request.method && request.url.contains(route.fragment.as_str())
                })
                .and_then(|route| {
                    if route.replies.len() > 1 {
                        route.replies.pop_front()
                    } else {
                        route.replies.front().cloned()
                    }
                })
        };
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

/// Unsigned JWT carrying `claims`.
pub fn unsigned_token(claims: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}

pub fn session_body(access: &str, refresh: &str, user_id: &str) -> Value {
    json!({
        "access_token": access,
        "token_type": "bearer",
        "expires_in": 3600,
        "refresh_token": refresh,
        "user": { "id": user_id, "email": format!("{}@example.com", user_id) }
    })
}

pub struct Harness {
    pub http: Arc<ScriptedHttp>,
    pub store: Arc<MemoryKeyValueStore>,
    pub clock: Arc<ManualClock>,
    pub navigator: Arc<RecordingNavigator>,
    pub config: CoreConfig,
    pub stack: SessionStack,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryKeyValueStore::new()))
    }

    /// A fresh stack over an existing store, as after a reload.
    pub fn with_store(store: Arc<MemoryKeyValueStore>) -> Self {
        let http = Arc::new(ScriptedHttp::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let navigator = Arc::new(RecordingNavigator::default());

        let settings = SessionSettings::default()
            .with_identity_url(IDENTITY_URL)
            .with_identity_api_key("anon-key")
            .with_api_base_url(API_URL);
        let config = CoreConfig::builder()
            .settings(settings)
            .http_client(http.clone())
            .key_value_store(store.clone())
            .clock(clock.clone())
            .navigator(navigator.clone())
            .build()
            .expect("test config builds");
        let stack = build_controller(&config).expect("stack builds");

        Self {
            http,
            store,
            clock,
            navigator,
            config,
            stack,
        }
    }

    /// Persist a provider session for `user_id` valid for an hour.
    pub fn seed_session(&self, user_id: &str) {
        let expires_at = (self.clock.now() + ChronoDuration::hours(1)).timestamp();
        self.store
            .set_item(
                SESSION_KEY,
                &json!({
                    "access_token": format!("access-{}", user_id),
                    "refresh_token": format!("refresh-{}", user_id),
                    "expires_at": expires_at,
                    "user": { "id": user_id, "email": format!("{}@example.com", user_id) }
                })
                .to_string(),
            )
            .expect("seed session");
    }

    /// Backend resolves every token to `user_id` and exchanges it.
    pub fn backend_accepts(&self, user_id: i64) {
        self.http.on(
            HttpMethod::Get,
            "/api/auth/user",
            Reply::json(200, json!({ "user": { "id": user_id, "email": "user@example.com" } })),
        );
        self.http.on(
            HttpMethod::Post,
            "/api/auth/exchange-token",
            Reply::json(
                200,
                json!({ "success": true, "token": self.signed_token(user_id), "user_id": user_id }),
            ),
        );
    }

    /// Internal token for `user_id` that expires in an hour.
    pub fn signed_token(&self, user_id: i64) -> String {
        unsigned_token(json!({
            "sub": user_id.to_string(),
            "exp": (self.clock.now() + ChronoDuration::hours(1)).timestamp(),
        }))
    }
}
