//! Integration tests for the session lifecycle
//!
//! These tests drive the composed stack (hosted identity provider, session
//! client, exchange service and controller) over a scripted HTTP bridge:
//! - Startup with and without a stored session
//! - Exchange failure and lazy credential retry
//! - Sign-out racing a refresh
//! - Retry bound and cache freshness of session fetches
//! - The proactive refresh loop

mod support;

use bridge_traits::{HttpMethod, KeyValueStore, MemoryKeyValueStore};
use chrono::Duration as ChronoDuration;
use core_auth::exchange::TokenExchangeService;
use core_auth::storage_keys::is_auth_key;
use core_auth::{AuthPhase, ProviderKind};
use core_runtime::events::{CoreEvent, EventStream, SessionEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{session_body, Harness, Reply, SESSION_KEY};
use tokio::time::Instant;

fn drain(stream: &mut EventStream) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(Ok(CoreEvent::Session(event))) = stream.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_startup_without_session_is_unauthenticated() {
    let h = Harness::new();
    let controller = &h.stack.controller;

    controller.start().await;

    let state = controller.state();
    assert_eq!(state.phase, AuthPhase::Unauthenticated);
    assert!(!state.is_loading);
    assert!(controller.is_profile_incomplete());
    assert!(controller.client().fetch_session(false).await.is_none());
    assert!(controller.exchange().get_stored_token().is_none());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_startup_with_session_exchanges_token() {
    let h = Harness::new();
    h.seed_session("ext-1");
    h.backend_accepts(7);
    let controller = &h.stack.controller;
    let mut events = controller.events();

    controller.start().await;

    let state = controller.state();
    assert_eq!(state.phase, AuthPhase::Authenticated);
    assert_eq!(state.external_user_id.as_deref(), Some("ext-1"));
    assert_eq!(state.internal_user_id, Some(7));
    assert!(!state.is_loading);
    assert_eq!(controller.exchange().get_stored_token(), Some(h.signed_token(7)));
    assert_eq!(controller.exchange().get_stored_user_id(), Some(7));
    assert!(controller.exchange().is_valid());

    let exchange = &h.http.requests_to("/api/auth/exchange-token")[0];
    assert_eq!(exchange.bearer(), Some("access-ext-1"));

    let events = drain(&mut events);
    assert!(events.contains(&SessionEvent::SignedIn {
        external_user_id: "ext-1".to_string(),
        internal_user_id: Some(7),
    }));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_exchange_failure_stays_authenticated_and_retries_lazily() {
    let h = Harness::new();
    h.seed_session("ext-1");
    h.http.on(
        HttpMethod::Get,
        "/api/auth/user",
        Reply::json(200, json!({ "user": { "id": 7 } })),
    );
    h.http.on(
        HttpMethod::Post,
        "/api/auth/exchange-token",
        Reply::json(500, json!({ "error": "exchange backend down" })),
    );
    h.http.on(
        HttpMethod::Post,
        "/api/auth/create-jwt-from-user-id",
        Reply::json(200, json!({ "success": true, "token": h.signed_token(7), "user_id": 7 })),
    );
    let controller = &h.stack.controller;
    let mut events = controller.events();

    controller.start().await;

    let state = controller.state();
    assert_eq!(state.phase, AuthPhase::Authenticated);
    assert_eq!(state.internal_user_id, Some(7));
    assert!(controller.exchange().get_stored_token().is_none());
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::ExchangeFailed { .. })));

    assert!(controller.ensure_credential().await);
    assert_eq!(controller.exchange().get_stored_token(), Some(h.signed_token(7)));

    let minted = &h.http.requests_to("/api/auth/create-jwt-from-user-id")[0];
    let body: serde_json::Value = serde_json::from_slice(minted.body.as_ref().unwrap()).unwrap();
    assert_eq!(body["userId"], 7);

    // a valid token short-circuits
    assert!(controller.ensure_credential().await);
    assert_eq!(h.http.count("/api/auth/create-jwt-from-user-id"), 1);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_during_refresh_leaves_nothing_behind() {
    let h = Harness::new();
    h.seed_session("ext-1");
    h.backend_accepts(7);
    h.store.set_item("theme", "dark").unwrap();
    h.http.on(
        HttpMethod::Post,
        "grant_type=refresh_token",
        Reply::json(200, session_body("access-2", "refresh-2", "ext-1"))
            .after(Duration::from_secs(5)),
    );
    h.http.on(HttpMethod::Post, "/auth/v1/logout", Reply::json(204, json!({})));
    let controller = &h.stack.controller;

    controller.start().await;
    assert!(controller.state().is_authenticated());
    assert!(h.store.has_item("jwt_token").unwrap());

    let (refreshed, ()) = tokio::join!(controller.force_refresh(), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        controller.sign_out().await;
    });

    assert!(!refreshed);
    assert_eq!(controller.state().phase, AuthPhase::Unauthenticated);
    assert!(controller.client().cache().get().is_none());
    let keys = h.store.keys().unwrap();
    assert!(keys.iter().all(|key| !is_auth_key(key)), "left behind: {keys:?}");
    assert_eq!(keys, vec!["theme"]);
    assert_eq!(h.http.count("/auth/v1/logout"), 1);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_during_startup_exchange_leaves_nothing_behind() {
    let h = Harness::new();
    h.seed_session("ext-1");
    h.store.set_item("theme", "dark").unwrap();
    h.http.on(
        HttpMethod::Get,
        "/api/auth/user",
        Reply::json(200, json!({ "user": { "id": 7, "riot_id": "ace#NA1" } })),
    );
    h.http.on(
        HttpMethod::Post,
        "/api/auth/exchange-token",
        Reply::json(
            200,
            json!({ "success": true, "token": h.signed_token(7), "user_id": 7 }),
        )
        .after(Duration::from_secs(5)),
    );
    h.http.on(HttpMethod::Post, "/auth/v1/logout", Reply::json(204, json!({})));
    let controller = &h.stack.controller;
    let mut events = controller.events();

    tokio::join!(controller.start(), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        controller.sign_out().await;
    });
    // let the listener drain the provider's sign-out event
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.http.count("/api/auth/exchange-token"), 1);
    assert_eq!(controller.state().phase, AuthPhase::Unauthenticated);
    assert!(controller.exchange().stored_credential().is_none());
    assert!(!controller.exchange().is_valid());
    let keys = h.store.keys().unwrap();
    assert!(keys.iter().all(|key| !is_auth_key(key)), "left behind: {keys:?}");
    assert!(!drain(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::SignedIn { .. } | SessionEvent::ExchangeCompleted { .. }
    )));

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_during_sign_in_event_leaves_nothing_behind() {
    let h = Harness::new();
    h.store.set_item("theme", "dark").unwrap();
    h.http.on(
        HttpMethod::Post,
        "grant_type=pkce",
        Reply::json(200, session_body("access-g", "refresh-g", "google-user")),
    );
    h.http.on(
        HttpMethod::Get,
        "/api/auth/user",
        Reply::json(200, json!({ "user": { "id": 9, "riot_id": "ace#NA1" } })),
    );
    h.http.on(
        HttpMethod::Post,
        "/api/auth/exchange-token",
        Reply::json(
            200,
            json!({ "success": true, "token": h.signed_token(9), "user_id": 9 }),
        )
        .after(Duration::from_secs(5)),
    );
    h.http.on(HttpMethod::Post, "/auth/v1/logout", Reply::json(204, json!({})));
    let controller = &h.stack.controller;

    controller.start().await;
    controller.sign_in(ProviderKind::Google).await.unwrap();
    h.stack
        .identity
        .complete_redirect("http://localhost:3000/auth/callback?code=one-time-code")
        .await
        .unwrap();

    // the listener is now waiting on the exchange
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.http.count("/api/auth/exchange-token"), 1);
    assert_eq!(controller.state().phase, AuthPhase::Exchanging);

    controller.sign_out().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(controller.state(), core_auth::AuthState::unauthenticated());
    assert!(controller.exchange().stored_credential().is_none());
    assert!(controller.exchange().stored_account_id().is_none());
    assert!(controller.client().cache().get().is_none());
    let keys = h.store.keys().unwrap();
    assert!(keys.iter().all(|key| !is_auth_key(key)), "left behind: {keys:?}");
    assert_eq!(keys, vec!["theme"]);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_fetch_retry_bound_and_fallback() {
    let h = Harness::new();
    let expires_at = (chrono::Utc::now() + ChronoDuration::hours(1)).timestamp();
    // no user record, so the provider has to call out for one
    h.store
        .set_item(
            SESSION_KEY,
            &json!({ "access_token": "raw-access", "expires_at": expires_at }).to_string(),
        )
        .unwrap();
    h.http.on(
        HttpMethod::Get,
        "/auth/v1/user",
        Reply::json(200, json!({ "id": "ext-1" })).after(Duration::from_secs(60)),
    );
    let client = h.stack.controller.client();

    let started = Instant::now();
    assert!(client.fetch_session(false).await.is_none());
    assert_eq!(started.elapsed(), Duration::from_secs(16));
    assert_eq!(h.http.count("/auth/v1/user"), 2);

    let fallback = client.fetch_session(true).await.unwrap();
    assert_eq!(fallback.access_token, "raw-access");
    assert!(fallback.user.is_none());
    assert!(client.cache().get().is_none());
}

#[tokio::test]
async fn test_cache_serves_within_freshness_window() {
    let h = Harness::new();
    h.seed_session("ext-1");
    let client = h.stack.controller.client();

    client.fetch_session(false).await.unwrap();
    let first = client.cache().get().unwrap().fetched_at;

    h.clock.advance(ChronoDuration::minutes(4));
    client.fetch_session(false).await.unwrap();
    assert_eq!(client.cache().get().unwrap().fetched_at, first);

    h.clock.advance(ChronoDuration::minutes(1));
    client.fetch_session(false).await.unwrap();
    assert_eq!(
        client.cache().get().unwrap().fetched_at,
        first + ChronoDuration::minutes(5)
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refreshes_leave_one_whole_session() {
    let h = Harness::new();
    h.seed_session("ext-1");
    h.http.queue(
        HttpMethod::Post,
        "grant_type=refresh_token",
        vec![
            Reply::json(200, session_body("access-a", "refresh-a", "ext-1"))
                .after(Duration::from_secs(2)),
            Reply::json(200, session_body("access-b", "refresh-b", "ext-1"))
                .after(Duration::from_secs(1)),
        ],
    );
    let client = h.stack.controller.client();
    client.warm_up().await;

    let (a, b) = tokio::join!(client.refresh_session(), client.refresh_session());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.access_token, b.access_token);

    let cached = client.cache().get().unwrap().session;
    assert!(cached == a || cached == b);
    let expected_refresh = cached.access_token.replace("access", "refresh");
    assert_eq!(cached.refresh_token.as_deref(), Some(expected_refresh.as_str()));
}

#[tokio::test]
async fn test_exchanged_credential_survives_reload() {
    let store = Arc::new(MemoryKeyValueStore::new());
    let h = Harness::with_store(store.clone());
    h.seed_session("ext-1");
    h.backend_accepts(7);

    h.stack.controller.start().await;
    let token = h.stack.controller.exchange().get_stored_token().unwrap();
    h.stack.controller.shutdown().await;
    drop(h);

    // a new process reading the same durable store
    let reloaded = TokenExchangeService::new(
        Arc::new(support::ScriptedHttp::default()),
        store,
        Arc::new(bridge_traits::SystemClock),
        support::API_URL,
    );
    assert_eq!(reloaded.get_stored_token(), Some(token));
    assert_eq!(reloaded.get_stored_user_id(), Some(7));
}

#[tokio::test(start_paused = true)]
async fn test_background_refresh_runs_every_45_minutes_while_authenticated() {
    let h = Harness::new();
    h.seed_session("ext-1");
    h.backend_accepts(7);
    h.http.on(
        HttpMethod::Post,
        "grant_type=refresh_token",
        Reply::json(200, session_body("access-2", "refresh-2", "ext-1")),
    );
    h.http.on(HttpMethod::Post, "/auth/v1/logout", Reply::json(204, json!({})));
    let controller = &h.stack.controller;
    let mut events = controller.events();

    controller.start().await;
    tokio::time::sleep(Duration::from_secs(44 * 60)).await;
    assert_eq!(h.http.count("grant_type=refresh_token"), 0);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.http.count("grant_type=refresh_token"), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::SessionRefreshed { expires_at: Some(_) })));

    controller.sign_out().await;
    tokio::time::sleep(Duration::from_secs(90 * 60)).await;
    assert_eq!(h.http.count("grant_type=refresh_token"), 1);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_background_refresh_failure_keeps_authenticated() {
    let h = Harness::new();
    h.seed_session("ext-1");
    h.backend_accepts(7);
    h.http.on(
        HttpMethod::Post,
        "grant_type=refresh_token",
        Reply::json(503, json!({ "msg": "upstream unavailable" })),
    );
    let controller = &h.stack.controller;
    let mut events = controller.events();

    controller.start().await;
    tokio::time::sleep(Duration::from_secs(45 * 60 + 1)).await;

    assert_eq!(h.http.count("grant_type=refresh_token"), 1);
    assert!(controller.state().is_authenticated());
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::RefreshFailed { .. })));

    controller.shutdown().await;
}
