//! Composition root.
//!
//! Builds the session stack as explicit instances from a [`CoreConfig`]:
//! cache, client, exchange and backend services, controller. Nothing here is
//! process-wide; two stacks built from two configs are fully independent.

use core_runtime::config::CoreConfig;
use core_runtime::events::EventBus;
use std::sync::Arc;
use tracing::info;

use crate::backend::BackendUserService;
use crate::cache::SessionCache;
use crate::client::SessionClient;
use crate::controller::AuthController;
use crate::error::Result;
use crate::exchange::TokenExchangeService;
use crate::hosted::HostedIdentityProvider;
use crate::provider::IdentityProvider;

/// A wired controller plus the handles a host needs besides it.
pub struct SessionStack {
    pub controller: AuthController,
    /// Concrete provider, for finishing redirect sign-ins
    pub identity: Arc<HostedIdentityProvider>,
    pub events: EventBus,
}

/// Wire the stack around a [`HostedIdentityProvider`].
pub fn build_controller(config: &CoreConfig) -> Result<SessionStack> {
    config.validate()?;

    let identity = Arc::new(HostedIdentityProvider::new(
        &config.settings,
        config.http_client.clone(),
        config.key_value_store.clone(),
        config.clock.clone(),
        config.navigator.clone(),
    ));
    let events = EventBus::new(config.event_buffer_size);
    let controller = assemble(config, identity.clone(), events.clone());

    info!(
        identity_url = %config.settings.identity_url,
        api_base_url = %config.settings.api_base_url,
        "Session stack ready"
    );

    Ok(SessionStack {
        controller,
        identity,
        events,
    })
}

/// Wire the stack around any [`IdentityProvider`].
pub fn build_controller_with_provider(
    config: &CoreConfig,
    provider: Arc<dyn IdentityProvider>,
) -> Result<AuthController> {
    config.validate()?;
    Ok(assemble(config, provider, EventBus::new(config.event_buffer_size)))
}

fn assemble(
    config: &CoreConfig,
    provider: Arc<dyn IdentityProvider>,
    events: EventBus,
) -> AuthController {
    let settings = &config.settings;

    let cache = Arc::new(SessionCache::new(
        config.clock.clone(),
        settings.freshness_window,
    ));
    let client = Arc::new(SessionClient::new(
        provider,
        cache,
        config.key_value_store.clone(),
        config.clock.clone(),
        settings,
    ));
    let exchange = Arc::new(TokenExchangeService::new(
        config.http_client.clone(),
        config.key_value_store.clone(),
        config.clock.clone(),
        settings.api_base_url.clone(),
    ));
    let users = Arc::new(BackendUserService::new(
        config.http_client.clone(),
        settings.api_base_url.clone(),
    ));

    AuthController::new(client, exchange, users, events, settings.refresh_interval)
}
