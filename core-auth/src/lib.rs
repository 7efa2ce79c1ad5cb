//! # Session Lifecycle Core
//!
//! Bridges an external, redirect-based identity provider session to an
//! internally issued signed token used for backend calls.
//!
//! ## Overview
//!
//! Four components, composed bottom-up:
//!
//! - [`SessionCache`](cache::SessionCache) - last observed external session
//!   with a freshness window and a single-flight fetch guard
//! - [`SessionClient`](client::SessionClient) - fetch with timeout and bounded
//!   retry, refresh, redirect sign-in, sign-out, provider events
//! - [`TokenExchangeService`](exchange::TokenExchangeService) - trades the
//!   external token for an internal credential and persists it
//! - [`AuthController`](controller::AuthController) - the state machine the
//!   application reads
//!
//! [`bootstrap::build_controller`] wires them from a
//! [`CoreConfig`](core_runtime::config::CoreConfig).
//!
//! ## Example
//!
//! ```ignore
//! use core_auth::bootstrap::build_controller;
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder().build()?;
//! let stack = build_controller(&config)?;
//! stack.controller.start().await;
//!
//! if stack.controller.state().is_authenticated() {
//!     let request = stack.controller.exchange().authorize(request)?;
//! }
//! ```

pub mod backend;
pub mod bootstrap;
pub mod cache;
pub mod client;
pub mod controller;
pub mod error;
pub mod exchange;
pub mod hosted;
pub mod jwt;
pub mod pkce;
pub mod provider;
pub mod retry;
pub mod storage_keys;
#[cfg(test)]
mod test_support;
pub mod types;

pub use backend::BackendUserService;
pub use bootstrap::{build_controller, build_controller_with_provider, SessionStack};
pub use cache::SessionCache;
pub use client::{SessionClient, Subscription, Unsubscribe};
pub use controller::AuthController;
pub use error::{AuthError, ErrorKind, Result};
pub use exchange::TokenExchangeService;
pub use hosted::HostedIdentityProvider;
pub use pkce::PkceVerifier;
pub use provider::{IdentityProvider, ProviderEvent};
pub use retry::{Attempt, RetryPolicy};
pub use types::{
    AuthPhase, AuthState, BackendUser, CachedSession, ExternalSession, ExternalUser,
    InternalCredential, ProviderKind,
};
