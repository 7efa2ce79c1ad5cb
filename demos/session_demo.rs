//! Session lifecycle demonstration
//!
//! Builds the session stack on the desktop bridges, restores whatever session
//! the store holds and prints the resulting state and events.
//!
//! Run with:
//! ```bash
//! # Restore only
//! cargo run --example session_demo
//!
//! # Start a redirect sign-in with a provider
//! cargo run --example session_demo -- sign-in discord
//!
//! # Finish it with the URL the browser landed on
//! cargo run --example session_demo -- callback "http://localhost:3000/auth/callback?code=..."
//!
//! # Sign out and purge stored auth state
//! cargo run --example session_demo -- sign-out
//! ```
//!
//! Endpoints come from `SESSION_API_URL`, `SESSION_IDENTITY_URL`,
//! `SESSION_IDENTITY_KEY` and `SESSION_REDIRECT_URL`.

use anyhow::{bail, Context};
use core_auth::{build_controller, ProviderKind};
use core_runtime::config::{CoreConfig, SessionSettings};
use core_runtime::events::CoreEvent;
use core_runtime::logging::{init_logging, LogLevel, LoggingConfig};
use std::env;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(LoggingConfig::default().with_level(LogLevel::Debug))?;

    let settings = SessionSettings::from_env()?;
    let config = CoreConfig::builder().settings(settings).build()?;
    let stack = build_controller(&config)?;
    let controller = &stack.controller;

    let mut events = controller.events();
    tokio::spawn(async move {
        while let Ok(CoreEvent::Session(event)) = events.recv().await {
            println!("event: {:?}", event);
        }
    });

    controller.start().await;
    let state = controller.state();
    info!(phase = %state.phase, "Session restored");

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => {}
        Some("sign-in") => {
            let provider: ProviderKind = args
                .get(1)
                .context("sign-in needs a provider (google or discord)")?
                .parse()?;
            controller.sign_in(provider).await?;
        }
        Some("callback") => {
            let url = args.get(1).context("callback needs the callback URL")?;
            stack.identity.complete_redirect(url).await?;
            let mut states = controller.watch();
            tokio::time::timeout(
                Duration::from_secs(20),
                states.wait_for(|state| !state.is_loading && state.is_authenticated()),
            )
            .await
            .context("sign-in did not complete")??;
        }
        Some("sign-out") => controller.sign_out().await,
        Some(other) => bail!("unknown command '{}'", other),
    }

    let state = controller.state();
    println!("phase:            {}", state.phase);
    println!("external user id: {:?}", state.external_user_id);
    println!("internal user id: {:?}", state.internal_user_id);
    println!("profile complete: {}", !controller.is_profile_incomplete());
    println!("credential valid: {}", controller.exchange().is_valid());

    controller.shutdown().await;
    Ok(())
}
