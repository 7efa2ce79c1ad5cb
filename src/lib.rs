//! Workspace facade crate.
//!
//! Re-exports the session crates so a host can depend on `session-workspace`
//! alone. The `desktop-shims` feature (on by default) compiles in the
//! `bridge-desktop` adapters as defaults for every bridge.

pub use bridge_traits;
pub use core_auth;
pub use core_runtime;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;
