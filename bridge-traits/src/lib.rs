//! # Host Bridge Traits
//!
//! Platform abstraction traits that must be implemented by each host platform.
//!
//! ## Overview
//!
//! This crate defines the contract between the session core and the host
//! (browser shell or desktop process). Each trait represents a capability the
//! core requires but that must be implemented differently per platform.
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Async HTTP round trips
//! - [`KeyValueStore`](storage::KeyValueStore) - Durable, synchronous string storage
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`Navigator`](navigation::Navigator) - Leaves the app for redirect-based sign-in
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Platform
//! implementations should:
//!
//! - Convert platform-specific errors to `BridgeError`
//! - Report deadline expiry as `BridgeError::Timeout`
//! - Never put secrets in error messages
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so implementations can be shared
//! across async tasks behind an `Arc`.

pub mod error;
pub mod http;
pub mod navigation;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use navigation::Navigator;
pub use storage::{KeyValueStore, MemoryKeyValueStore};
pub use time::{Clock, ManualClock, SystemClock};
