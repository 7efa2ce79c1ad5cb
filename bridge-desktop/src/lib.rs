//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `KeyValueStore` using a JSON file in the per-user data directory
//! - `Navigator` that prints the redirect URL
//!
//! The clock is [`bridge_traits::SystemClock`] and needs no desktop variant.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{FileKeyValueStore, ReqwestHttpClient};
//!
//! let http_client = ReqwestHttpClient::new()?;
//! let store = FileKeyValueStore::open_default("session-core")?;
//! ```

mod http;
mod navigator;
mod store;

pub use http::ReqwestHttpClient;
pub use navigator::ConsoleNavigator;
pub use store::FileKeyValueStore;
