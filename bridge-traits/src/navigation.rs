//! Redirect launcher abstraction.
//!
//! Redirect-based sign-in leaves the application: the browser navigates to
//! the identity provider and comes back through a callback URL. The core only
//! decides *where* to go; the host performs the navigation.

use crate::error::Result;

/// Host navigation trait
///
/// - Web: `window.location.assign(url)`
/// - Desktop: open the system browser or print the URL
pub trait Navigator: Send + Sync {
    /// Navigate away to `url`. Returning does not mean the flow finished.
    fn navigate(&self, url: &str) -> Result<()>;
}
