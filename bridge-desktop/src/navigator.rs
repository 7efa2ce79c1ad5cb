//! Navigator for terminal and headless desktop hosts

use bridge_traits::{error::Result, navigation::Navigator};
use tracing::info;

/// Prints the sign-in URL instead of opening a browser.
///
/// Useful for CLIs and demos where the user copies the link by hand.
#[derive(Debug, Default, Clone)]
pub struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn navigate(&self, url: &str) -> Result<()> {
        info!(url = %url, "Redirect requested");
        println!("Open this URL to continue signing in:\n  {}", url);
        Ok(())
    }
}
