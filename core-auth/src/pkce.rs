//! PKCE (RFC 7636) verifier generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;

/// Code verifier kept by the client between redirect and callback.
///
/// Only [`challenge`](Self::challenge) leaves the process before the code
/// exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct PkceVerifier {
    verifier: String,
}

impl PkceVerifier {
    /// 32 random bytes, base64url without padding (43 characters).
    pub fn new() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        Self {
            verifier: URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    /// Rebuild from a persisted verifier.
    pub fn from_secret(verifier: impl Into<String>) -> Self {
        Self {
            verifier: verifier.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.verifier
    }

    /// S256: BASE64URL(SHA256(code_verifier))
    pub fn challenge(&self) -> String {
        let hash = Sha256::digest(self.verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }
}

impl Default for PkceVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceVerifier")
            .field("verifier", &"[REDACTED]")
            .finish()
    }
}
