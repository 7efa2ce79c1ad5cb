//! Durable storage layout shared by the session components.

/// Internally issued signed token
pub const SIGNED_TOKEN_KEY: &str = "jwt_token";
/// Internal numeric user id
pub const USER_ID_KEY: &str = "jwt_user_id";
/// Cached external-account identifier
pub const ACCOUNT_ID_KEY: &str = "jwt_account_id";

/// Keys owned by the token exchange service.
pub const CREDENTIAL_KEYS: [&str; 3] = [SIGNED_TOKEN_KEY, USER_ID_KEY, ACCOUNT_ID_KEY];

/// Suffix of the key holding a pending PKCE verifier.
pub const CODE_VERIFIER_SUFFIX: &str = "-code-verifier";

/// Whether `key` looks like authentication state and goes on sign-out.
pub fn is_auth_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.starts_with("sb-")
        || lower.starts_with("jwt_")
        || lower.contains("supabase")
        || lower.contains("auth")
}
