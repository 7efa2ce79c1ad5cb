use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not authorized (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("No token available")]
    NoToken,

    #[error("Token exchange failed: {reason}")]
    ExchangeFailed { status: Option<u16>, reason: String },

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Identity provider error: {0}")]
    Provider(String),

    #[error("Backend returned HTTP {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid sign-in state: {0}")]
    InvalidState(String),

    #[error("Credential cleared while the request was in flight")]
    Superseded,

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification driving state-machine decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, connectivity, 5xx. Retry or stay in the current state.
    Transient,
    /// 401/403 or no token at all. The session is gone.
    AuthFailure,
    /// The backend refused to mint an internal credential.
    Exchange,
    MalformedToken,
    Other,
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Timeout { .. } | AuthError::Network(_) => ErrorKind::Transient,
            AuthError::Backend { status, .. } if *status >= 500 || *status == 429 => {
                ErrorKind::Transient
            }
            AuthError::Unauthorized { .. } | AuthError::NoToken => ErrorKind::AuthFailure,
            AuthError::ExchangeFailed { .. } => ErrorKind::Exchange,
            AuthError::MalformedToken(_) => ErrorKind::MalformedToken,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AuthError::Timeout { .. })
    }

    pub fn is_auth_failure(&self) -> bool {
        self.kind() == ErrorKind::AuthFailure
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub(crate) fn timeout(operation: impl Into<String>) -> Self {
        AuthError::Timeout {
            operation: operation.into(),
        }
    }
}

impl From<BridgeError> for AuthError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::Timeout(operation) => AuthError::Timeout { operation },
            BridgeError::Storage(message) => AuthError::Storage(message),
            BridgeError::Io(e) => AuthError::Storage(e.to_string()),
            BridgeError::NotAvailable(message) | BridgeError::OperationFailed(message) => {
                AuthError::Network(message)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
