//! Backend user lookup.

use bridge_traits::{HttpClient, HttpRequest};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::{AuthError, Result};
use crate::types::BackendUser;

pub const USER_PATH: &str = "api/auth/user";

#[derive(Deserialize)]
#[serde(untagged)]
enum UserEnvelope {
    Wrapped { user: BackendUser },
    Bare(BackendUser),
}

/// Resolves the backend's user record for an external access token.
pub struct BackendUserService {
    http: Arc<dyn HttpClient>,
    api_base_url: String,
}

impl BackendUserService {
    pub fn new(http: Arc<dyn HttpClient>, api_base_url: impl Into<String>) -> Self {
        Self {
            http,
            api_base_url: api_base_url.into(),
        }
    }

    /// `GET /api/auth/user` with the external token as bearer.
    ///
    /// 401/403 become [`AuthError::Unauthorized`]; any other failure status
    /// is [`AuthError::Backend`].
    #[instrument(skip(self, external_token))]
    pub async fn resolve_user(&self, external_token: &str) -> Result<BackendUser> {
        let url = format!("{}/{}", self.api_base_url.trim_end_matches('/'), USER_PATH);
        let request = HttpRequest::get(url)
            .bearer_token(external_token)
            .header("Accept", "application/json");

        let response = self.http.execute(request).await?;

        match response.status {
            200..=299 => {
                let envelope: UserEnvelope = serde_json::from_slice(&response.body)?;
                let user = match envelope {
                    UserEnvelope::Wrapped { user } | UserEnvelope::Bare(user) => user,
                };
                debug!(user_id = user.id, "Backend user resolved");
                Ok(user)
            }
            401 | 403 => {
                warn!(status = response.status, "Backend rejected the external token");
                Err(AuthError::Unauthorized {
                    status: response.status,
                })
            }
            status => Err(AuthError::Backend {
                status,
                message: response
                    .error_message()
                    .unwrap_or_else(|| "user lookup failed".to_string()),
            }),
        }
    }
}
