use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// OAuth2 Bearer token for API requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuth2Token {
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub jti: String,
    pub token_type: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub refresh_token_expires_in: i64,
    #[serde(default)]
    pub refresh_token_expires_at: i64,
}

impl OAuth2Token {
    /// A bearer token with no expiry information, for tests and static setups
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            scope: String::new(),
            jti: String::new(),
            token_type: "Bearer".to_string(),
            access_token: access_token.into(),
            refresh_token: String::new(),
            expires_in: 0,
            expires_at: 0,
            refresh_token_expires_in: 0,
            refresh_token_expires_at: 0,
        }
    }

    /// Check if the access token has expired. A zero expiry means unknown.
    pub fn is_expired(&self) -> bool {
        self.expires_at != 0 && self.expires_at < Utc::now().timestamp()
    }

    /// Returns the Authorization header value.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// Supplies API tokens per identity.
///
/// Acquiring and refreshing tokens happens outside this crate; providers
/// only hand out what is already there.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Token for `owner`, or the single-user token when `owner` is `None`.
    /// Missing or expired tokens are an [`IngestError::AuthFailure`].
    async fn token(&self, owner: Option<&str>) -> Result<OAuth2Token>;
}

/// Hands out the same token for every identity
pub struct StaticTokenProvider {
    token: OAuth2Token,
}

impl StaticTokenProvider {
    pub fn new(token: OAuth2Token) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _owner: Option<&str>) -> Result<OAuth2Token> {
        if self.token.is_expired() {
            return Err(IngestError::auth("access token expired"));
        }
        Ok(self.token.clone())
    }
}
