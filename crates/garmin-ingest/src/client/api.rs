//! Garmin Connect API client for authenticated requests
//!
//! Thin wrapper over reqwest that attaches the bearer token and maps HTTP
//! failures onto the ingest error taxonomy.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::client::tokens::OAuth2Token;
use crate::error::{IngestError, Result};

/// User agent for Connect API requests
const API_USER_AGENT: &str = "GCM-iOS-5.7.2.1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Garmin Connect API client
#[derive(Clone)]
pub struct GarminClient {
    client: Client,
    base_url: String,
}

impl GarminClient {
    /// Create a new API client for the given domain
    pub fn new(domain: &str) -> Result<Self> {
        Self::new_with_base_url(&format!("https://connectapi.{}", domain))
    }

    /// Create a new API client with a custom base URL (for testing)
    pub fn new_with_base_url(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IngestError::config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build the full URL for a given path
    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Build headers with authorization
    fn build_headers(&self, token: &OAuth2Token) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(API_USER_AGENT));
        let auth = HeaderValue::from_str(&token.authorization_header())
            .map_err(|_| IngestError::auth("token contains characters not valid in a header"))?;
        headers.insert(AUTHORIZATION, auth);
        Ok(headers)
    }

    /// Make an authenticated GET request and return the response
    pub async fn get(&self, token: &OAuth2Token, path: &str) -> Result<Response> {
        let url = self.build_url(path);
        let headers = self.build_headers(token)?;

        let response = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;

        handle_response_status(path, response).await
    }

    /// Make an authenticated GET request and deserialize the JSON response.
    ///
    /// An empty body (204 or zero-length 200) deserializes as JSON `null`.
    pub async fn get_json<T: DeserializeOwned>(&self, token: &OAuth2Token, path: &str) -> Result<T> {
        let body = self.download(token, path).await?;
        let body: &[u8] = if body.iter().all(|b| b.is_ascii_whitespace()) {
            b"null"
        } else {
            &body
        };
        serde_json::from_slice(body)
            .map_err(|e| IngestError::unsupported(format!("{}: unexpected JSON response: {}", path, e)))
    }

    /// Make an authenticated GET request and return raw bytes (for file downloads)
    pub async fn download(&self, token: &OAuth2Token, path: &str) -> Result<Bytes> {
        let response = self.get(token, path).await?;
        response.bytes().await.map_err(|e| transport_error(path, e))
    }
}

/// Timeouts and dropped connections are worth another attempt
fn transport_error(path: &str, err: reqwest::Error) -> IngestError {
    if err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() {
        IngestError::transient(format!("{}: {}", path, err))
    } else {
        IngestError::Http(err)
    }
}

/// Handle response status codes and convert to errors
async fn handle_response_status(path: &str, response: Response) -> Result<Response> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(IngestError::auth(format!("{} returned {}", path, status)))
        }
        StatusCode::NOT_FOUND => Err(IngestError::NotFound(path.to_string())),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            Err(IngestError::transient(format!("{} returned {}", path, status)))
        }
        s if s.is_server_error() => {
            let body = response.text().await.unwrap_or_default();
            Err(IngestError::transient(format!("{} returned {}: {}", path, status, body)))
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(IngestError::unsupported(format!(
                "{} returned {}: {}",
                path, status, body
            )))
        }
    }
}
