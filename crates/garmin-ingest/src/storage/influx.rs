//! Time-series sink speaking both InfluxDB protocol generations
//!
//! | Generation | Write                     | Query                | Auth            |
//! |------------|---------------------------|----------------------|-----------------|
//! | v1         | `/write?db=`              | `/query` (InfluxQL)  | `u`/`p` params  |
//! | v3         | `/api/v3/write_lp?db=`    | `/api/v3/query_sql`  | bearer token    |

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use super::line_protocol::{encode_batch, ACTIVITY_TAG, OWNER_TAG};
use super::Sink;
use crate::config::ProtocolGeneration;
use crate::error::{IngestError, Result};
use crate::models::{ActivityIdentity, MetricKind, MetricRecord};

/// Lines per write request
const BATCH_LINES: usize = 5000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct InfluxSink {
    client: Client,
    generation: ProtocolGeneration,
    base_url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

impl InfluxSink {
    pub fn new(generation: ProtocolGeneration, url: &str, database: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IngestError::config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            generation,
            base_url: url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            username: None,
            password: None,
            token: None,
        })
    }

    /// Username/password authentication (v1)
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Bearer token authentication (v3)
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.generation {
            ProtocolGeneration::V1 => match (&self.username, &self.password) {
                (Some(u), Some(p)) => request.query(&[("u", u.as_str()), ("p", p.as_str())]),
                _ => request,
            },
            ProtocolGeneration::V3 => match &self.token {
                Some(token) => request.bearer_auth(token),
                None => request,
            },
        }
    }

    fn write_request(&self, body: String) -> RequestBuilder {
        let request = match self.generation {
            ProtocolGeneration::V1 => self
                .client
                .post(format!("{}/write", self.base_url))
                .query(&[("db", self.database.as_str()), ("precision", "ns")]),
            ProtocolGeneration::V3 => self
                .client
                .post(format!("{}/api/v3/write_lp", self.base_url))
                .query(&[("db", self.database.as_str()), ("precision", "nanosecond")]),
        };
        self.authorize(request)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                IngestError::WriteTransient(e.to_string())
            } else {
                IngestError::Http(e)
            }
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    fn identities_query(&self, owner: Option<&str>) -> String {
        let measurement = MetricKind::ActivitySummary.measurement();
        let filter = owner
            .map(|o| format!(" WHERE \"{}\" = '{}'", OWNER_TAG, o.replace('\'', "\\'")))
            .unwrap_or_default();
        match self.generation {
            ProtocolGeneration::V1 => format!(
                "SHOW TAG VALUES FROM \"{}\" WITH KEY = \"{}\"{}",
                measurement, ACTIVITY_TAG, filter
            ),
            ProtocolGeneration::V3 => format!(
                "SELECT DISTINCT \"{}\" FROM \"{}\"{}",
                ACTIVITY_TAG,
                measurement,
                filter.replace("\\'", "''")
            ),
        }
    }
}

/// 4xx means the batch itself is bad; anything else may succeed later
fn classify_status(status: StatusCode, body: String) -> IngestError {
    let message = format!("{}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        IngestError::WriteTransient(message)
    } else if status.is_client_error() {
        IngestError::WriteRejected(message)
    } else {
        IngestError::WriteTransient(message)
    }
}

/// Collect tag values from an InfluxQL `SHOW TAG VALUES` response
fn parse_v1_identities(body: &Value) -> HashSet<ActivityIdentity> {
    body["results"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|result| result["series"].as_array())
        .flatten()
        .filter_map(|series| series["values"].as_array())
        .flatten()
        .filter_map(|row| row.get(1).and_then(|v| v.as_str()))
        .map(ActivityIdentity::new)
        .collect()
}

/// Collect the column from a SQL JSON response (array of row objects)
fn parse_v3_identities(body: &Value) -> HashSet<ActivityIdentity> {
    body.as_array()
        .into_iter()
        .flatten()
        .filter_map(|row| row.get(ACTIVITY_TAG).and_then(|v| v.as_str()))
        .map(ActivityIdentity::new)
        .collect()
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write(&self, records: &[MetricRecord]) -> Result<()> {
        for chunk in records.chunks(BATCH_LINES) {
            let body = encode_batch(chunk);
            if body.is_empty() {
                continue;
            }
            self.send(self.write_request(body)).await?;
        }
        log::debug!("Wrote {} records to {}", records.len(), self.database);
        Ok(())
    }

    async fn known_activity_identities(&self, owner: Option<&str>) -> Result<HashSet<ActivityIdentity>> {
        let q = self.identities_query(owner);
        let request = match self.generation {
            ProtocolGeneration::V1 => self
                .client
                .get(format!("{}/query", self.base_url))
                .query(&[("db", self.database.as_str()), ("q", q.as_str())]),
            ProtocolGeneration::V3 => self
                .client
                .get(format!("{}/api/v3/query_sql", self.base_url))
                .query(&[("db", self.database.as_str()), ("q", q.as_str()), ("format", "json")]),
        };

        let response = match self.send(self.authorize(request)).await {
            Ok(response) => response,
            // Nothing written yet: the table does not exist
            Err(IngestError::WriteRejected(msg)) if msg.contains("not found") || msg.starts_with("404") => {
                return Ok(HashSet::new());
            }
            Err(e) => return Err(e),
        };
        let body: Value = response
            .json()
            .await
            .map_err(|e| IngestError::WriteTransient(format!("unreadable query response: {}", e)))?;

        Ok(match self.generation {
            ProtocolGeneration::V1 => parse_v1_identities(&body),
            ProtocolGeneration::V3 => parse_v3_identities(&body),
        })
    }

    fn describe(&self) -> String {
        let generation = match self.generation {
            ProtocolGeneration::V1 => "v1",
            ProtocolGeneration::V3 => "v3",
        };
        format!("influx {} {}/{}", generation, self.base_url, self.database)
    }
}
