use thiserror::Error;

/// Main error type for garmin-ingest
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Transient remote error: {0}")]
    RemoteTransient(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Transient write error: {0}")]
    WriteTransient(String),

    #[error("Write rejected by backend: {0}")]
    WriteRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid date format: {0}. Expected YYYY-MM-DD")]
    InvalidDateFormat(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Create a transient remote error from a message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::RemoteTransient(msg.into())
    }

    /// Create an authentication failure from a message
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthFailure(msg.into())
    }

    /// Create a decode error from a message
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an unsupported-format error from a message
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    /// Create a configuration error from a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Errors worth retrying at the point of failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RemoteTransient(_) | Self::WriteTransient(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            _ => false,
        }
    }

    /// Errors that abort the whole run regardless of the lenient toggle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure(_)
                | Self::Config(_)
                | Self::WriteTransient(_)
                | Self::WriteRejected(_)
                | Self::Database(_)
        )
    }
}

/// Render an error with a hint for the operator
pub fn format_user_error(err: &IngestError) -> String {
    match err {
        IngestError::AuthFailure(_) => format!(
            "{}\nRefresh the OAuth2 token file for this profile and try again.",
            err
        ),
        IngestError::Config(_) | IngestError::InvalidDateFormat(_) => {
            format!("{}\nCheck the configuration file and command line flags.", err)
        }
        IngestError::WriteTransient(_) | IngestError::WriteRejected(_) => format!(
            "{}\nNothing past the last committed window was recorded; re-run once the backend is reachable.",
            err
        ),
        _ => err.to_string(),
    }
}
