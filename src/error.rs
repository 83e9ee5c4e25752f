//! Error types for the monitoring engine.
//!
//! Resolution misses are `Option::None` and unit-conversion failures degrade to
//! `None`; neither has an error variant.

use thiserror::Error;

/// Failures talking to the telemetry backend.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("telemetry credentials not configured")]
    MissingCredentials,

    #[error("telemetry authentication failed: {reason}")]
    Auth { reason: String },

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("malformed telemetry response: {reason}")]
    Malformed { reason: String },
}

impl TelemetryError {
    /// True for the whole authentication family, including missing credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::MissingCredentials | Self::Auth { .. })
    }

    /// Missing credentials mean the integration is switched off, not broken.
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::MissingCredentials)
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, url: &str) -> Self {
        if err.is_timeout() {
            Self::Timeout { url: url.to_string() }
        } else if let Some(status) = err.status() {
            Self::Http { status: status.as_u16(), url: url.to_string() }
        } else if err.is_decode() {
            Self::Malformed { reason: err.to_string() }
        } else {
            Self::Transport(err)
        }
    }
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("encryption key not configured")]
    MissingKey,

    #[error("credential token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("credential token too short")]
    Truncated,

    #[error("credential token failed authentication")]
    Aead,

    #[error("decrypted credential is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to prepare database at {path}: {reason}")]
    Setup { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_family_flags() {
        assert!(TelemetryError::MissingCredentials.is_auth());
        assert!(TelemetryError::MissingCredentials.is_disabled());
        let auth = TelemetryError::Auth { reason: "no token".into() };
        assert!(auth.is_auth());
        assert!(!auth.is_disabled());
        let http = TelemetryError::Http { status: 500, url: "http://x".into() };
        assert!(!http.is_auth());
        assert_eq!(http.to_string(), "HTTP 500 from http://x");
    }
}
