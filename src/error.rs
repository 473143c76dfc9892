//! Error types shared by the token manager, the report client and the
//! poll coordinator.
//!
//! | Variant | Raised when | Handling |
//! |---------|-------------|----------|
//! | [`PillowError::Unauthorized`] | backend answers with a non-success `code` | re-login once, then retry |
//! | [`PillowError::Communication`] | timeout, transport error, HTTP status, bad body | failed poll, keep last report |
//! | [`PillowError::Configuration`] | identity field missing | fatal at startup |

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PillowError {
    #[error("request rejected by {endpoint}: error code {code}")]
    Unauthorized { endpoint: String, code: String },

    #[error("communication with {endpoint} failed: {source}")]
    Communication {
        endpoint: String,
        #[source]
        source: CommunicationError,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CommunicationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl PillowError {
    pub fn communication(endpoint: &str, source: CommunicationError) -> Self {
        PillowError::Communication {
            endpoint: endpoint.to_string(),
            source,
        }
    }

    pub fn malformed(endpoint: &str, message: impl Into<String>) -> Self {
        Self::communication(endpoint, CommunicationError::Malformed(message.into()))
    }

    pub fn unauthorized(endpoint: &str, code: impl Into<String>) -> Self {
        PillowError::Unauthorized {
            endpoint: endpoint.to_string(),
            code: code.into(),
        }
    }

    /// True when a fresh login may fix the failure.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, PillowError::Unauthorized { .. })
    }
}

pub type Result<T, E = PillowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_carries_code() {
        let err = PillowError::unauthorized("/fastlogin", "1001");
        assert!(err.is_unauthorized());
        assert_eq!(err.to_string(), "request rejected by /fastlogin: error code 1001");
    }

    #[test]
    fn test_communication_is_not_unauthorized() {
        let err = PillowError::communication(
            "/getday",
            CommunicationError::Timeout(Duration::from_secs(10)),
        );
        assert!(!err.is_unauthorized());
        assert!(err.to_string().contains("timed out after 10s"));
    }

    #[test]
    fn test_malformed_message() {
        let err = PillowError::malformed("/getday", "missing field `code`");
        assert_eq!(
            err.to_string(),
            "communication with /getday failed: unexpected response: missing field `code`"
        );
    }
}
