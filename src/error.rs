use thiserror::Error;

use crate::session::SessionState;

/// Errors surfaced by the service manager, chat client and session facade.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The local service could not be reached or started.
    #[error("local service unavailable at {endpoint}: {reason}")]
    ServiceUnavailable { endpoint: String, reason: String },

    /// The alias did not resolve to any model served by the catalog.
    #[error("unknown model alias '{alias}' (available: {})", format_available(.available))]
    UnknownAlias { alias: String, available: Vec<String> },

    /// Transport failure or malformed data while talking to the service.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The service answered with a non-success status or an error body.
    #[error("service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SessionError {
    /// True for failures that happened while a chat request was in flight.
    pub fn is_request_failure(&self) -> bool {
        matches!(
            self,
            SessionError::RequestFailed(_) | SessionError::Api { .. } | SessionError::EmptyResponse
        )
    }

    pub(crate) fn unavailable(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        SessionError::ServiceUnavailable {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}

fn format_available(available: &[String]) -> String {
    if available.is_empty() {
        "none".to_string()
    } else {
        available.join(", ")
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::RequestFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
