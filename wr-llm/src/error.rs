use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

/// Message used when the backend gives no usable error text of its own.
pub const GENERIC_ERROR_MESSAGE: &str = "internal error";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("response error (status={status}): {message}")]
    Response { status: u16, message: String },

    #[error("generation blocked by safety filter (status={status})")]
    SafetyBlocked { status: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmErrorKind {
    InvalidInput,
    Network,
    Response,
    SafetyBlocked,
}

impl LlmError {
    pub fn kind(&self) -> LlmErrorKind {
        match self {
            Self::InvalidInput(_) => LlmErrorKind::InvalidInput,
            Self::Network { .. } => LlmErrorKind::Network,
            Self::Response { .. } => LlmErrorKind::Response,
            Self::SafetyBlocked { .. } => LlmErrorKind::SafetyBlocked,
        }
    }

    /// Network failure with no underlying transport error attached.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn generic_response(status: u16) -> Self {
        Self::Response {
            status,
            message: GENERIC_ERROR_MESSAGE.to_string(),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network {
            message: e.to_string(),
            source: Some(e),
        }
    }
}
