use shared::error::{ErrorBody, UNKNOWN_ERROR_CODE};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The body did not match the expected shape.
    #[error("invalid response: {0}")]
    Validation(String),
    #[error("{message}")]
    Http {
        status: u16,
        code: String,
        message: String,
    },
    /// Superseded or disposed; never shown to the user.
    #[error("request cancelled")]
    Cancelled,
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    pub fn from_body(status: u16, body: ErrorBody) -> Self {
        Self::Http {
            status,
            code: body.code,
            message: body.message,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            TransportError::Http { code, .. } => code,
            _ => UNKNOWN_ERROR_CODE,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            TransportError::Validation(value.to_string())
        } else {
            TransportError::Network(value.to_string())
        }
    }
}
