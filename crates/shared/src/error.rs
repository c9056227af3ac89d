use serde::{Deserialize, Serialize};

/// Code used when a failed response carries no recognisable error body.
pub const UNKNOWN_ERROR_CODE: &str = "UNKNOWN";

/// Error envelope returned by the index service on every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    pub fn unknown(status: u16) -> Self {
        Self::new(UNKNOWN_ERROR_CODE, format!("HTTP {status}"))
    }

    /// Parses an error body, falling back to [`ErrorBody::unknown`] for anything
    /// that does not match the envelope.
    pub fn from_slice_or_unknown(status: u16, raw: &[u8]) -> Self {
        serde_json::from_slice::<ErrorBody>(raw).unwrap_or_else(|_| Self::unknown(status))
    }
}
