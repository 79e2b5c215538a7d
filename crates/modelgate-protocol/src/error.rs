use serde::{Deserialize, Serialize};

/// Error categories exposed to clients, OpenAI-style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequestError,
    InvalidApiKey,
    NotFoundError,
    ServiceUnavailable,
    UpstreamError,
    ServerError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub param: Option<String>,
    pub code: Option<String>,
}

/// The `{ "error": { ... } }` envelope every proxy-originated failure uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind,
                param: None,
                code: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_openai_shape() {
        let envelope = ErrorEnvelope::new(ErrorKind::InvalidApiKey, "Invalid API key");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["error"]["message"], "Invalid API key");
        assert_eq!(value["error"]["type"], "invalid_api_key");
        assert!(value["error"]["param"].is_null());
        assert!(value["error"]["code"].is_null());
    }
}
