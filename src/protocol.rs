use serde::{Deserialize, Serialize};

/// Which request/reply shape the relay speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RelayMode {
    /// `{ "prompt": .. }` in, `{ "response": .. }` out.
    #[default]
    Prompt,
    /// `{ "session_id": .., "message": .. }` in, `{ "reply": .. }` out.
    Session,
}

impl RelayMode {
    pub fn text_field(self) -> &'static str {
        match self {
            RelayMode::Prompt => "prompt",
            RelayMode::Session => "message",
        }
    }

    pub fn reply_field(self) -> &'static str {
        match self {
            RelayMode::Prompt => "response",
            RelayMode::Session => "reply",
        }
    }
}

pub const SESSION_ID_FIELD: &str = "session_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RelayRequest {
    Session { session_id: String, message: String },
    Prompt { prompt: String },
}

impl RelayRequest {
    pub fn new(session_id: Option<String>, text: impl Into<String>) -> Self {
        match session_id {
            Some(session_id) => RelayRequest::Session {
                session_id,
                message: text.into(),
            },
            None => RelayRequest::Prompt {
                prompt: text.into(),
            },
        }
    }

    pub fn mode(&self) -> RelayMode {
        match self {
            RelayRequest::Prompt { .. } => RelayMode::Prompt,
            RelayRequest::Session { .. } => RelayMode::Session,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
