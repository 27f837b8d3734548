//! The relay: validate an inbound chat payload, forward it to the backend,
//! and normalise whatever comes back into the `{reply}` / `{error}` envelope.

use crate::protocol::{ErrorResponse, RelayMode, SESSION_ID_FIELD};
use axum::Json;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

const CHAT_PATH: &str = "/chat/";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid JSON body")]
    InvalidJson,
    #[error("Invalid {0}")]
    InvalidField(&'static str),
    #[error("Backend error ({status}): {body}")]
    Upstream { status: u16, body: String },
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("Malformed backend response")]
    MalformedResponse,
    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.is_empty() {
            Self::Internal("Proxy error".to_string())
        } else {
            Self::Internal(message)
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidJson | RelayError::InvalidField(_) => StatusCode::BAD_REQUEST,
            RelayError::Upstream { .. }
            | RelayError::Timeout(_)
            | RelayError::MalformedResponse => StatusCode::BAD_GATEWAY,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Status code plus the JSON body handed back to the caller.
#[derive(Debug)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl RelayResponse {
    fn reply(mode: RelayMode, reply: String) -> Self {
        let mut body = Map::new();
        body.insert(mode.reply_field().to_string(), Value::String(reply));
        Self {
            status: StatusCode::OK,
            body: Value::Object(body),
        }
    }
}

impl From<RelayError> for RelayResponse {
    fn from(err: RelayError) -> Self {
        let body = serde_json::to_value(ErrorResponse::new(err.to_string()))
            .unwrap_or(Value::Null);
        Self {
            status: err.status(),
            body,
        }
    }
}

impl IntoResponse for RelayResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub struct Relay {
    http: Client,
    chat_url: String,
    mode: RelayMode,
    timeout: Option<Duration>,
}

impl Relay {
    pub fn new(backend_url: &str, mode: RelayMode, timeout: Option<Duration>) -> Self {
        Self {
            http: Client::new(),
            chat_url: format!("{}{}", backend_url.trim_end_matches('/'), CHAT_PATH),
            mode,
            timeout,
        }
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    pub async fn handle(&self, raw_body: &[u8]) -> RelayResponse {
        match self.relay(raw_body).await {
            Ok(reply) => {
                tracing::debug!(mode = ?self.mode, reply_len = reply.len(), "relayed reply");
                RelayResponse::reply(self.mode, reply)
            }
            Err(err) => {
                tracing::warn!(
                    status = err.status().as_u16(),
                    error = %err,
                    "relay request failed"
                );
                err.into()
            }
        }
    }

    async fn relay(&self, raw_body: &[u8]) -> Result<String, RelayError> {
        let payload = self.validate(raw_body)?;

        let mut request = self
            .http
            .post(&self.chat_url)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let data: Value =
            serde_json::from_slice(&bytes).map_err(|_| RelayError::MalformedResponse)?;

        match data.get(self.mode.reply_field()) {
            Some(Value::String(reply)) => Ok(reply.clone()),
            _ => Err(RelayError::MalformedResponse),
        }
    }

    /// Returns the payload to forward verbatim, or the 400 to send back.
    fn validate(&self, raw_body: &[u8]) -> Result<Value, RelayError> {
        let payload: Value =
            serde_json::from_slice(raw_body).map_err(|_| RelayError::InvalidJson)?;

        if self.mode == RelayMode::Session
            && !is_non_blank_string(payload.get(SESSION_ID_FIELD))
        {
            return Err(RelayError::InvalidField(SESSION_ID_FIELD));
        }

        let field = self.mode.text_field();
        if !is_non_blank_string(payload.get(field)) {
            return Err(RelayError::InvalidField(field));
        }

        Ok(payload)
    }

    fn transport_error(&self, err: reqwest::Error) -> RelayError {
        match self.timeout {
            Some(timeout) if err.is_timeout() => RelayError::Timeout(timeout),
            _ => RelayError::internal(err.to_string()),
        }
    }
}

fn is_non_blank_string(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::String(text)) if !text.trim().is_empty())
}
