use crate::conversation::RelayTransport;
use crate::protocol::{ErrorResponse, RelayRequest};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::Value;
use thiserror::Error;

pub struct ClientConfig {
    pub relay_url: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("Proxy failed: {status} {message}")]
    Proxy { status: u16, message: String },
    #[error("Invalid response from API")]
    InvalidResponse,
}

type ClientResult<T> = Result<T, ClientError>;

#[derive(Clone)]
pub struct RelayClient {
    relay_url: String,
    http: HttpClient,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            relay_url: config.relay_url,
            http: HttpClient::new(),
        }
    }

    pub async fn send_message(&self, request: &RelayRequest) -> ClientResult<String> {
        let response = self.http.post(&self.relay_url).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(envelope) => envelope.error,
                Err(_) => body,
            };
            return Err(ClientError::Proxy { status, message });
        }

        let data: Value = response.json().await?;
        match data.get(request.mode().reply_field()) {
            Some(Value::String(reply)) => Ok(reply.clone()),
            _ => Err(ClientError::InvalidResponse),
        }
    }
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn send(&self, request: &RelayRequest) -> ClientResult<String> {
        self.send_message(request).await
    }
}
