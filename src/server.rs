use crate::protocol::RelayMode;
use crate::relay::{Relay, RelayResponse};
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

pub const RELAY_ROUTE: &str = "/api/llm";

pub struct RelayConfig {
    pub listen: String,
    pub backend_url: String,
    pub mode: RelayMode,
    pub backend_timeout: Option<Duration>,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: RelayConfig) -> ServerResult<()> {
    let relay = Arc::new(Relay::new(
        &config.backend_url,
        config.mode,
        config.backend_timeout,
    ));
    let app = router(relay.clone());

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        route = RELAY_ROUTE,
        backend = relay.chat_url(),
        mode = ?relay.mode(),
        timeout = ?config.backend_timeout,
        "relay listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(relay: Arc<Relay>) -> axum::Router {
    axum::Router::new()
        .route(RELAY_ROUTE, post(relay_message))
        .with_state(relay)
}

// Raw bytes rather than `Json<_>` so a bad body gets our 400 envelope.
async fn relay_message(State(relay): State<Arc<Relay>>, body: Bytes) -> RelayResponse {
    relay.handle(&body).await
}
