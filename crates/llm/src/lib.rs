//! Anthropic-façade translation proxy.
//!
//! Presents the Anthropic Messages API on loopback and dispatches each
//! request to the backend named by the model's `provider/` prefix,
//! translating the request into a neutral representation on the way in and
//! the backend's reply (streaming included) back into Anthropic wire shapes
//! on the way out. Paths the adapter does not implement are byte-proxied to
//! the real Anthropic API.

use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
};

pub mod error;
pub mod media;
mod messages;
pub mod provider;
mod proxy;
pub mod schema;
pub mod sink;
mod server;
mod transcode;

pub use error::{DriverError, LlmError, LlmResult};
pub use messages::{anthropic, neutral};

use provider::ProviderHints;
use server::ProxyState;

/// Same request body ceiling as Anthropic.
const BODY_LIMIT_BYTES: usize = 32 << 20;

/// Build the adapter router from configuration.
///
/// The provider map is resolved once here and never changes afterwards.
pub fn router(config: &config::Config) -> anyhow::Result<Router> {
    let drivers = provider::build_drivers(&config.llm)?;
    let sink: Arc<dyn sink::DebugSink> = Arc::from(sink::from_config(&config.debug));

    let state = Arc::new(ProxyState {
        drivers,
        hints: ProviderHints {
            reasoning_effort: config.llm.reasoning_effort,
            service_tier: config.llm.service_tier,
        },
        send_reasoning: config.llm.send_reasoning,
        sink,
        passthrough: proxy::Passthrough::new(),
    });

    Ok(build_router(state))
}

fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/v1/messages", post(server::messages))
        .route("/health", get(server::health))
        .fallback(forward_to_anthropic)
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .with_state(state)
}

/// Catch-all: byte-proxy anything the adapter does not implement.
async fn forward_to_anthropic(
    State(state): State<Arc<ProxyState>>,
    request: axum::extract::Request,
) -> axum::response::Response {
    state.passthrough.forward(request).await
}
