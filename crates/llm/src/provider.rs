//! Backend driver interface and registry.
//!
//! A driver turns one neutral invocation into a neutral event stream. All
//! upstream protocol detail stays behind this seam; the proxy only ever
//! sees `NeutralEvent`s. Dropping the returned stream cancels the upstream
//! HTTP request, which is how caller aborts propagate.

pub(crate) mod anthropic;
pub(crate) mod google;
pub(crate) mod openai;

use std::{collections::BTreeMap, sync::Arc, sync::OnceLock, time::Duration};

use anyhow::Context as _;
use async_trait::async_trait;
use config::{LlmConfig, ProviderType, ReasoningEffort, ServiceTier};
use futures::stream::BoxStream;
use reqwest::Client;

use crate::{
    error::LlmResult,
    messages::neutral::{NeutralEvent, NeutralPrompt, NeutralTool},
};

/// Stream of neutral events produced by one driver invocation.
pub type EventStream = BoxStream<'static, NeutralEvent>;

/// One neutral invocation: the prompt plus everything that does not belong
/// in it.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Upstream model identifier, provider prefix already stripped.
    pub model: String,
    pub prompt: NeutralPrompt,
    pub tools: Vec<NeutralTool>,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub user_id: Option<String>,
    pub hints: ProviderHints,
}

/// Per-provider knobs that do not belong in the neutral prompt. Only the
/// OpenAI driver reads them; every other driver ignores the struct.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderHints {
    pub reasoning_effort: Option<ReasoningEffort>,
    pub service_tier: Option<ServiceTier>,
}

/// A backend driver: given a neutral invocation, produce a neutral event
/// stream.
///
/// Translation failures (`protocol_invariant`, `unsupported_media_type`)
/// surface as errors before any upstream call; upstream failures surface as
/// `driver_upstream` before the stream starts or as inline `Error` events
/// once it has.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The provider name this driver is registered under.
    fn name(&self) -> &str;

    /// The driver kind servicing this provider.
    fn kind(&self) -> ProviderType;

    async fn invoke(&self, request: InvokeRequest) -> LlmResult<EventStream>;
}

/// Build the immutable driver map from configuration. Called once at
/// startup; the map never changes afterwards.
pub fn build_drivers(config: &LlmConfig) -> anyhow::Result<BTreeMap<String, Arc<dyn Driver>>> {
    let mut drivers: BTreeMap<String, Arc<dyn Driver>> = BTreeMap::new();

    for (name, provider) in &config.providers {
        let driver: Arc<dyn Driver> = match provider.r#type {
            ProviderType::Openai | ProviderType::Xai | ProviderType::Azure => Arc::new(
                openai::OpenAiDriver::new(name.clone(), provider)
                    .with_context(|| format!("provider '{name}'"))?,
            ),
            ProviderType::Google => Arc::new(google::GoogleDriver::new(name.clone(), provider)),
            ProviderType::Anthropic => {
                Arc::new(anthropic::AnthropicDriver::new(name.clone(), provider))
            }
        };

        log::debug!("registered provider '{name}' ({:?})", provider.r#type);
        drivers.insert(name.clone(), driver);
    }

    Ok(drivers)
}

/// Shared HTTP client, reused across drivers so upstream connections pool.
pub(crate) fn http_client() -> Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            Client::builder()
                .timeout(Duration::from_secs(600))
                .connect_timeout(Duration::from_secs(30))
                // No TTL on pooled connections; a short idle timeout is the
                // only way to pick up upstream DNS changes.
                .pool_idle_timeout(Some(Duration::from_secs(5)))
                .tcp_nodelay(true)
                .tcp_keepalive(Some(Duration::from_secs(60)))
                .build()
                .expect("default HTTP client must build")
        })
        .clone()
}
