//! Provider configuration structures for the translation core.

use std::collections::BTreeMap;

use secrecy::SecretString;
use serde::Deserialize;

/// Translation and provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// Map of provider name to backend driver configuration.
    ///
    /// The provider name is the prefix clients put in front of the model
    /// identifier, e.g. `openai/gpt-4o-mini` routes to the `openai` entry.
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Reasoning effort injected into OpenAI requests. Other drivers ignore it.
    pub reasoning_effort: Option<ReasoningEffort>,

    /// Service tier injected into OpenAI requests. Other drivers ignore it.
    pub service_tier: Option<ServiceTier>,

    /// Whether reasoning parts are rendered as `thinking` blocks on the way
    /// back to the client. When disabled they are skipped with a warning.
    pub send_reasoning: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: BTreeMap::new(),
            reasoning_effort: None,
            service_tier: None,
            send_reasoning: true,
        }
    }
}

impl LlmConfig {
    /// Whether any backend drivers are configured.
    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }
}

/// Configuration for a single backend driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Which driver services this provider name.
    pub r#type: ProviderType,

    /// API key for authentication against the upstream.
    pub api_key: SecretString,

    /// Custom base URL for the upstream API. Each driver has a default.
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Driver kind enumeration. Unknown kinds are rejected when the
/// configuration is deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// OpenAI chat completions API.
    Openai,
    /// Google Gemini generateContent API.
    Google,
    /// xAI, speaking the OpenAI wire protocol.
    Xai,
    /// Azure OpenAI, speaking the OpenAI wire protocol behind a deployment URL.
    Azure,
    /// Anthropic Messages API.
    Anthropic,
}

/// Reasoning effort accepted by OpenAI reasoning models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    /// Minimal reasoning.
    Minimal,
    /// Low reasoning effort.
    Low,
    /// Medium reasoning effort.
    Medium,
    /// High reasoning effort.
    High,
}

impl ReasoningEffort {
    /// Wire representation of the effort level.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// OpenAI service tier selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTier {
    /// Cheaper processing with relaxed latency guarantees.
    Flex,
    /// Latency-prioritized processing.
    Priority,
}

impl ServiceTier {
    /// Wire representation of the service tier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flex => "flex",
            Self::Priority => "priority",
        }
    }
}
