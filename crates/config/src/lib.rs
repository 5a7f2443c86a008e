//! Switchboard configuration structures to map the switchboard.toml configuration.

#![deny(missing_docs)]

mod debug;
mod llm;
mod loader;
mod server;

use std::path::Path;

pub use debug::{DebugCapture, DebugConfig};
pub use llm::{LlmConfig, ProviderConfig, ProviderType, ReasoningEffort, ServiceTier};
use serde::Deserialize;
pub use server::ServerConfig;

/// Main configuration structure for the switchboard adapter.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Provider and translation configuration settings.
    pub llm: LlmConfig,
    /// Debug sink configuration settings.
    pub debug: DebugConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates provider entries and warns when only the passthrough proxy remains.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use secrecy::ExposeSecret;

    fn parse(input: &str) -> Config {
        toml::from_str(input).expect("valid configuration")
    }

    #[test]
    fn full_configuration_round_trip() {
        let config = parse(indoc! {r#"
            [server]
            listen_address = "127.0.0.1:0"

            [llm]
            reasoning_effort = "high"
            service_tier = "flex"

            [llm.providers.openai]
            type = "openai"
            api_key = "sk-test"

            [llm.providers.gemini]
            type = "google"
            api_key = "AIza-test"
            base_url = "https://generativelanguage.googleapis.com/v1beta"

            [debug]
            path = "/tmp/switchboard-debug"
            capture = "streams"
        "#});

        assert_eq!(config.server.listen_address.unwrap().port(), 0);
        assert_eq!(config.llm.providers.len(), 2);
        assert_eq!(config.llm.reasoning_effort, Some(ReasoningEffort::High));
        assert_eq!(config.llm.service_tier, Some(ServiceTier::Flex));

        let openai = &config.llm.providers["openai"];
        assert!(matches!(openai.r#type, ProviderType::Openai));
        assert_eq!(openai.api_key.expose_secret(), "sk-test");
        assert!(openai.base_url.is_none());

        let gemini = &config.llm.providers["gemini"];
        assert!(matches!(gemini.r#type, ProviderType::Google));
        assert_eq!(
            gemini.base_url.as_deref(),
            Some("https://generativelanguage.googleapis.com/v1beta")
        );

        assert_eq!(config.debug.capture, DebugCapture::Streams);
        assert!(config.debug.enabled());
    }

    #[test]
    fn unknown_provider_type_is_rejected() {
        let error = toml::from_str::<Config>(indoc! {r#"
            [llm.providers.mystery]
            type = "cohere"
            api_key = "key"
        "#})
        .unwrap_err();

        assert!(error.to_string().contains("unknown variant"), "{error}");
    }

    #[test]
    fn empty_configuration_uses_defaults() {
        let config = parse("");

        assert!(config.server.listen_address.is_none());
        assert!(config.llm.providers.is_empty());
        assert!(config.llm.send_reasoning);
        assert!(!config.debug.enabled());
        assert_eq!(config.debug.capture, DebugCapture::Errors);
    }

    #[test]
    fn empty_api_key_fails_validation() {
        let config = parse(indoc! {r#"
            [llm.providers.openai]
            type = "openai"
            api_key = ""
        "#});

        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("openai"), "{error}");
    }
}
