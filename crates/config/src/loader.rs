use std::path::Path;

use anyhow::{Context, bail};
use indoc::indoc;
use secrecy::ExposeSecret;

use crate::Config;

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read configuration file {}", path.display()))?;

    let config: Config = toml::from_str(&content)?;
    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    for (name, provider) in &config.llm.providers {
        if provider.api_key.expose_secret().trim().is_empty() {
            bail!("provider '{name}' has an empty api_key");
        }
    }

    if !config.llm.has_providers() {
        log::warn!("{}", indoc! {r#"
            No providers configured; only the Anthropic passthrough proxy is available.

            Example configuration:

              [llm.providers.openai]
              type = "openai"
              api_key = "sk-..."
        "#});
    }

    Ok(())
}
