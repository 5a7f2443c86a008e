use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Anthropic-façade proxy for foreign LLM backends.
#[derive(Debug, Parser)]
#[command(name = "switchboard", version, about)]
pub struct Args {
    /// Path to the switchboard.toml configuration file.
    #[arg(short, long, env = "SWITCHBOARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address, overriding the configuration file.
    /// Use port 0 for a kernel-assigned port.
    #[arg(short, long, env = "SWITCHBOARD_LISTEN")]
    pub listen_address: Option<SocketAddr>,

    /// Log filter, e.g. `info` or `llm=debug,info`.
    #[arg(long, env = "SWITCHBOARD_LOG", default_value = "info")]
    pub log_filter: String,
}
