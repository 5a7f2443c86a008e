//! HTTP server configuration settings.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::Deserialize;

/// HTTP server configuration settings.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the adapter should listen on. Port 0 asks the
    /// kernel for a free port; the resulting URL is logged at startup.
    pub listen_address: Option<SocketAddr>,
}

impl ServerConfig {
    /// The address to bind, defaulting to loopback with a kernel-assigned port.
    pub fn listen_address_or_default(&self) -> SocketAddr {
        self.listen_address
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }
}
