//! Runtime configuration handed down from the launcher

use std::net::Ipv4Addr;

/// Everything the gateway needs to know at startup
#[derive(Debug, Clone)]
pub struct Config {
    /// The pre-shared key both IKE versions authenticate against
    pub passwd: String,
    /// DNS server handed to clients in configuration replies
    pub dns: Ipv4Addr,
    /// Disable the DNS answer cache
    pub nocache: bool,
    /// Outbound connector URI for relayed TCP streams
    pub rserver: String,
    /// Outbound connector URI for relayed UDP datagrams
    pub urserver: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            passwd: "test".to_string(),
            dns: Ipv4Addr::new(1, 1, 1, 1),
            nocache: false,
            rserver: "direct://".to_string(),
            urserver: "direct://".to_string(),
        }
    }
}

/// The identity sent in ID payloads, `<name>-<version>`
pub fn local_id() -> String {
    format!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
