use std::net::Ipv4Addr;

use clap::Parser;

/// The cli of ikegate
#[derive(Debug, Parser)]
#[clap(author, version, about = "User-space IKE/ESP VPN gateway")]
pub struct Cli {
    /// The pre-shared key clients authenticate against
    #[clap(short, long, default_value = "test")]
    pub passwd: String,

    /// DNS server handed to clients in configuration replies
    #[clap(long, default_value = "1.1.1.1")]
    pub dns: Ipv4Addr,

    /// TCP remote server uri
    #[clap(short, default_value = "direct://")]
    pub rserver: String,

    /// UDP remote server uri
    #[clap(long = "ur", default_value = "direct://")]
    pub urserver: String,

    /// Do not cache DNS answers
    #[clap(long = "nc")]
    pub nocache: bool,
}
