//! # ikegate
//!
//! A user-space VPN gateway terminating IKE version 1 and 2 with a
//! pre-shared key and tunneling the clients' ESP-encapsulated IPv4
//! traffic through an outbound connector. One task loop serves both UDP
//! endpoints; all protocol state lives in a single SPI-keyed session
//! table and nothing survives the process.

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ike_wire::message::Message;
use ike_wire::params::ExchangeType;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::signal;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::connect::Connection;
use crate::dns::DnsCache;
use crate::ike_v1::Ikev1Session;
use crate::ike_v2::Ikev2Session;
use crate::session::{ike_key, Entry, Sessions, State};
use crate::tcp::TcpStack;

pub mod config;
pub mod connect;
pub mod dns;
pub mod esp;
pub mod ike_v1;
pub mod ike_v2;
pub mod router;
pub mod session;
pub mod tcp;

/// Leading bytes marking IKE-in-UDP on the NAT-T port
const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];
/// A one-octet NAT keepalive, echoed as-is
const KEEPALIVE: [u8; 1] = [0xff];

const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Errors that may occur while running the gateway
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum GatewayError {
    #[error("Could not bind: {0}")]
    CouldNotBind(io::Error),
    #[error("Could not recv: {0}")]
    Receive(io::Error),
    #[error("Could not send: {0}")]
    Send(io::Error),
    #[error("Connector error: {0}")]
    Connector(#[from] connect::ConnectError),
}

/// Handle through which tunnel-side replies re-enter the ESP data plane
///
/// It captures the inbound SPI of the SA a packet arrived on and the NAT-T
/// origin of the client; sending resolves the rekey successor chain anew
/// every time, so the handle stays valid across rekeys.
#[derive(Debug, Clone)]
pub struct EspLink {
    /// Inbound SPI of the child SA the flow belongs to
    pub spi_in: [u8; 4],
    /// The client's UDP origin on port 4500
    pub peer: SocketAddr,
}

/// The gateway state shared by the loop and the relay tasks
pub struct Gateway {
    /// Startup configuration
    pub config: Config,
    /// The SPI-keyed session table
    pub sessions: Mutex<Sessions>,
    /// The process-wide DNS cache
    pub dns: DnsCache,
    /// Outbound connector for relayed UDP
    pub udp_connector: Connection,
    /// Outbound connector for relayed TCP
    pub tcp_connector: Connection,
    tcp_stacks: Mutex<HashMap<(IpAddr, u16), Arc<TcpStack>>>,
    socket_500: UdpSocket,
    socket_4500: UdpSocket,
}

impl Gateway {
    /// Bind the well-known UDP endpoints and assemble the shared state
    pub async fn bind(config: Config) -> Result<Arc<Self>, GatewayError> {
        Self::bind_to(config, "0.0.0.0:500", "0.0.0.0:4500").await
    }

    /// Bind specific addresses, used by tests to avoid the privileged ports
    pub async fn bind_to(
        config: Config,
        addr_500: &str,
        addr_4500: &str,
    ) -> Result<Arc<Self>, GatewayError> {
        let socket_500 = UdpSocket::bind(addr_500)
            .await
            .map_err(GatewayError::CouldNotBind)?;
        let socket_4500 = UdpSocket::bind(addr_4500)
            .await
            .map_err(GatewayError::CouldNotBind)?;
        let udp_connector = Connection::parse(&config.urserver)?;
        let tcp_connector = Connection::parse(&config.rserver)?;
        Ok(Arc::new(Self {
            dns: DnsCache::new(!config.nocache),
            sessions: Mutex::new(Sessions::new()),
            tcp_stacks: Mutex::new(HashMap::new()),
            socket_500,
            socket_4500,
            udp_connector,
            tcp_connector,
            config,
        }))
    }

    /// Serve both endpoints until ctrl-c
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>) -> Result<(), GatewayError> {
        info!("Serving on UDP :500 :4500");
        let mut buf_500 = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut buf_4500 = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            select! {
                received = self.socket_500.recv_from(&mut buf_500) => {
                    let (len, addr) = received.map_err(GatewayError::Receive)?;
                    for reply in self.process_ike(&buf_500[..len], addr) {
                        self.socket_500
                            .send_to(&reply, addr)
                            .await
                            .map_err(GatewayError::Send)?;
                    }
                }
                received = self.socket_4500.recv_from(&mut buf_4500) => {
                    let (len, addr) = received.map_err(GatewayError::Receive)?;
                    let datagram = buf_4500[..len].to_vec();
                    self.handle_4500(datagram, addr).await?;
                }
                _ = signal::ctrl_c() => {
                    info!("Shutting down, dropping all sessions");
                    return Ok(());
                }
            }
        }
    }

    /// Demultiplex one datagram from the NAT-T port
    async fn handle_4500(
        self: &Arc<Self>,
        datagram: Vec<u8>,
        addr: SocketAddr,
    ) -> Result<(), GatewayError> {
        if datagram == KEEPALIVE {
            self.socket_4500
                .send_to(&KEEPALIVE, addr)
                .await
                .map_err(GatewayError::Send)?;
            return Ok(());
        }
        if datagram.len() >= 4 && datagram[..4] == NON_ESP_MARKER {
            for reply in self.process_ike(&datagram[4..], addr) {
                let mut framed = NON_ESP_MARKER.to_vec();
                framed.extend(reply);
                self.socket_4500
                    .send_to(&framed, addr)
                    .await
                    .map_err(GatewayError::Send)?;
            }
            return Ok(());
        }
        if datagram.len() < 8 {
            debug!(len = datagram.len(), "Short NAT-T datagram dropped");
            return Ok(());
        }

        let spi_in: [u8; 4] = match datagram[..4].try_into() {
            Ok(spi) => spi,
            Err(_) => return Ok(()),
        };
        let opened = {
            let mut sessions = self.lock_sessions();
            esp::open_inbound(&mut sessions, &datagram)
        };
        match opened {
            Ok((next_header, inner)) => {
                let link = EspLink { spi_in, peer: addr };
                router::route(self, link, next_header, inner).await;
            }
            Err(err) => debug!(spi = format_args!("{spi_in:02x?}"), "ESP frame dropped: {err}"),
        }
        Ok(())
    }

    /// Parse and dispatch one IKE message, returning the datagrams to send
    ///
    /// Sessions are taken out of the table while they process a message
    /// and put back afterwards unless the message deleted them or failed
    /// in a way that discards the negotiation.
    pub fn process_ike(&self, datagram: &[u8], addr: SocketAddr) -> Vec<Vec<u8>> {
        let mut replies = vec![];
        let message = match Message::parse(datagram) {
            Ok(message) => message,
            Err(err) => {
                debug!(%addr, "Undecodable IKE datagram: {err}");
                return replies;
            }
        };
        let mut sessions = self.lock_sessions();

        if message.exchange == ExchangeType::IkeSaInit {
            let mut session = Ikev2Session::new(&sessions, message.spi_i);
            match session.process(&self.config, &mut sessions, message, &mut replies) {
                Ok(()) => {
                    sessions.insert(ike_key(session.my_spi), Entry::V2(session));
                }
                Err(err) => debug!(%addr, "IKE_SA_INIT failed: {err}"),
            }
        } else if message.exchange == ExchangeType::Identity1 && message.spi_r == 0 {
            let mut session = Ikev1Session::new(&sessions, message.spi_i, addr.ip());
            match session.process(&self.config, &mut sessions, message, &mut replies) {
                Ok(()) => {
                    sessions.insert(ike_key(session.my_spi), Entry::V1(session));
                }
                Err(err) => debug!(%addr, "Main mode start failed: {err}"),
            }
        } else {
            let key = ike_key(message.spi_r);
            match sessions.take(&key) {
                Some(Entry::V2(mut session)) => {
                    let result =
                        session.process(&self.config, &mut sessions, message, &mut replies);
                    self.settle(&mut sessions, key, Entry::V2(session), result, addr);
                }
                Some(Entry::V1(mut session)) => {
                    let result =
                        session.process(&self.config, &mut sessions, message, &mut replies);
                    self.settle(&mut sessions, key, Entry::V1(session), result, addr);
                }
                Some(entry) => {
                    // an ESP SPI is never a valid IKE responder SPI
                    sessions.insert(key, entry);
                    debug!(%addr, "IKE message for a non-IKE SPI dropped");
                }
                None => debug!(%addr, spi = message.spi_r, "IKE message for unknown SPI dropped"),
            }
        }
        replies
    }

    /// Put a processed session back unless it is gone
    fn settle(
        &self,
        sessions: &mut Sessions,
        key: Vec<u8>,
        entry: Entry,
        result: Result<(), session::SessionError>,
        addr: SocketAddr,
    ) {
        let state = match &entry {
            Entry::V1(session) => session.state,
            Entry::V2(session) => session.state,
            Entry::Esp(_) => State::Deleted,
        };
        match result {
            Ok(()) if state != State::Deleted => {
                sessions.insert(key, entry);
            }
            Ok(()) => {}
            Err(err) if err.discards_session() => {
                warn!(%addr, "Session discarded: {err}");
            }
            Err(err) => {
                debug!(%addr, "IKE message dropped: {err}");
                sessions.insert(key, entry);
            }
        }
    }

    /// Seal and send one packet back into the tunnel of `link`
    ///
    /// Returns false when the SA chain is gone and the packet was dropped.
    pub async fn esp_reply(&self, link: &EspLink, next_header: u8, packet: &[u8]) -> bool {
        let frame = {
            let mut sessions = self.lock_sessions();
            esp::seal_outbound(&mut sessions, link.spi_in, next_header, packet)
        };
        match frame {
            Some(frame) => match self.socket_4500.send_to(&frame, link.peer).await {
                Ok(_) => true,
                Err(err) => {
                    debug!(peer = %link.peer, "ESP reply send failed: {err}");
                    false
                }
            },
            None => {
                debug!(spi = format_args!("{:02x?}", link.spi_in), "Tunnel gone, reply dropped");
                false
            }
        }
    }

    /// Local address of the IKE endpoint
    pub fn addr_500(&self) -> io::Result<SocketAddr> {
        self.socket_500.local_addr()
    }

    /// Local address of the NAT-T endpoint
    pub fn addr_4500(&self) -> io::Result<SocketAddr> {
        self.socket_4500.local_addr()
    }

    /// The session table, immune to lock poisoning
    pub fn lock_sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_tcp_stacks(
        &self,
    ) -> MutexGuard<'_, HashMap<(IpAddr, u16), Arc<TcpStack>>> {
        self.tcp_stacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
