//! Outbound connectors
//!
//! The gateway never talks to destinations itself; everything leaves
//! through a connector named by a URI. Only the `direct://` scheme is
//! implemented: TCP streams connect straight to the destination and UDP
//! datagrams are sent from one local socket per tunnel origin, so replies
//! find their way back to the flow that asked for them.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::debug;

/// Errors of connector parsing and use
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConnectError {
    #[error("Unsupported connector scheme in {0:?}")]
    UnsupportedScheme(String),
}

/// Callback invoked for every datagram a UDP flow receives back
pub type UdpReplyFn = Box<dyn Fn(Vec<u8>) + Send + Sync>;

struct UdpFlow {
    socket: Arc<UdpSocket>,
    handler: Arc<StdMutex<UdpReplyFn>>,
}

/// An outbound connector
pub struct Connection {
    uri: String,
    flows: Mutex<HashMap<(IpAddr, u16), UdpFlow>>,
}

impl Connection {
    /// Parse a connector URI; everything but `direct://` is refused
    pub fn parse(uri: &str) -> Result<Self, ConnectError> {
        if uri != "direct://" {
            return Err(ConnectError::UnsupportedScheme(uri.to_string()));
        }
        Ok(Self {
            uri: uri.to_string(),
            flows: Mutex::new(HashMap::new()),
        })
    }

    /// The URI this connector was built from
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Open a TCP stream to the destination
    pub async fn tcp_connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }

    /// Send one datagram to `host:port` on behalf of `origin`
    ///
    /// The socket is shared by every send of the same origin and replies
    /// from anywhere are handed to the most recently registered callback,
    /// which may fire zero or more times.
    pub async fn udp_sendto(
        &self,
        host: &str,
        port: u16,
        payload: &[u8],
        origin: (IpAddr, u16),
        on_reply: UdpReplyFn,
    ) -> io::Result<()> {
        let mut flows = self.flows.lock().await;
        let socket = match flows.get(&origin) {
            Some(flow) => {
                *lock_handler(&flow.handler) = on_reply;
                flow.socket.clone()
            }
            None => {
                let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
                let handler = Arc::new(StdMutex::new(on_reply));
                tokio::spawn(recv_loop(socket.clone(), handler.clone()));
                flows.insert(
                    origin,
                    UdpFlow {
                        socket: socket.clone(),
                        handler,
                    },
                );
                socket
            }
        };
        drop(flows);
        socket.send_to(payload, (host, port)).await?;
        Ok(())
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, handler: Arc<StdMutex<UdpReplyFn>>) {
    let mut buf = [0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                debug!(%from, len = n, "UDP reply from destination");
                (lock_handler(&handler))(buf[..n].to_vec());
            }
            Err(err) => {
                debug!("UDP flow socket closed: {err}");
                return;
            }
        }
    }
}

fn lock_handler(handler: &StdMutex<UdpReplyFn>) -> std::sync::MutexGuard<'_, UdpReplyFn> {
    handler.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
