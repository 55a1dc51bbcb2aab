//! Per-client TCP relay stacks
//!
//! Each tunnel-side TCP flow is keyed by (client address, source port) and
//! owns one relayed stream to the destination, opened through the outbound
//! connector. The client side speaks real TCP segments: the stack answers
//! the handshake, reassembles out-of-order segments into the stream
//! written to the destination, and chops the destination's bytes into
//! segments pushed back through the ESP tunnel. There is no retransmission
//! towards the client; the tunnel below already delivers or drops whole
//! frames.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use etherparse::{ip_number, Ipv4Header, TcpHeader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{EspLink, Gateway};

/// Segment payload size towards the client, safely below the tunnel MTU
const MSS: usize = 1360;
/// Idle flows older than this are reaped
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Listen,
    SynReceived,
    Established,
    FinSent,
    Closed,
}

struct TcpState {
    phase: Phase,
    /// Next sequence number we will send
    snd_nxt: u32,
    /// Next sequence number expected from the client
    rcv_nxt: u32,
    /// Segments received ahead of `rcv_nxt`
    ooo: BTreeMap<u32, Vec<u8>>,
    /// Write side towards the destination; dropped to signal EOF
    to_remote: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Data received before the destination stream existed
    pending: Vec<Vec<u8>>,
    client_fin: bool,
    last_activity: Instant,
}

/// One relayed TCP flow
pub struct TcpStack {
    gateway: Arc<Gateway>,
    link: EspLink,
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_name: String,
    dst_port: u16,
    state: Mutex<TcpState>,
}

impl TcpStack {
    /// A fresh flow in listen state; the handshake drives the rest
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<Gateway>,
        link: EspLink,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_name: String,
        dst_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            link,
            src_ip,
            src_port,
            dst_ip,
            dst_name,
            dst_port,
            state: Mutex::new(TcpState {
                phase: Phase::Listen,
                snd_nxt: rand::random(),
                rcv_nxt: 0,
                ooo: BTreeMap::new(),
                to_remote: None,
                pending: vec![],
                client_fin: false,
                last_activity: Instant::now(),
            }),
        })
    }

    /// Whether this flow can be dropped from the table
    pub fn obsolete(&self) -> bool {
        let state = self.lock();
        state.phase == Phase::Closed || state.last_activity.elapsed() > IDLE_TIMEOUT
    }

    /// Feed one TCP segment (header plus payload) from the tunnel
    pub async fn parse(self: &Arc<Self>, segment: &[u8]) {
        let Ok((header, payload)) = TcpHeader::from_slice(segment) else {
            debug!("Malformed TCP segment dropped");
            return;
        };
        let payload = payload.to_vec();

        if header.rst {
            let mut state = self.lock();
            state.phase = Phase::Closed;
            state.to_remote = None;
            return;
        }

        enum Action {
            None,
            Ack,
            Connect,
        }
        let mut action = Action::None;
        let mut forward: Vec<Vec<u8>> = vec![];
        {
            let mut state = self.lock();
            state.last_activity = Instant::now();

            if header.syn && state.phase == Phase::Listen {
                state.phase = Phase::SynReceived;
                state.rcv_nxt = header.sequence_number.wrapping_add(1);
                action = Action::Connect;
            } else if !payload.is_empty() {
                if header.sequence_number == state.rcv_nxt {
                    state.rcv_nxt = state.rcv_nxt.wrapping_add(payload.len() as u32);
                    forward.push(payload.clone());
                    // drain whatever became contiguous
                    while let Some(data) = {
                        let rcv_nxt = state.rcv_nxt;
                        state.ooo.remove(&rcv_nxt)
                    } {
                        state.rcv_nxt = state.rcv_nxt.wrapping_add(data.len() as u32);
                        forward.push(data);
                    }
                } else if header.sequence_number.wrapping_sub(state.rcv_nxt) < 1 << 30 {
                    state.ooo.insert(header.sequence_number, payload.clone());
                }
                action = Action::Ack;
            }

            if header.fin && header.sequence_number.wrapping_add(payload.len() as u32) == state.rcv_nxt
            {
                state.rcv_nxt = state.rcv_nxt.wrapping_add(1);
                state.client_fin = true;
                state.to_remote = None; // EOF towards the destination
                action = Action::Ack;
            }
            if header.ack && state.phase == Phase::FinSent && state.client_fin {
                state.phase = Phase::Closed;
            }

            for data in forward {
                if let Some(tx) = &state.to_remote {
                    let _ = tx.send(data);
                } else if state.phase == Phase::SynReceived {
                    state.pending.push(data);
                }
            }
        }

        match action {
            Action::Connect => {
                let stack = self.clone();
                tokio::spawn(async move { stack.run_remote().await });
            }
            Action::Ack => {
                let (seq, ack) = {
                    let state = self.lock();
                    (state.snd_nxt, state.rcv_nxt)
                };
                self.send_segment(false, false, false, false, seq, ack, &[]).await;
            }
            Action::None => {}
        }
    }

    /// Connect to the destination, finish the handshake and pump bytes
    async fn run_remote(self: Arc<Self>) {
        let stream = match self
            .gateway
            .tcp_connector
            .tcp_connect(&self.dst_name, self.dst_port)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                info!(dst = %self.dst_name, port = self.dst_port, "TCP connect failed: {err}");
                let (seq, ack) = {
                    let mut state = self.lock();
                    state.phase = Phase::Closed;
                    (state.snd_nxt, state.rcv_nxt)
                };
                self.send_segment(false, false, false, true, seq, ack, &[]).await;
                return;
            }
        };
        let (mut read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (isn, ack) = {
            let mut state = self.lock();
            state.phase = Phase::Established;
            for data in std::mem::take(&mut state.pending) {
                let _ = tx.send(data);
            }
            if !state.client_fin {
                state.to_remote = Some(tx);
            }
            let isn = state.snd_nxt;
            state.snd_nxt = state.snd_nxt.wrapping_add(1);
            (isn, state.rcv_nxt)
        };
        self.send_segment(true, false, false, false, isn, ack, &[]).await;

        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut buf = vec![0u8; MSS];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let (seq, ack) = {
                        let mut state = self.lock();
                        let seq = state.snd_nxt;
                        state.snd_nxt = state.snd_nxt.wrapping_add(n as u32);
                        (seq, state.rcv_nxt)
                    };
                    self.send_segment(false, true, false, false, seq, ack, &buf[..n])
                        .await;
                }
            }
        }
        // destination closed; finish our side
        let (seq, ack) = {
            let mut state = self.lock();
            let seq = state.snd_nxt;
            state.snd_nxt = state.snd_nxt.wrapping_add(1);
            state.phase = Phase::FinSent;
            (seq, state.rcv_nxt)
        };
        self.send_segment(false, false, true, false, seq, ack, &[]).await;
    }

    /// Build and tunnel one segment towards the client; every segment
    /// acknowledges the current receive position
    #[allow(clippy::too_many_arguments)]
    async fn send_segment(
        &self,
        syn: bool,
        psh: bool,
        fin: bool,
        rst: bool,
        seq: u32,
        ack: u32,
        payload: &[u8],
    ) {
        let mut header = TcpHeader::new(self.dst_port, self.src_port, seq, 0xffff);
        header.syn = syn;
        header.ack = true;
        header.psh = psh;
        header.fin = fin;
        header.rst = rst;
        header.acknowledgment_number = ack;

        let Ok(ip) = Ipv4Header::new(
            (header.header_len() as usize + payload.len()) as u16,
            64,
            ip_number::TCP,
            self.dst_ip.octets(),
            self.src_ip.octets(),
        ) else {
            return;
        };
        let Ok(checksum) = header.calc_checksum_ipv4(&ip, payload) else {
            return;
        };
        header.checksum = checksum;

        let mut packet = Vec::with_capacity(Ipv4Header::MIN_LEN + header.header_len() as usize + payload.len());
        if ip.write(&mut packet).is_err() {
            return;
        }
        if header.write(&mut packet).is_err() {
            return;
        }
        packet.extend_from_slice(payload);
        self.gateway.esp_reply(&self.link, 4, &packet).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TcpState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
