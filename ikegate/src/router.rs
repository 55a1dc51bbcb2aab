//! The inner packet router
//!
//! Once an ESP frame is opened, the next-header octet says what the inner
//! packet is. Only IPv4 is handled: UDP flows (with a DNS fast path on
//! port 53) go to the outbound UDP connector, TCP segments to the per-flow
//! relay stacks, ICMP is decoded for the log and everything else is
//! dropped. Replies re-enter the ESP data plane through the link handle,
//! which survives rekeys via the successor chain.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use etherparse::{ip_number, Icmpv4Header, Icmpv4Type, Ipv4Header, TcpHeader, UdpHeader};
use tracing::{debug, info, warn};

use crate::dns::DnsRecord;
use crate::tcp::TcpStack;
use crate::{EspLink, Gateway};

/// Next-header value of IPv4-in-ESP (IANA protocol 4, IP-in-IP)
pub const NEXT_HEADER_IPV4: u8 = 4;

/// Route one decrypted inner packet
pub async fn route(gateway: &Arc<Gateway>, link: EspLink, next_header: u8, packet: Vec<u8>) {
    if next_header != NEXT_HEADER_IPV4 {
        info!(next_header, "Unhandled inner protocol, packet dropped");
        return;
    }
    let Ok((ip, ip_payload)) = Ipv4Header::from_slice(&packet) else {
        debug!("Malformed inner IPv4 packet dropped");
        return;
    };
    let src_ip = Ipv4Addr::from(ip.source);
    let dst_ip = Ipv4Addr::from(ip.destination);
    let dst_name = gateway.dns.ip2domain(&IpAddr::V4(dst_ip));

    match ip.protocol {
        ip_number::UDP => handle_udp(gateway, link, src_ip, dst_ip, dst_name, ip_payload).await,
        ip_number::TCP => handle_tcp(gateway, link, src_ip, dst_ip, dst_name, ip_payload).await,
        ip_number::ICMP => log_icmp(&dst_name, ip_payload),
        other => info!(protocol = other.0, dst = %dst_name, "Unhandled IPv4 protocol"),
    }
}

async fn handle_udp(
    gateway: &Arc<Gateway>,
    link: EspLink,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    dst_name: String,
    ip_payload: &[u8],
) {
    let Ok((udp, udp_body)) = UdpHeader::from_slice(ip_payload) else {
        debug!("Malformed inner UDP datagram dropped");
        return;
    };
    let udp_body = udp_body
        .get(..usize::from(udp.length).saturating_sub(UdpHeader::LEN))
        .unwrap_or(udp_body);
    let (src_port, dst_port) = (udp.source_port, udp.destination_port);

    if dst_port == 53 {
        match DnsRecord::unpack(udp_body) {
            Ok(record) => {
                let cached = gateway.dns.query(&record);
                info!(
                    dst = %dst_name,
                    query = %record.qname,
                    cached = cached.is_some(),
                    "IPv4 DNS query"
                );
                if let Some(reply) = cached {
                    if let Some(packet) =
                        udp_packet(dst_ip, dst_port, src_ip, src_port, &reply)
                    {
                        gateway.esp_reply(&link, NEXT_HEADER_IPV4, &packet).await;
                    }
                    return;
                }
            }
            Err(err) => warn!("Undecodable DNS query relayed as plain UDP: {err}"),
        }
    } else {
        info!(dst = %dst_name, port = dst_port, len = udp_body.len(), "IPv4 UDP");
    }

    let reply_gateway = gateway.clone();
    let reply_name = dst_name.clone();
    let on_reply: crate::connect::UdpReplyFn = Box::new(move |udp_body: Vec<u8>| {
        let gateway = reply_gateway.clone();
        let link = link.clone();
        let dst_name = reply_name.clone();
        tokio::spawn(async move {
            if dst_port == 53 {
                match DnsRecord::unpack(&udp_body) {
                    Ok(record) => {
                        gateway.dns.answer(&record);
                        info!(
                            dst = %dst_name,
                            answers = record.answers.len(),
                            "IPv4 DNS answer"
                        );
                    }
                    Err(err) => debug!("Undecodable DNS answer: {err}"),
                }
            } else {
                info!(dst = %dst_name, len = udp_body.len(), "IPv4 UDP reply");
            }
            if let Some(packet) = udp_packet(dst_ip, dst_port, src_ip, src_port, &udp_body) {
                gateway.esp_reply(&link, NEXT_HEADER_IPV4, &packet).await;
            }
        });
    });

    if let Err(err) = gateway
        .udp_connector
        .udp_sendto(
            &dst_name,
            dst_port,
            udp_body,
            (IpAddr::V4(src_ip), src_port),
            on_reply,
        )
        .await
    {
        debug!(dst = %dst_name, "Outbound UDP failed: {err}");
    }
}

async fn handle_tcp(
    gateway: &Arc<Gateway>,
    link: EspLink,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    dst_name: String,
    ip_payload: &[u8],
) {
    let Ok((tcp, _)) = TcpHeader::from_slice(ip_payload) else {
        debug!("Malformed inner TCP segment dropped");
        return;
    };
    let key = (link.peer.ip(), tcp.source_port);
    let stack = {
        let mut stacks = gateway.lock_tcp_stacks();
        match stacks.get(&key) {
            Some(stack) => stack.clone(),
            None => {
                if tcp.syn {
                    info!(dst = %dst_name, port = tcp.destination_port, "IPv4 TCP connect");
                }
                stacks.retain(|_, stack| !stack.obsolete());
                let stack = TcpStack::new(
                    gateway.clone(),
                    link.clone(),
                    src_ip,
                    tcp.source_port,
                    dst_ip,
                    dst_name,
                    tcp.destination_port,
                );
                stacks.insert(key, stack.clone());
                stack
            }
        }
    };
    stack.parse(ip_payload).await;
}

fn log_icmp(dst_name: &str, ip_payload: &[u8]) {
    let Ok((icmp, body)) = Icmpv4Header::from_slice(ip_payload) else {
        debug!("Malformed inner ICMP packet dropped");
        return;
    };
    match icmp.icmp_type {
        Icmpv4Type::EchoReply(echo) => {
            info!(dst = %dst_name, id = echo.id, seq = echo.seq, "IPv4 PING reply")
        }
        // relaying echo would need a raw socket, which the gateway does not have
        Icmpv4Type::EchoRequest(echo) => {
            info!(dst = %dst_name, id = echo.id, seq = echo.seq, "IPv4 ECHO (not relayed)")
        }
        Icmpv4Type::DestinationUnreachable(_) => {
            if let Ok((inner, inner_payload)) = Ipv4Header::from_slice(body) {
                let port = inner_payload
                    .get(2..4)
                    .map(|p| u16::from_be_bytes([p[0], p[1]]))
                    .unwrap_or(0);
                info!(
                    dst = %dst_name,
                    protocol = inner.protocol.0,
                    port,
                    "IPv4 ICMP destination unreachable"
                );
            }
        }
        other => info!(dst = %dst_name, ?other, "IPv4 ICMP"),
    }
}

/// Assemble an IPv4/UDP packet with both checksums filled in
pub fn udp_packet(
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let ip = Ipv4Header::new(
        (UdpHeader::LEN + payload.len()) as u16,
        64,
        ip_number::UDP,
        src_ip.octets(),
        dst_ip.octets(),
    )
    .ok()?;
    let udp = UdpHeader::with_ipv4_checksum(src_port, dst_port, &ip, payload).ok()?;
    let mut packet = Vec::with_capacity(Ipv4Header::MIN_LEN + UdpHeader::LEN + payload.len());
    ip.write(&mut packet).ok()?;
    udp.write(&mut packet).ok()?;
    packet.extend_from_slice(payload);
    Some(packet)
}
