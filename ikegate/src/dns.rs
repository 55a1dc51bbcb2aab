//! DNS answer cache
//!
//! A deliberately small slice of RFC 1035: enough of the message format to
//! read the question and the answer records, cache complete answer
//! datagrams per (name, type) and map resolved addresses back to the
//! domain that asked for them. Cached replies are replayed verbatim with
//! the transaction id of the new query stamped in.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Record type A
pub const TYPE_A: u16 = 1;

/// Errors of the record codec
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum DnsError {
    #[error("Datagram too short for a DNS message")]
    Truncated,

    #[error("Name compression loop")]
    PointerLoop,

    #[error("Message carries no question")]
    NoQuestion,
}

/// One answer resource record
#[derive(Debug, Clone)]
pub struct DnsAnswer {
    /// Owner name of the record
    pub name: String,
    /// Record type
    pub rtype: u16,
    /// Time to live in seconds
    pub ttl: u32,
    /// Raw record data; four octets for an A record
    pub rdata: Vec<u8>,
}

/// A parsed DNS message, keeping the raw datagram for replay
#[derive(Debug, Clone)]
pub struct DnsRecord {
    /// Transaction id
    pub id: u16,
    /// Whether the message is a response
    pub is_response: bool,
    /// Name of the first question
    pub qname: String,
    /// Type of the first question
    pub qtype: u16,
    /// The answer records
    pub answers: Vec<DnsAnswer>,
    raw: Vec<u8>,
}

impl DnsRecord {
    /// Parse a DNS datagram
    pub fn unpack(buf: &[u8]) -> Result<Self, DnsError> {
        if buf.len() < 12 {
            return Err(DnsError::Truncated);
        }
        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let is_response = buf[2] & 0x80 != 0;
        let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
        let ancount = u16::from_be_bytes([buf[6], buf[7]]);
        if qdcount == 0 {
            return Err(DnsError::NoQuestion);
        }

        let mut pos = 12;
        let (qname, next) = parse_name(buf, pos)?;
        pos = next;
        if buf.len() < pos + 4 {
            return Err(DnsError::Truncated);
        }
        let qtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        pos += 4;
        // skip any further questions
        for _ in 1..qdcount {
            let (_, next) = parse_name(buf, pos)?;
            pos = next + 4;
        }

        let mut answers = vec![];
        for _ in 0..ancount {
            let (name, next) = parse_name(buf, pos)?;
            pos = next;
            if buf.len() < pos + 10 {
                return Err(DnsError::Truncated);
            }
            let rtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let ttl = u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);
            let rdlength = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
            pos += 10;
            let rdata = buf.get(pos..pos + rdlength).ok_or(DnsError::Truncated)?.to_vec();
            pos += rdlength;
            answers.push(DnsAnswer {
                name,
                rtype,
                ttl,
                rdata,
            });
        }

        Ok(Self {
            id,
            is_response,
            qname,
            qtype,
            answers,
            raw: buf.to_vec(),
        })
    }

    /// The raw datagram with a different transaction id stamped in
    pub fn with_id(&self, id: u16) -> Vec<u8> {
        let mut out = self.raw.clone();
        out[..2].copy_from_slice(&id.to_be_bytes());
        out
    }
}

fn parse_name(buf: &[u8], mut pos: usize) -> Result<(String, usize), DnsError> {
    let mut labels: Vec<String> = vec![];
    let mut next = 0;
    let mut jumped = false;
    let mut jumps = 0;
    loop {
        let len = *buf.get(pos).ok_or(DnsError::Truncated)? as usize;
        if len & 0xc0 == 0xc0 {
            let low = *buf.get(pos + 1).ok_or(DnsError::Truncated)? as usize;
            if !jumped {
                next = pos + 2;
                jumped = true;
            }
            pos = (len & 0x3f) << 8 | low;
            jumps += 1;
            if jumps > 32 {
                return Err(DnsError::PointerLoop);
            }
        } else if len == 0 {
            if !jumped {
                next = pos + 1;
            }
            return Ok((labels.join("."), next));
        } else {
            let label = buf.get(pos + 1..pos + 1 + len).ok_or(DnsError::Truncated)?;
            labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
            pos += 1 + len;
        }
    }
}

/// The process-wide DNS cache
pub struct DnsCache {
    enabled: bool,
    cache: Mutex<HashMap<(String, u16), (DnsRecord, Instant)>>,
    domains: Mutex<HashMap<IpAddr, String>>,
}

impl DnsCache {
    /// A cache; `enabled = false` turns [DnsCache::answer] into a no-op
    /// while the reverse mapping keeps working
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            cache: Mutex::new(HashMap::new()),
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// The domain that resolved to `ip`, or the address itself
    pub fn ip2domain(&self, ip: &IpAddr) -> String {
        lock(&self.domains)
            .get(ip)
            .cloned()
            .unwrap_or_else(|| ip.to_string())
    }

    /// A cached, still fresh reply to `query`, re-stamped with its id
    pub fn query(&self, query: &DnsRecord) -> Option<Vec<u8>> {
        let key = (query.qname.clone(), query.qtype);
        let cache = lock(&self.cache);
        let (record, expires) = cache.get(&key)?;
        if Instant::now() >= *expires {
            return None;
        }
        Some(record.with_id(query.id))
    }

    /// Store an answer and learn its addresses for the reverse mapping
    pub fn answer(&self, record: &DnsRecord) {
        for answer in &record.answers {
            if answer.rtype == TYPE_A && answer.rdata.len() == 4 {
                let ip = IpAddr::V4(Ipv4Addr::new(
                    answer.rdata[0],
                    answer.rdata[1],
                    answer.rdata[2],
                    answer.rdata[3],
                ));
                lock(&self.domains).insert(ip, record.qname.clone());
            }
        }
        if !self.enabled || record.answers.is_empty() {
            return;
        }
        let ttl = record.answers.iter().map(|a| a.ttl).min().unwrap_or(0);
        if ttl == 0 {
            return;
        }
        debug!(name = %record.qname, ttl, "DNS answer cached");
        lock(&self.cache).insert(
            (record.qname.clone(), record.qtype),
            (record.clone(), Instant::now() + Duration::from_secs(u64::from(ttl))),
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{DnsCache, DnsRecord};
    use std::net::{IpAddr, Ipv4Addr};

    /// Query for an A record of example.test
    fn query_bytes(id: u16) -> Vec<u8> {
        let mut buf = vec![];
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        buf.extend_from_slice(b"\x07example\x04test\x00");
        buf.extend_from_slice(&[0, 1, 0, 1]);
        buf
    }

    /// Matching answer with a compressed name pointer and a 300s TTL
    fn answer_bytes(id: u16) -> Vec<u8> {
        let mut buf = vec![];
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&[0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0]);
        buf.extend_from_slice(b"\x07example\x04test\x00");
        buf.extend_from_slice(&[0, 1, 0, 1]);
        buf.extend_from_slice(&[0xc0, 0x0c]); // pointer to the question name
        buf.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0x01, 0x2c, 0, 4]);
        buf.extend_from_slice(&[93, 184, 215, 14]);
        buf
    }

    #[test]
    fn parses_query_and_answer() {
        let query = DnsRecord::unpack(&query_bytes(0x1234)).unwrap();
        assert_eq!(query.id, 0x1234);
        assert_eq!(query.qname, "example.test");
        assert_eq!(query.qtype, 1);
        assert!(!query.is_response);
        assert!(query.answers.is_empty());

        let answer = DnsRecord::unpack(&answer_bytes(0x1234)).unwrap();
        assert!(answer.is_response);
        assert_eq!(answer.answers.len(), 1);
        assert_eq!(answer.answers[0].name, "example.test");
        assert_eq!(answer.answers[0].ttl, 300);
        assert_eq!(answer.answers[0].rdata, vec![93, 184, 215, 14]);
    }

    #[test]
    fn cache_hit_is_restamped_with_the_query_id() {
        let cache = DnsCache::new(true);
        let query1 = DnsRecord::unpack(&query_bytes(0x1111)).unwrap();
        assert!(cache.query(&query1).is_none());

        cache.answer(&DnsRecord::unpack(&answer_bytes(0x1111)).unwrap());
        let query2 = DnsRecord::unpack(&query_bytes(0x2222)).unwrap();
        let hit = cache.query(&query2).unwrap();
        assert_eq!(hit[..2], [0x22, 0x22]);
        assert_eq!(&hit[2..], &answer_bytes(0x1111)[2..]);

        // resolved address now maps back to the domain
        let ip = IpAddr::V4(Ipv4Addr::new(93, 184, 215, 14));
        assert_eq!(cache.ip2domain(&ip), "example.test");
        assert_eq!(
            cache.ip2domain(&IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))),
            "9.9.9.9"
        );
    }

    #[test]
    fn disabled_cache_still_learns_domains() {
        let cache = DnsCache::new(false);
        cache.answer(&DnsRecord::unpack(&answer_bytes(7)).unwrap());
        let query = DnsRecord::unpack(&query_bytes(8)).unwrap();
        assert!(cache.query(&query).is_none());
        let ip = IpAddr::V4(Ipv4Addr::new(93, 184, 215, 14));
        assert_eq!(cache.ip2domain(&ip), "example.test");
    }
}
