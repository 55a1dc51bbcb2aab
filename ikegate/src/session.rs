//! The process-wide session table
//!
//! One owning map from SPI bytes (8-byte IKE SPIs, 4-byte ESP SPIs) to the
//! enum-tagged sessions and child SAs. Cross references between entries are
//! SPI lookups, never owning pointers; in particular the rekey successor
//! chain of a child SA is a forward pointer to the successor's inbound SPI.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use ike_crypto::{Crypto, CryptoError};
use ike_wire::WireError;
use thiserror::Error;

use crate::ike_v1::Ikev1Session;
use crate::ike_v2::Ikev2Session;

/// Errors produced while processing an inbound IKE message or ESP frame
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum SessionError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Message not valid in the current session state")]
    UnexpectedState,

    #[error("No acceptable proposal in the offer")]
    NoProposalChosen,

    #[error("Required payload {0} is missing or malformed")]
    MissingPayload(&'static str),

    #[error("Unhandled exchange or payload combination")]
    UnhandledExchange,

    #[error("No SA known for this SPI")]
    UnknownSpi,

    #[error("Replayed or out-of-window sequence number")]
    Replay,
}

impl SessionError {
    /// Whether the error discards the session it occurred on (spec: failed
    /// authentication and state violations kill the negotiation, anything
    /// else just drops the datagram)
    pub fn discards_session(&self) -> bool {
        matches!(
            self,
            SessionError::AuthenticationFailed | SessionError::UnexpectedState
        )
    }
}

/// The states of both key exchange state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum State {
    Initial,
    SaSent,
    Established,
    Deleted,
    // version 1 main mode / transaction states
    KeSent,
    HashSent,
    AuthSet,
    ConfSent,
    ChildSaSent,
}

/// A keyed data-plane tunnel
pub struct ChildSa {
    /// Our SPI; inbound ESP frames carry it
    pub spi_in: [u8; 4],
    /// The peer's SPI; outbound frames carry it
    pub spi_out: [u8; 4],
    /// Crypto context for inbound frames
    pub crypto_in: Crypto,
    /// Crypto context for outbound frames
    pub crypto_out: Crypto,
    /// Next expected inbound sequence number
    pub msgid_in: u32,
    /// Next outbound sequence number
    pub msgid_out: u32,
    /// Sequence numbers received ahead of `msgid_in`
    pub msgwin_in: BTreeSet<u32>,
    /// Inbound SPI of the successor installed by a rekey, never unset
    pub child: Option<[u8; 4]>,
}

impl ChildSa {
    /// A fresh tunnel; sequence numbers start at 1 in both directions
    pub fn new(spi_in: [u8; 4], spi_out: [u8; 4], crypto_in: Crypto, crypto_out: Crypto) -> Self {
        Self {
            spi_in,
            spi_out,
            crypto_in,
            crypto_out,
            msgid_in: 1,
            msgid_out: 1,
            msgwin_in: BTreeSet::new(),
            child: None,
        }
    }

    /// Advance the inbound sequence number, consuming any directly
    /// following numbers already received out of order
    pub fn incr_msgid_in(&mut self) {
        self.msgid_in += 1;
        while self.msgwin_in.remove(&self.msgid_in) {
            self.msgid_in += 1;
        }
    }
}

/// A session table entry
#[allow(missing_docs)]
pub enum Entry {
    V1(Ikev1Session),
    V2(Ikev2Session),
    Esp(ChildSa),
}

/// The session table
#[derive(Default)]
pub struct Sessions {
    map: HashMap<Vec<u8>, Entry>,
    /// Successor links of already deleted child SAs, so late outbound
    /// traffic still resolves to the installed SA
    rekeyed: HashMap<[u8; 4], [u8; 4]>,
    /// Version 1 child SAs per remote address; a re-negotiated phase 1
    /// keeps operating on the same tunnel chain
    v1_children: HashMap<IpAddr, Vec<[u8; 4]>>,
}

/// Map key of an IKE SPI
pub fn ike_key(spi: u64) -> Vec<u8> {
    spi.to_be_bytes().to_vec()
}

/// Map key of an ESP SPI
pub fn esp_key(spi: [u8; 4]) -> Vec<u8> {
    spi.to_vec()
}

impl Sessions {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh nonzero IKE SPI not colliding with any existing entry
    pub fn fresh_ike_spi(&self) -> u64 {
        loop {
            let spi: u64 = rand::random();
            if spi != 0 && !self.map.contains_key(&ike_key(spi)) {
                return spi;
            }
        }
    }

    /// Draw a fresh ESP SPI not colliding with any existing entry
    ///
    /// The first octet must not be 0x00 or 0xff so the NAT-T demultiplexer
    /// can tell ESP frames from IKE and keepalives.
    pub fn fresh_esp_spi(&self) -> [u8; 4] {
        loop {
            let spi: [u8; 4] = rand::random();
            if spi[0] != 0x00 && spi[0] != 0xff && !self.map.contains_key(&esp_key(spi)) {
                return spi;
            }
        }
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, key: Vec<u8>, entry: Entry) {
        self.map.insert(key, entry);
    }

    /// Install a child SA under its inbound SPI
    pub fn insert_child(&mut self, sa: ChildSa) {
        self.map.insert(esp_key(sa.spi_in), Entry::Esp(sa));
    }

    /// Take an entry out of the table for processing
    pub fn take(&mut self, key: &[u8]) -> Option<Entry> {
        self.map.remove(key)
    }

    /// Look at an entry without removing it
    pub fn get(&self, key: &[u8]) -> Option<&Entry> {
        self.map.get(key)
    }

    /// Whether any entry exists under this key
    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// The child SA stored under this ESP SPI
    pub fn child_mut(&mut self, spi: [u8; 4]) -> Option<&mut ChildSa> {
        match self.map.get_mut(&esp_key(spi)) {
            Some(Entry::Esp(sa)) => Some(sa),
            _ => None,
        }
    }

    /// Remove a child SA, keeping its successor link resolvable
    pub fn remove_child(&mut self, spi: [u8; 4]) {
        if let Some(Entry::Esp(sa)) = self.map.remove(&esp_key(spi)) {
            if let Some(successor) = sa.child {
                self.rekeyed.insert(spi, successor);
            }
        }
    }

    /// Remove an IKE session entry
    pub fn remove_ike(&mut self, spi: u64) {
        self.map.remove(&ike_key(spi));
    }

    /// Walk the successor chain from `spi` to a child SA still installed
    pub fn resolve_outbound(&self, mut spi: [u8; 4]) -> Option<[u8; 4]> {
        loop {
            match self.map.get(&esp_key(spi)) {
                Some(Entry::Esp(_)) => return Some(spi),
                Some(_) => return None,
                None => match self.rekeyed.get(&spi) {
                    Some(successor) => spi = *successor,
                    None => return None,
                },
            }
        }
    }

    /// The version 1 child SA list of a remote peer
    pub fn v1_children(&mut self, remote: IpAddr) -> &mut Vec<[u8; 4]> {
        self.v1_children.entry(remote).or_default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
