//! The ESP data plane
//!
//! Inbound frames run the anti-replay window, the integrity check and the
//! decryption of one child SA; outbound packets walk the rekey successor
//! chain to the currently installed SA before being sealed. Sequence
//! numbers delivered upwards are strictly increasing per SA.

use ike_crypto::Integrity;
use ike_wire::WireError;
use tracing::debug;

use crate::session::{SessionError, Sessions};

/// Sequence numbers this far ahead of the window are treated as a peer
/// restart and fast-forward the window instead of being rejected
const WINDOW: u32 = 65536;

/// Open one inbound ESP frame (SPI, sequence number, payload, checksum)
pub fn open_inbound(
    sessions: &mut Sessions,
    frame: &[u8],
) -> Result<(u8, Vec<u8>), SessionError> {
    if frame.len() < 8 {
        return Err(WireError::BufferTooSmall.into());
    }
    let spi: [u8; 4] = frame[..4].try_into().unwrap_or_default();
    let seq = u32::from_be_bytes(frame[4..8].try_into().unwrap_or_default());
    let sa = sessions.child_mut(spi).ok_or(SessionError::UnknownSpi)?;

    if seq < sa.msgid_in || sa.msgwin_in.contains(&seq) {
        debug!(seq, next = sa.msgid_in, "Replayed ESP sequence number dropped");
        return Err(SessionError::Replay);
    }

    // Some peers truncate AES-CBC/SHA-256 checksums to 96 bits; the first
    // frame of an SA reveals this through its length parity, after which
    // both directions follow suit.
    if sa.msgid_in == 1
        && (frame.len() - 8) % 16 == 12
        && sa.crypto_in.integrity.as_ref().is_some_and(Integrity::is_sha2)
    {
        debug!("Peer uses 96 bit SHA-256 truncation, adjusting both directions");
        if let Some(integrity) = sa.crypto_in.integrity.as_mut() {
            integrity.set_hash_size(12);
        }
        if let Some(integrity) = sa.crypto_out.integrity.as_mut() {
            integrity.set_hash_size(12);
        }
    }

    sa.crypto_in.verify(frame)?;

    if seq > sa.msgid_in + WINDOW {
        // peer restarted or extreme reordering, move the window forward
        sa.incr_msgid_in();
    }
    if seq == sa.msgid_in {
        sa.incr_msgid_in();
    } else {
        sa.msgwin_in.insert(seq);
    }

    let icv = sa.crypto_in.icv_len();
    let body = frame
        .get(8..frame.len() - icv)
        .ok_or(WireError::BufferTooSmall)?;
    Ok(sa.crypto_in.open_esp(body)?)
}

/// Seal an outbound packet on the SA chain starting at `spi_in`
///
/// Returns `None` when the whole chain has been deleted, meaning the
/// tunnel is gone and the packet is dropped.
pub fn seal_outbound(
    sessions: &mut Sessions,
    spi_in: [u8; 4],
    next_header: u8,
    packet: &[u8],
) -> Option<Vec<u8>> {
    let spi = sessions.resolve_outbound(spi_in)?;
    let sa = sessions.child_mut(spi)?;
    let body = sa.crypto_out.seal_esp(next_header, packet).ok()?;
    let mut frame = sa.spi_out.to_vec();
    frame.extend_from_slice(&sa.msgid_out.to_be_bytes());
    frame.extend(body);
    let checksum = sa.crypto_out.mac(&frame).ok()?;
    frame.extend(checksum);
    sa.msgid_out += 1;
    Some(frame)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{open_inbound, seal_outbound};
    use crate::session::{ChildSa, SessionError, Sessions};
    use ike_crypto::{Cipher, Crypto, Integrity};

    const SPI_IN: [u8; 4] = [0x10, 0x20, 0x30, 0x40];
    const SPI_OUT: [u8; 4] = [0x0a, 0x0b, 0x0c, 0x0d];

    fn crypto(integ_id: u16, ek: u8, ak: u8) -> Crypto {
        Crypto::esp(
            Cipher::AesCbc128,
            vec![ek; 16],
            Integrity::ikev2(integ_id).unwrap(),
            vec![ak; 32],
        )
    }

    /// A table with one child SA plus the matching client-side contexts
    fn tunnel(integ_id: u16) -> (Sessions, Crypto) {
        let mut sessions = Sessions::new();
        let sa = ChildSa::new(
            SPI_IN,
            SPI_OUT,
            crypto(integ_id, 1, 2), // inbound: client -> gateway keys
            crypto(integ_id, 3, 4),
        );
        sessions.insert_child(sa);
        (sessions, crypto(integ_id, 1, 2))
    }

    fn client_frame(client: &Crypto, seq: u32, inner: &[u8]) -> Vec<u8> {
        let mut frame = SPI_IN.to_vec();
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend(client.seal_esp(4, inner).unwrap());
        let checksum = client.mac(&frame).unwrap();
        frame.extend(checksum);
        frame
    }

    #[test]
    fn in_order_delivery_advances_window() {
        let (mut sessions, client) = tunnel(2);
        let frame = client_frame(&client, 1, b"inner packet");
        let (next_header, inner) = open_inbound(&mut sessions, &frame).unwrap();
        assert_eq!(next_header, 4);
        assert_eq!(inner, b"inner packet");
        assert_eq!(sessions.child_mut(SPI_IN).unwrap().msgid_in, 2);
    }

    #[test]
    fn replay_is_dropped_silently() {
        let (mut sessions, client) = tunnel(2);
        let frame = client_frame(&client, 1, b"x");
        open_inbound(&mut sessions, &frame).unwrap();
        assert!(matches!(
            open_inbound(&mut sessions, &frame),
            Err(SessionError::Replay)
        ));
    }

    #[test]
    fn out_of_order_window_collapses() {
        let (mut sessions, client) = tunnel(2);
        open_inbound(&mut sessions, &client_frame(&client, 1, b"a")).unwrap();
        // 5 arrives early: delivered, parked in the window
        open_inbound(&mut sessions, &client_frame(&client, 5, b"e")).unwrap();
        assert_eq!(sessions.child_mut(SPI_IN).unwrap().msgid_in, 2);
        for (seq, payload) in [(2u32, b"b"), (3, b"c"), (4, b"d")] {
            open_inbound(&mut sessions, &client_frame(&client, seq, payload)).unwrap();
        }
        let sa = sessions.child_mut(SPI_IN).unwrap();
        assert_eq!(sa.msgid_in, 6);
        assert!(sa.msgwin_in.is_empty());
        // no value is ever delivered twice
        assert!(matches!(
            open_inbound(&mut sessions, &client_frame(&client, 5, b"e")),
            Err(SessionError::Replay)
        ));
    }

    #[test]
    fn corrupted_checksum_is_dropped() {
        let (mut sessions, client) = tunnel(2);
        let mut frame = client_frame(&client, 1, b"x");
        let n = frame.len();
        frame[n - 1] ^= 1;
        assert!(open_inbound(&mut sessions, &frame).is_err());
        // the window did not move
        assert_eq!(sessions.child_mut(SPI_IN).unwrap().msgid_in, 1);
    }

    #[test]
    fn sha256_96_peer_quirk_applies_once() {
        let (mut sessions, mut client) = tunnel(12);
        // the client truncates to 96 bits from the start
        client.integrity.as_mut().unwrap().set_hash_size(12);
        let frame = client_frame(&client, 1, b"quirky");
        assert_eq!((frame.len() - 8) % 16, 12);
        let (_, inner) = open_inbound(&mut sessions, &frame).unwrap();
        assert_eq!(inner, b"quirky");
        // outbound now truncates to 96 bits as well
        let sa = sessions.child_mut(SPI_IN).unwrap();
        assert_eq!(sa.crypto_out.icv_len(), 12);
    }

    #[test]
    fn outbound_rolls_to_successor_after_rekey() {
        let (mut sessions, _) = tunnel(2);
        let replacement = ChildSa::new(
            [0x55; 4],
            [0x66; 4],
            crypto(2, 5, 6),
            crypto(2, 7, 8),
        );
        sessions.insert_child(replacement);
        sessions.child_mut(SPI_IN).unwrap().child = Some([0x55; 4]);

        // predecessor still installed: traffic stays on it
        let frame = seal_outbound(&mut sessions, SPI_IN, 4, b"data").unwrap();
        assert_eq!(frame[..4], SPI_OUT);

        sessions.remove_child(SPI_IN);
        let frame = seal_outbound(&mut sessions, SPI_IN, 4, b"data").unwrap();
        assert_eq!(frame[..4], [0x66; 4]);
        assert_eq!(frame[4..8], 1u32.to_be_bytes());

        sessions.remove_child([0x55; 4]);
        assert!(seal_outbound(&mut sessions, SPI_IN, 4, b"data").is_none());
    }
}
