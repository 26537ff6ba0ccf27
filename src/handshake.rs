//! # Handshake
//!
//! The 68-byte first exchange on a peer connection:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, length of the protocol string (19)
//! - **pstr**: `"BitTorrent protocol"`
//! - **reserved**: 8 bytes, all zero (extension bits, ignored on receive)
//! - **info_hash**: 20 bytes, identifies the torrent
//! - **peer_id**: 20 bytes, identifies the remote client
//!
//! The codec accepts any reserved bits and any info hash; matching the
//! local info hash is the caller's check.

use anyhow::{anyhow, Result};

use crate::torrent::Sha1Digest;

const PROTOCOL_ID: &[u8] = b"BitTorrent protocol";

/// Total size of a standard handshake on the wire.
pub const HANDSHAKE_LEN: usize = 49 + PROTOCOL_ID.len();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Sha1Digest,
    pub peer_id: Sha1Digest,
}

impl Handshake {
    pub fn new(info_hash: Sha1Digest, peer_id: Sha1Digest) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serialize into the fixed 68-byte wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::with_capacity(HANDSHAKE_LEN);

        buf.push(PROTOCOL_ID.len() as u8);
        buf.extend_from_slice(PROTOCOL_ID);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);

        buf
    }
}

/// Parse a full 68-byte handshake.
///
/// Rejects an empty protocol string and any length prefix other than 19:
/// a different prefix means the remote end is not speaking the standard
/// protocol and the rest of the buffer cannot be framed.
pub fn deserialize_handshake(buf: &[u8]) -> Result<Handshake> {
    let pstrlen = *buf
        .first()
        .ok_or_else(|| anyhow!("empty handshake"))? as usize;

    if pstrlen == 0 {
        return Err(anyhow!("handshake protocol string is empty"));
    }
    if pstrlen != PROTOCOL_ID.len() || buf.len() != HANDSHAKE_LEN {
        return Err(anyhow!("handshake is not 'BitTorrent protocol' framing"));
    }

    let mut reserved = [0u8; 8];
    reserved.copy_from_slice(&buf[1 + pstrlen..1 + pstrlen + 8]);

    let mut info_hash: Sha1Digest = [0; 20];
    info_hash.copy_from_slice(&buf[1 + pstrlen + 8..1 + pstrlen + 28]);

    let mut peer_id: Sha1Digest = [0; 20];
    peer_id.copy_from_slice(&buf[1 + pstrlen + 28..1 + pstrlen + 48]);

    Ok(Handshake {
        reserved,
        info_hash,
        peer_id,
    })
}
