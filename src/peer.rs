//! # Peers
//!
//! Peer endpoints as handed out by the tracker, plus this client's own
//! process-wide peer id.
//!
//! The tracker's compact format packs one peer into 6 bytes: a 4-byte IPv4
//! address followed by a 2-byte port, both in network byte order. IPv6
//! compact peers are out of scope.

use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};
use rand::Rng;

use crate::torrent::Sha1Digest;

const COMPACT_PEER_LEN: usize = 6;

/// Azureus-style client id prefix; the remaining 12 bytes are random.
const PEER_ID_PREFIX: &[u8; 8] = b"-TM0001-";

static CLIENT_PEER_ID: OnceLock<Sha1Digest> = OnceLock::new();

/// This process's 20-byte peer id, generated once on first use.
pub fn client_peer_id() -> Sha1Digest {
    *CLIENT_PEER_ID.get_or_init(|| {
        let mut id: Sha1Digest = [0; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);

        let mut rng = rand::thread_rng();
        for byte in id[8..].iter_mut() {
            *byte = rng.gen();
        }

        id
    })
}

/// A remote peer's endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a compact peer list from a tracker response.
pub fn peers_from_compact(raw: &[u8]) -> Result<Vec<Peer>> {
    if raw.len() % COMPACT_PEER_LEN != 0 {
        return Err(anyhow!("compact peer list is not a multiple of 6 bytes"));
    }

    let mut peers = Vec::with_capacity(raw.len() / COMPACT_PEER_LEN);
    for chunk in raw.chunks_exact(COMPACT_PEER_LEN) {
        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let port = Cursor::new(&chunk[4..6]).read_u16::<BigEndian>()?;

        peers.push(Peer { ip, port });
    }

    Ok(peers)
}
