//! # Tracker Announce
//!
//! One HTTP GET against the torrent's announce URL, reporting a fresh
//! leech (`uploaded=0`, `downloaded=0`, `left=<total size>`, `compact=1`)
//! and decoding the bencoded response into a peer list.
//!
//! `info_hash` and `peer_id` are raw 20-byte strings, so the query is
//! assembled by hand with every byte percent-encoded; a generic URL
//! encoder would mangle them.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use url::Url;

use crate::peer::{client_peer_id, peers_from_compact, Peer};
use crate::torrent::{Sha1Digest, Torrent};

/// Port reported to the tracker. The client never listens on it (leech
/// only), but the parameter is mandatory.
pub const CLIENT_PORT: u16 = 6881;

const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct BencodeTrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(rename = "warning message", default)]
    warning_message: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    interval: Option<u32>,
    /// Compact peer list: 6 bytes per peer.
    #[serde(default)]
    peers: ByteBuf,
}

/// Announce to the torrent's tracker and return the discovered peers.
pub fn announce(torrent: &Torrent) -> Result<Vec<Peer>> {
    let url = build_announce_url(
        &torrent.announce,
        &torrent.info_hash,
        &client_peer_id(),
        CLIENT_PORT,
        torrent.total_size,
    )?;

    let client = reqwest::blocking::Client::builder()
        .timeout(TRACKER_TIMEOUT)
        .build()
        .context("could not build tracker HTTP client")?;

    let response = client
        .get(&url)
        .send()
        .context("could not reach tracker")?;

    if !response.status().is_success() {
        return Err(anyhow!("tracker responded with status {}", response.status()));
    }

    let body = response
        .bytes()
        .context("could not read tracker response")?;

    parse_response(&body)
}

fn parse_response(body: &[u8]) -> Result<Vec<Peer>> {
    let response: BencodeTrackerResponse =
        serde_bencode::de::from_bytes(body).context("could not decode tracker response")?;

    if let Some(reason) = response.failure_reason {
        return Err(anyhow!("tracker refused the announce: {reason}"));
    }
    if let Some(warning) = response.warning_message {
        warn!("tracker warning: {warning}");
    }

    let peers = peers_from_compact(&response.peers)?;
    if peers.is_empty() {
        return Err(anyhow!("tracker returned no peers"));
    }

    info!("tracker returned {} peer(s)", peers.len());

    Ok(peers)
}

/// Assemble the announce URL. `info_hash` and `peer_id` are percent-encoded
/// byte-by-byte.
fn build_announce_url(
    announce: &str,
    info_hash: &Sha1Digest,
    peer_id: &Sha1Digest,
    port: u16,
    left: u64,
) -> Result<String> {
    fn percent_encode(data: &[u8]) -> String {
        const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
        let mut encoded = String::with_capacity(data.len() * 3);

        for &byte in data {
            encoded.push('%');
            encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
        }

        encoded
    }

    let base = Url::parse(announce).context("could not parse announce URL")?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        percent_encode(info_hash),
        percent_encode(peer_id),
        port,
        left,
    );

    let mut url = base.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&query);

    Ok(url)
}
