//! # Torrent Metainfo
//!
//! Parses a single-file `.torrent` file into the immutable [`Torrent`]
//! descriptor the rest of the program works from.
//!
//! A metainfo file is a bencoded dictionary:
//!
//! - **announce**: tracker URL for peer discovery
//! - **info**: file name, total length, piece length, and `pieces` — the
//!   concatenation of every piece's 20-byte SHA-1 digest
//! - optional **comment**, **creation date**, **created by**
//!
//! The `info` dictionary is re-serialized and hashed to produce the
//! torrent's info hash, the 20-byte identity used by the tracker and the
//! peer handshake. Multi-file torrents are out of scope: `info.length` is
//! required.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use boring::sha::Sha1;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;

/// A 20-byte SHA-1 digest (info hash, piece hash, peer id).
pub type Sha1Digest = [u8; 20];

const SHA1_DIGEST_LEN: usize = 20;

/// Everything the download needs to know about one torrent. Immutable
/// after parsing.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// Tracker announce URL.
    pub announce: String,
    /// SHA-1 of the bencoded `info` dictionary.
    pub info_hash: Sha1Digest,
    /// One expected digest per piece.
    pub piece_hashes: Vec<Sha1Digest>,
    /// Nominal piece size in bytes; the last piece may be shorter.
    pub piece_size: u32,
    /// Total file size in bytes.
    pub total_size: u64,
    /// Suggested output filename.
    pub name: String,
    pub comment: Option<String>,
    pub creation_date: Option<i64>,
    pub created_by: Option<String>,
}

#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenated 20-byte SHA-1 digests, one per piece
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u32,
    length: u64,
    name: String,
}

#[derive(Deserialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    info: BencodeInfo,
    #[serde(default)]
    comment: Option<String>,
    #[serde(rename = "creation date", default)]
    creation_date: Option<i64>,
    #[serde(rename = "created by", default)]
    created_by: Option<String>,
}

/// Shape of the `--preview` output; piece digests are deliberately absent.
#[derive(Serialize)]
struct TorrentPreview<'a> {
    announce: &'a str,
    name: &'a str,
    info_hash: String,
    total_size: u64,
    piece_size: u32,
    total_pieces: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    creation_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_by: Option<&'a str>,
}

impl BencodeInfo {
    /// Re-serialize and hash the info dictionary. This identifies the
    /// torrent everywhere: tracker announce and peer handshake.
    fn info_hash(&self) -> Result<Sha1Digest> {
        let encoded = ser::to_bytes(self).context("could not re-encode info dictionary")?;

        let mut hasher = Sha1::new();
        hasher.update(&encoded);

        Ok(hasher.finish())
    }

    /// Split the concatenated `pieces` string into per-piece digests.
    fn split_piece_hashes(&self) -> Result<Vec<Sha1Digest>> {
        if self.pieces.len() % SHA1_DIGEST_LEN != 0 {
            return Err(anyhow!("piece digest string is not a multiple of 20 bytes"));
        }

        let mut hashes = Vec::with_capacity(self.pieces.len() / SHA1_DIGEST_LEN);
        for chunk in self.pieces.chunks_exact(SHA1_DIGEST_LEN) {
            let mut hash: Sha1Digest = [0; SHA1_DIGEST_LEN];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }

        Ok(hashes)
    }
}

impl Torrent {
    pub fn from_file(path: &Path) -> Result<Torrent> {
        let mut file =
            File::open(path).with_context(|| format!("could not open torrent file {path:?}"))?;

        let mut buf = vec![];
        file.read_to_end(&mut buf)
            .context("could not read torrent file")?;

        Torrent::from_bytes(&buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        let bencode: BencodeTorrent =
            de::from_bytes(buf).context("could not decode torrent file")?;

        if bencode.announce.is_empty() {
            return Err(anyhow!("torrent has no announce URL"));
        }
        if bencode.info.piece_length == 0 {
            return Err(anyhow!("torrent has a zero piece length"));
        }

        Ok(Torrent {
            announce: bencode.announce,
            info_hash: bencode.info.info_hash()?,
            piece_hashes: bencode.info.split_piece_hashes()?,
            piece_size: bencode.info.piece_length,
            total_size: bencode.info.length,
            name: bencode.info.name,
            comment: bencode.comment,
            creation_date: bencode.creation_date,
            created_by: bencode.created_by,
        })
    }

    pub fn total_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Actual size of piece `index`: the nominal piece size, except for
    /// the tail of the file.
    pub fn piece_len(&self, index: u32) -> u32 {
        let begin = self.piece_offset(index);
        let end = (begin + u64::from(self.piece_size)).min(self.total_size);

        (end - begin) as u32
    }

    /// Byte offset of piece `index` in the output file. 64-bit: the
    /// product overflows u32 for any torrent past 4 GiB.
    pub fn piece_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.piece_size)
    }

    /// Pretty JSON for `--preview`, piece digests omitted.
    pub fn preview_json(&self) -> Result<String> {
        let info_hash: String = self.info_hash.iter().map(|b| format!("{b:02x}")).collect();

        let preview = TorrentPreview {
            announce: &self.announce,
            name: &self.name,
            info_hash,
            total_size: self.total_size,
            piece_size: self.piece_size,
            total_pieces: self.total_pieces(),
            comment: self.comment.as_deref(),
            creation_date: self.creation_date,
            created_by: self.created_by.as_deref(),
        };

        serde_json::to_string_pretty(&preview).context("could not render torrent preview")
    }
}
