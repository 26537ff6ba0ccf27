//! # Remora
//!
//! A single-torrent, leech-only BitTorrent client: it downloads the one
//! file described by a metainfo file, writes it to local storage, and
//! exits.
//!
//! ## Architecture
//!
//! - **Dialer threads**: one per tracker peer, performing TCP connect and
//!   handshake concurrently
//! - **Driver threads**: one per established session, pipelining block
//!   requests and verifying pieces against their expected digests
//! - **Writer**: consumes verified pieces and lands them at their offsets
//!   in the output file with positional writes
//! - **Channels**: a work queue recirculating unfinished pieces and a
//!   done stream feeding the writer
//! - **Cancellation token**: one terminal condition (completion, write
//!   failure, caller abort) stops every thread

#[macro_use]
extern crate log;

pub mod cancel;
pub mod client;
pub mod download;
pub mod handshake;
pub mod logger;
pub mod message;
pub mod peer;
pub mod piece;
pub mod torrent;
pub mod tracker;
pub mod worker;
pub mod writer;
