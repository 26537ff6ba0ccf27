//! # Download Coordination
//!
//! Wires the whole pipeline together:
//!
//! 1. every unfinished piece goes onto the shared work queue
//! 2. the dialer opens one connection per tracker peer in parallel and
//!    emits established sessions
//! 3. each session gets a driver thread ([`Worker`]) that claims pieces
//!    from the queue
//! 4. verified pieces flow to the writer, which places them in the output
//!    file
//!
//! Ownership of a piece moves with it: it is either in the queue or held
//! by exactly one driver, so no piece is ever worked on twice at once.
//! The queue stays open for the whole download — running out of peers is
//! not a terminal condition, and the coordinator will wait for the caller
//! to cancel rather than give up on an unfinished torrent.

use std::fs::File;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use crossbeam_channel::{bounded, select, unbounded, Receiver};

use crate::cancel::CancelToken;
use crate::client::Client;
use crate::peer::Peer;
use crate::piece::PieceTask;
use crate::torrent::Torrent;
use crate::worker::Worker;
use crate::writer;

/// Download every piece of `torrent` from `peers` into `output`.
///
/// Blocks until the torrent is complete or `cancel` fires. The writer
/// runs on the calling thread; dialing and per-session drivers run on
/// their own threads and all observe the same token.
pub fn download(
    torrent: &Torrent,
    peers: Vec<Peer>,
    output: &File,
    cancel: &CancelToken,
) -> Result<()> {
    let total_pieces = torrent.total_pieces() as usize;

    println!(
        "Downloading {:?} ({} pieces, {} peer(s))",
        torrent.name,
        total_pieces,
        peers.len(),
    );

    let (work_tx, work_rx) = unbounded();
    for index in 0..torrent.total_pieces() {
        let piece = PieceTask::new(
            index,
            torrent.piece_hashes[index as usize],
            torrent.piece_len(index),
        );
        // Cannot fail: this function holds the receiver.
        let _ = work_tx.send(piece);
    }

    let (done_tx, done_rx) = unbounded();
    let done_total = Arc::new(AtomicUsize::new(0));

    let sessions = dial_peers(torrent, peers, cancel);

    // Session intake: one driver thread per established session.
    {
        let done_total = Arc::clone(&done_total);
        let cancel = cancel.clone();
        let work_tx = work_tx.clone();
        let done_tx = done_tx.clone();
        thread::spawn(move || loop {
            select! {
                recv(sessions) -> session => {
                    let client = match session {
                        Ok(client) => client,
                        // Dialer is done; drivers carry on by themselves.
                        Err(_) => return,
                    };

                    let worker = Worker::new(
                        client,
                        work_tx.clone(),
                        work_rx.clone(),
                        done_tx.clone(),
                        Arc::clone(&done_total),
                        total_pieces,
                        cancel.clone(),
                    );
                    thread::spawn(move || worker.run());
                }
                recv(cancel.done()) -> _ => return,
            }
        });
    }

    let result = writer::write_pieces(
        output,
        &done_rx,
        torrent.piece_size,
        torrent.total_size,
        total_pieces,
        cancel,
    );

    // Unblock any straggler threads still parked on the queue.
    cancel.cancel("download finished");

    result
}

/// Open one connection per peer concurrently. Established sessions come
/// out of the returned channel; it closes once every dial attempt has
/// succeeded or failed. Failed dials are logged and dropped, never
/// retried.
fn dial_peers(torrent: &Torrent, peers: Vec<Peer>, cancel: &CancelToken) -> Receiver<Client> {
    let (tx, rx) = bounded(peers.len().max(1));

    let info_hash = torrent.info_hash;
    let total_pieces = torrent.total_pieces();

    for peer in peers {
        let tx = tx.clone();
        let cancel = cancel.clone();

        thread::spawn(move || match Client::connect(peer, info_hash, total_pieces) {
            Ok(client) => {
                // The channel has room for every peer, so this never
                // blocks; sessions arriving after cancellation are dropped.
                if !cancel.is_cancelled() {
                    let _ = tx.send(client);
                }
            }
            Err(e) => warn!("discarding peer {peer}: {e}"),
        });
    }

    rx
}
