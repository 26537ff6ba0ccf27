//! # Driver
//!
//! One [`Worker`] per established peer session. A worker claims one piece
//! at a time from the shared work queue, runs the pipelined request loop
//! against its peer, verifies the assembled piece, and hands it to the
//! done stream. Any piece it cannot finish goes back on the queue with its
//! progress reset, so another session can pick it up.
//!
//! The worker is also where recovery policy lives:
//!
//! - peer lacks the piece → put it back, stay alive
//! - transfer or protocol error → put it back, close the session
//! - digest mismatch → put it back, keep the session
//! - keep-alive send failure or cancellation → close the session

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{select, tick, Receiver, Sender};

use crate::cancel::CancelToken;
use crate::client::{Client, MAX_BACKLOG};
use crate::message::MESSAGE_PIECE;
use crate::piece::{PieceBlock, PieceTask};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Inactivity deadline for the per-piece transfer loop.
const PIECE_DEADLINE: Duration = Duration::from_secs(30);

pub struct Worker {
    client: Client,
    work_tx: Sender<PieceTask>,
    work_rx: Receiver<PieceTask>,
    done_tx: Sender<PieceTask>,
    done_total: Arc<AtomicUsize>,
    total_pieces: usize,
    cancel: CancelToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        work_tx: Sender<PieceTask>,
        work_rx: Receiver<PieceTask>,
        done_tx: Sender<PieceTask>,
        done_total: Arc<AtomicUsize>,
        total_pieces: usize,
        cancel: CancelToken,
    ) -> Worker {
        Worker {
            client,
            work_tx,
            work_rx,
            done_tx,
            done_total,
            total_pieces,
            cancel,
        }
    }

    /// Drive the session until the download completes, the session dies,
    /// or the token is cancelled. Dropping `self.client` closes the
    /// connection on every exit path.
    pub fn run(mut self) {
        let peer = self.client.peer();

        if let Err(e) = self.client.send_unchoke() {
            warn!("peer {peer}: {e}");
            return;
        }
        if let Err(e) = self.client.send_interested() {
            warn!("peer {peer}: {e}");
            return;
        }

        let keep_alive = tick(KEEP_ALIVE_INTERVAL);

        loop {
            select! {
                recv(self.work_rx) -> claimed => {
                    // The queue outlives every worker; disconnection only
                    // happens when the whole download is being torn down.
                    let mut piece = match claimed {
                        Ok(piece) => piece,
                        Err(_) => return,
                    };

                    if !self.client.has_piece(piece.index) {
                        let _ = self.work_tx.send(piece);
                        continue;
                    }

                    if let Err(e) = attempt_piece(&mut self.client, &mut piece, &self.cancel) {
                        warn!("peer {peer}: piece {} failed: {e}", piece.index);
                        piece.reset();
                        let _ = self.work_tx.send(piece);
                        return;
                    }

                    if !piece.verify() {
                        warn!("peer {peer}: piece {} failed verification, requeueing", piece.index);
                        piece.reset();
                        let _ = self.work_tx.send(piece);
                        continue;
                    }

                    debug!("peer {peer}: piece {} verified", piece.index);
                    let index = piece.index;
                    if self.done_tx.send(piece).is_err() {
                        return;
                    }

                    let done = self.done_total.fetch_add(1, Ordering::Relaxed) + 1;
                    if done == self.total_pieces {
                        debug!("piece {index} was the last, signalling completion");
                        self.cancel.cancel("download complete");
                        return;
                    }
                }
                recv(keep_alive) -> _ => {
                    if let Err(e) = self.client.send_keep_alive() {
                        warn!("peer {peer}: {e}");
                        return;
                    }
                }
                recv(self.cancel.done()) -> _ => return,
            }
        }
    }
}

/// The pipelined transfer loop for one piece: keep up to [`MAX_BACKLOG`]
/// requests outstanding while unchoked, absorb piece messages as they
/// arrive, and finish once every byte is in.
fn attempt_piece(client: &mut Client, piece: &mut PieceTask, cancel: &CancelToken) -> Result<()> {
    client.set_deadline(PIECE_DEADLINE)?;

    while piece.downloaded < piece.size {
        if cancel.is_cancelled() {
            return Err(anyhow!("download cancelled"));
        }

        if !client.peer_choking() {
            while client.backlog() < MAX_BACKLOG && piece.requested < piece.size {
                let block_size = piece.next_block_size();
                client.send_request(piece.index, piece.requested, block_size)?;
                piece.requested += block_size;
            }
        }

        let message = client.read_message()?;
        if message.id == MESSAGE_PIECE {
            let block = PieceBlock::from_message(&message)?;
            piece.absorb(&block)?;
        }
    }

    Ok(())
}
