//! # Piece Writer
//!
//! Consumes the stream of verified pieces and lands each one at its
//! offset in the output file. Pieces arrive in completion order, not
//! index order, so writes are positional (`write_all_at`) and never
//! contend on a file cursor. A failed write is fatal for the whole
//! download: the writer cancels the shared token with the error as cause.

use std::fs::File;
use std::os::unix::fs::FileExt;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{select, Receiver};
use indicatif::{ProgressBar, ProgressStyle};

use crate::cancel::CancelToken;
use crate::piece::PieceTask;

/// Drain `pieces` into `output` until all `total_pieces` are on disk or
/// the token fires.
pub fn write_pieces(
    output: &File,
    pieces: &Receiver<PieceTask>,
    piece_size: u32,
    total_size: u64,
    total_pieces: usize,
    cancel: &CancelToken,
) -> Result<()> {
    if total_pieces == 0 {
        return Ok(());
    }

    let progress = ProgressBar::new(total_size);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
            .unwrap()
            .progress_chars("#>-"),
    );

    let mut written = 0usize;

    loop {
        select! {
            recv(pieces) -> delivered => match delivered {
                Ok(piece) => {
                    if let Err(e) = store(output, &piece, piece_size) {
                        cancel.cancel(&format!("{e:#}"));
                        progress.abandon();
                        return Err(e);
                    }

                    progress.inc(u64::from(piece.size));
                    written += 1;
                    if written == total_pieces {
                        progress.finish();
                        return Ok(());
                    }
                }
                // Producers only disappear during teardown.
                Err(_) => {
                    progress.abandon();
                    return Err(interruption(cancel));
                }
            },
            recv(cancel.done()) -> _ => {
                // Pieces verified before the signal are already queued;
                // land them before deciding how this ended.
                while let Ok(piece) = pieces.try_recv() {
                    store(output, &piece, piece_size)?;
                    progress.inc(u64::from(piece.size));
                    written += 1;
                }

                if written == total_pieces {
                    progress.finish();
                    return Ok(());
                }
                progress.abandon();
                return Err(interruption(cancel));
            }
        }
    }
}

fn store(output: &File, piece: &PieceTask, piece_size: u32) -> Result<()> {
    let offset = u64::from(piece.index) * u64::from(piece_size);

    output
        .write_all_at(&piece.buf, offset)
        .with_context(|| format!("could not write piece {} at offset {offset}", piece.index))
}

fn interruption(cancel: &CancelToken) -> anyhow::Error {
    match cancel.cause() {
        Some(cause) => anyhow!("download interrupted: {cause}"),
        None => anyhow!("piece stream closed before the download finished"),
    }
}
