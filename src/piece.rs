//! # Piece State
//!
//! A piece is the unit of digest verification; it is transferred in 16 KiB
//! blocks. [`PieceTask`] carries the block accounting for one piece while
//! exactly one driver owns it: bytes requested, bytes received, and the
//! assembly buffer. Ownership moves through the work queue, so none of this
//! state is shared.
//!
//! Received block ranges are tracked explicitly: a well-behaved peer only
//! answers the ranges we asked for, but a duplicate or overlapping block
//! would silently corrupt the `downloaded` counter, so it is treated as a
//! protocol violation instead.

use std::io::Cursor;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use byteorder::{BigEndian, ReadBytesExt};

use crate::message::{Message, MESSAGE_PIECE};
use crate::torrent::Sha1Digest;

/// Transfer unit within a piece. 16 KiB is the compatibility maximum;
/// larger requests get dropped by many clients.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Download state of a single piece, owned by at most one driver at a time.
#[derive(Debug, Clone)]
pub struct PieceTask {
    /// Zero-based piece index in the torrent.
    pub index: u32,
    /// Expected SHA-1 digest from the metainfo.
    pub hash: Sha1Digest,
    /// Piece size in bytes (the last piece may be shorter).
    pub size: u32,
    /// Assembly buffer, `size` bytes.
    pub buf: Vec<u8>,
    /// Bytes requested so far, in strictly increasing `begin` order.
    pub requested: u32,
    /// Bytes received and stored in `buf`.
    pub downloaded: u32,
    /// Absorbed `[begin, end)` ranges, for duplicate detection.
    received: Vec<(u32, u32)>,
}

impl PieceTask {
    pub fn new(index: u32, hash: Sha1Digest, size: u32) -> PieceTask {
        PieceTask {
            index,
            hash,
            size,
            buf: vec![0; size as usize],
            requested: 0,
            downloaded: 0,
            received: Vec::new(),
        }
    }

    /// Size of the next block to request: 16 KiB, or whatever remains of
    /// the piece if that is smaller.
    pub fn next_block_size(&self) -> u32 {
        (self.size - self.requested).min(BLOCK_SIZE)
    }

    /// Copy a received block into the buffer and advance the accounting.
    ///
    /// The block must belong to this piece, fit inside it, and not overlap
    /// anything already received; any violation is a protocol error on the
    /// session that delivered it.
    pub fn absorb(&mut self, block: &PieceBlock) -> Result<()> {
        if block.index != self.index {
            return Err(anyhow!(
                "block belongs to piece {}, expected piece {}",
                block.index,
                self.index
            ));
        }

        let begin = block.begin;
        let len = block.data.len() as u32;
        if begin >= self.size {
            return Err(anyhow!(
                "block offset {} is past the piece end {}",
                begin,
                self.size
            ));
        }
        if u64::from(begin) + u64::from(len) > u64::from(self.size) {
            return Err(anyhow!("block [{}; {} bytes] overflows the piece", begin, len));
        }

        let end = begin + len;
        for &(seen_begin, seen_end) in &self.received {
            if begin < seen_end && seen_begin < end {
                return Err(anyhow!(
                    "block [{begin}, {end}) overlaps already received [{seen_begin}, {seen_end})"
                ));
            }
        }

        self.buf[begin as usize..end as usize].copy_from_slice(&block.data);
        self.received.push((begin, end));
        self.downloaded += len;

        Ok(())
    }

    /// Compare the buffer's SHA-1 digest against the expected one.
    pub fn verify(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.buf);

        hasher.finish() == self.hash
    }

    /// Forget all progress so the piece can be re-enqueued after a failed
    /// transfer or a digest mismatch.
    pub fn reset(&mut self) {
        self.requested = 0;
        self.downloaded = 0;
        self.received.clear();
    }
}

/// One `piece` message payload: a block of data at an offset within a piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBlock {
    pub index: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

impl PieceBlock {
    /// Parse a `piece` message: u32 index, u32 begin, then the block bytes.
    pub fn from_message(message: &Message) -> Result<PieceBlock> {
        if message.id != MESSAGE_PIECE {
            return Err(anyhow!(
                "expected a piece message, got '{}'",
                crate::message::message_name(message.id)
            ));
        }
        if message.payload.len() < 8 {
            return Err(anyhow!("piece message payload is truncated"));
        }

        let mut cursor = Cursor::new(&message.payload[..8]);
        let index = cursor.read_u32::<BigEndian>()?;
        let begin = cursor.read_u32::<BigEndian>()?;

        Ok(PieceBlock {
            index,
            begin,
            data: message.payload[8..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn sha1(data: &[u8]) -> Sha1Digest {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finish()
    }

    fn block(index: u32, begin: u32, data: Vec<u8>) -> PieceBlock {
        PieceBlock { index, begin, data }
    }

    #[test]
    fn next_block_size_is_sixteen_kib_until_the_tail() {
        // 20000-byte piece: one full block, then a 3616-byte tail.
        let mut piece = PieceTask::new(0, [0; 20], 20000);

        assert_eq!(piece.next_block_size(), BLOCK_SIZE);
        piece.requested += BLOCK_SIZE;
        assert_eq!(piece.next_block_size(), 3616);
        piece.requested += 3616;
        assert_eq!(piece.next_block_size(), 0);
    }

    #[test]
    fn absorb_copies_and_counts() {
        let mut piece = PieceTask::new(3, [0; 20], 64);

        piece.absorb(&block(3, 16, vec![7; 16])).unwrap();

        assert_eq!(piece.downloaded, 16);
        assert_eq!(&piece.buf[16..32], &[7; 16]);
        assert_eq!(&piece.buf[0..16], &[0; 16]);
    }

    #[test]
    fn absorb_rejects_foreign_piece_index() {
        let mut piece = PieceTask::new(3, [0; 20], 64);

        assert!(piece.absorb(&block(4, 0, vec![1; 8])).is_err());
        assert_eq!(piece.downloaded, 0);
    }

    #[test]
    fn absorb_rejects_out_of_bounds_blocks() {
        let mut piece = PieceTask::new(0, [0; 20], 64);

        // Offset past the end.
        assert!(piece.absorb(&block(0, 64, vec![1])).is_err());
        // In bounds but overflowing.
        assert!(piece.absorb(&block(0, 60, vec![1; 8])).is_err());
        assert_eq!(piece.downloaded, 0);
    }

    #[test]
    fn absorb_rejects_duplicate_and_overlapping_blocks() {
        let mut piece = PieceTask::new(0, [0; 20], 64);
        piece.absorb(&block(0, 0, vec![1; 32])).unwrap();

        // Exact duplicate.
        assert!(piece.absorb(&block(0, 0, vec![1; 32])).is_err());
        // Partial overlap.
        assert!(piece.absorb(&block(0, 16, vec![2; 32])).is_err());
        // The accounting is untouched by the rejects.
        assert_eq!(piece.downloaded, 32);

        piece.absorb(&block(0, 32, vec![3; 32])).unwrap();
        assert_eq!(piece.downloaded, 64);
    }

    #[test]
    fn verify_matches_the_expected_digest() {
        let data = vec![0xAB; 100];
        let mut piece = PieceTask::new(0, sha1(&data), 100);
        piece.absorb(&block(0, 0, data)).unwrap();

        assert!(piece.verify());

        piece.buf[50] ^= 1;
        assert!(!piece.verify());
    }

    #[test]
    fn reset_allows_a_clean_retry() {
        let mut piece = PieceTask::new(0, [0; 20], 32);
        piece.requested = 32;
        piece.absorb(&block(0, 0, vec![1; 32])).unwrap();

        piece.reset();

        assert_eq!(piece.requested, 0);
        assert_eq!(piece.downloaded, 0);
        // The previously received range no longer counts as a duplicate.
        piece.absorb(&block(0, 0, vec![2; 32])).unwrap();
        assert_eq!(piece.downloaded, 32);
    }

    #[test]
    fn block_parses_from_a_piece_message() {
        let mut payload = vec![0, 0, 0, 2, 0, 0, 64, 0];
        payload.extend_from_slice(&[9; 5]);
        let message = Message::with_payload(MESSAGE_PIECE, payload);

        let block = PieceBlock::from_message(&message).unwrap();
        assert_eq!(block.index, 2);
        assert_eq!(block.begin, 16384);
        assert_eq!(block.data, vec![9; 5]);
    }

    #[test]
    fn block_rejects_wrong_id_and_short_payload() {
        let not_piece = Message::with_payload(crate::message::MESSAGE_HAVE, vec![0; 12]);
        assert!(PieceBlock::from_message(&not_piece).is_err());

        let truncated = Message::with_payload(MESSAGE_PIECE, vec![0; 7]);
        assert!(PieceBlock::from_message(&truncated).is_err());
    }
}
