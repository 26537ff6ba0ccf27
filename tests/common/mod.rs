//! Scripted peer fixture: the server side of the peer wire protocol,
//! just enough to exercise the download engine. Each fixture peer owns
//! one listener, accepts one connection, performs the handshake, presents
//! a configurable bitfield, unchokes, and answers `request` messages from
//! a reference buffer. Optional misbehavior: corrupting the first serve
//! of a piece, dropping the connection after N blocks, or holding
//! requests to measure the client's pipelining burst.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use boring::sha::Sha1;

use remora::peer::Peer;
use remora::torrent::{Sha1Digest, Torrent};

pub fn sha1(data: &[u8]) -> Sha1Digest {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finish()
}

/// Deterministic, non-repeating test payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

/// A descriptor for a torrent whose content is `data`, without going
/// through a metainfo file.
pub fn make_torrent(data: &[u8], piece_size: u32) -> Torrent {
    Torrent {
        announce: "http://tracker.invalid/announce".to_string(),
        info_hash: sha1(data),
        piece_hashes: data.chunks(piece_size as usize).map(sha1).collect(),
        piece_size,
        total_size: data.len() as u64,
        name: "fixture.bin".to_string(),
        comment: None,
        creation_date: None,
        created_by: None,
    }
}

pub fn bitfield_with(total_pieces: u32, indices: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0u8; total_pieces.div_ceil(8) as usize];
    for &index in indices {
        bytes[(index / 8) as usize] |= 1 << (7 - index % 8);
    }
    bytes
}

pub fn full_bitfield(total_pieces: u32) -> Vec<u8> {
    bitfield_with(total_pieces, &(0..total_pieces).collect::<Vec<_>>())
}

#[derive(Default)]
pub struct PeerBehavior {
    /// Bitfield presented right after the handshake.
    pub bitfield: Vec<u8>,
    /// Flip a byte in the first block served of this piece, once.
    pub corrupt_once: Option<u32>,
    /// Close the connection after serving this many blocks.
    pub disconnect_after_blocks: Option<usize>,
    /// Sit on requests until the client stalls, recording the burst size,
    /// then serve the whole batch.
    pub hold_requests: bool,
    /// Delay before presenting the bitfield (lets another peer go first).
    pub delay_bitfield: Option<Duration>,
    /// Complete the handshake but never present a bitfield, trickling
    /// keep-alives instead so no single read ever times out.
    pub withhold_bitfield: bool,
}

/// What the fixture observed while serving.
#[derive(Default)]
pub struct ServeLog {
    /// Length field of every `request` received, in arrival order.
    pub request_lengths: Vec<u32>,
    /// Largest number of requests seen outstanding at once (hold mode).
    pub max_burst: usize,
}

pub fn spawn_peer(
    data: Vec<u8>,
    piece_size: u32,
    info_hash: Sha1Digest,
    behavior: PeerBehavior,
) -> (Peer, JoinHandle<ServeLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind fixture listener");
    let port = listener.local_addr().expect("fixture addr").port();

    let handle = thread::spawn(move || serve(listener, data, piece_size, info_hash, behavior));

    (
        Peer {
            ip: Ipv4Addr::LOCALHOST,
            port,
        },
        handle,
    )
}

fn serve(
    listener: TcpListener,
    data: Vec<u8>,
    piece_size: u32,
    info_hash: Sha1Digest,
    behavior: PeerBehavior,
) -> ServeLog {
    let mut log = ServeLog::default();

    let mut conn = match listener.accept() {
        Ok((conn, _)) => conn,
        Err(_) => return log,
    };

    if !shake_hands(&mut conn, &info_hash) {
        return log;
    }

    if behavior.withhold_bitfield {
        // Only the client's absolute establish deadline gets rid of us;
        // the stream of keep-alives defeats any per-read timeout.
        while conn.write_all(&0u32.to_be_bytes()).is_ok() {
            thread::sleep(Duration::from_millis(50));
        }
        return log;
    }

    if let Some(delay) = behavior.delay_bitfield {
        thread::sleep(delay);
    }
    if send_msg(&mut conn, 5, &behavior.bitfield).is_err() {
        return log;
    }
    if send_msg(&mut conn, 1, &[]).is_err() {
        return log;
    }

    let read_timeout = if behavior.hold_requests {
        // Short: a quiet period means the client's pipeline is full.
        Duration::from_millis(400)
    } else {
        Duration::from_secs(10)
    };
    conn.set_read_timeout(Some(read_timeout))
        .expect("fixture read timeout");

    let mut served_blocks = 0usize;
    let mut corrupted = false;
    let mut pending: Vec<(u32, u32, u32)> = vec![];

    loop {
        match read_frame(&mut conn) {
            // Keep-alive or non-request message.
            Ok(None) => continue,
            Ok(Some((index, begin, length))) => {
                log.request_lengths.push(length);

                if behavior.hold_requests {
                    pending.push((index, begin, length));
                    continue;
                }

                if !serve_block(
                    &mut conn,
                    &data,
                    piece_size,
                    (index, begin, length),
                    &behavior,
                    &mut corrupted,
                    &mut served_blocks,
                ) {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if !behavior.hold_requests {
                    break;
                }
                if pending.is_empty() {
                    continue;
                }

                log.max_burst = log.max_burst.max(pending.len());
                let batch: Vec<_> = pending.drain(..).collect();
                let mut closed = false;
                for request in batch {
                    if !serve_block(
                        &mut conn,
                        &data,
                        piece_size,
                        request,
                        &behavior,
                        &mut corrupted,
                        &mut served_blocks,
                    ) {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break;
                }
            }
            // Client hung up.
            Err(_) => break,
        }
    }

    log
}

fn shake_hands(conn: &mut TcpStream, info_hash: &Sha1Digest) -> bool {
    let mut incoming = [0u8; 68];
    if conn.read_exact(&mut incoming).is_err() {
        return false;
    }

    let mut reply = Vec::with_capacity(68);
    reply.push(19);
    reply.extend_from_slice(b"BitTorrent protocol");
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(info_hash);
    reply.extend_from_slice(b"-FX0001-scriptedpeer");

    conn.write_all(&reply).is_ok()
}

/// Read one frame; `Ok(Some(..))` only for `request` messages, everything
/// else (including keep-alives) collapses to `Ok(None)`.
fn read_frame(conn: &mut TcpStream) -> std::io::Result<Option<(u32, u32, u32)>> {
    let mut prefix = [0u8; 4];
    conn.read_exact(&mut prefix)?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Ok(None);
    }

    let mut body = vec![0u8; len];
    conn.read_exact(&mut body)?;

    if body[0] == 6 && body.len() == 13 {
        let index = u32::from_be_bytes(body[1..5].try_into().unwrap());
        let begin = u32::from_be_bytes(body[5..9].try_into().unwrap());
        let length = u32::from_be_bytes(body[9..13].try_into().unwrap());
        return Ok(Some((index, begin, length)));
    }

    Ok(None)
}

fn serve_block(
    conn: &mut TcpStream,
    data: &[u8],
    piece_size: u32,
    (index, begin, length): (u32, u32, u32),
    behavior: &PeerBehavior,
    corrupted: &mut bool,
    served_blocks: &mut usize,
) -> bool {
    let offset = index as usize * piece_size as usize + begin as usize;
    let mut block = data[offset..offset + length as usize].to_vec();

    if behavior.corrupt_once == Some(index) && !*corrupted {
        block[0] ^= 0xFF;
        *corrupted = true;
    }

    let mut payload = Vec::with_capacity(8 + block.len());
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&block);

    if send_msg(conn, 7, &payload).is_err() {
        return false;
    }

    *served_blocks += 1;
    if behavior.disconnect_after_blocks == Some(*served_blocks) {
        let _ = conn.shutdown(Shutdown::Both);
        return false;
    }

    true
}

fn send_msg(conn: &mut TcpStream, id: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    frame.push(id);
    frame.extend_from_slice(payload);

    conn.write_all(&frame)
}
