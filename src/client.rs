//! # Peer Session
//!
//! One [`Client`] owns one TCP connection to one remote peer and drives
//! the wire protocol on it: handshake, the four choke/interest flags, the
//! remote bitfield, and the in-flight request counter that bounds
//! pipelining.
//!
//! A session is owned exclusively by its driver thread; nothing here is
//! synchronized. Receiving a message updates session state as a side
//! effect (`choke`/`unchoke`/`have`/`bitfield`), everything else is handed
//! back to the driver for piece assembly.

use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::handshake::{deserialize_handshake, Handshake, HANDSHAKE_LEN};
use crate::logger;
use crate::message::{
    deserialize_message, message_name, Bitfield, Message, MAX_MESSAGE_LEN, MESSAGE_BITFIELD,
    MESSAGE_CHOKE, MESSAGE_HAVE, MESSAGE_INTERESTED, MESSAGE_KEEPALIVE, MESSAGE_NOT_INTERESTED,
    MESSAGE_PIECE, MESSAGE_PORT, MESSAGE_REQUEST, MESSAGE_UNCHOKE,
};
use crate::peer::{client_peer_id, Peer};
use crate::torrent::Sha1Digest;

/// Outstanding requests allowed on one connection.
pub const MAX_BACKLOG: u32 = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Window for the whole post-connect phase: handshake exchange plus the
/// wait for the peer's bitfield.
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Client {
    peer: Peer,
    conn: TcpStream,
    total_pieces: u32,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    #[allow(dead_code)]
    peer_interested: bool,
    bitfield: Option<Bitfield>,
    backlog: u32,
}

impl Client {
    fn new(peer: Peer, conn: TcpStream, total_pieces: u32) -> Client {
        Client {
            peer,
            conn,
            total_pieces,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: None,
            backlog: 0,
        }
    }

    /// Dial a peer and bring the session to a usable state: TCP connect,
    /// handshake exchange, info-hash check, then read until the peer has
    /// presented a bitfield (a `have` counts, it implies one). The whole
    /// post-connect phase runs against one absolute 30 s deadline; a peer
    /// that stays silent, or keeps sending other messages without ever
    /// showing a bitfield, is discarded when it expires.
    pub fn connect(peer: Peer, info_hash: Sha1Digest, total_pieces: u32) -> Result<Client> {
        Client::connect_with_timeout(peer, info_hash, total_pieces, ESTABLISH_TIMEOUT)
    }

    /// [`Client::connect`] with a caller-chosen window for the
    /// handshake-and-bitfield phase.
    pub fn connect_with_timeout(
        peer: Peer,
        info_hash: Sha1Digest,
        total_pieces: u32,
        timeout: Duration,
    ) -> Result<Client> {
        let addr = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("could not connect to peer {peer}"))?;

        let mut client = Client::new(peer, conn, total_pieces);

        // One wall-clock cutoff for everything up to the bitfield.
        // Socket timeouts re-arm on every read, so each call below gets
        // only whatever remains of this deadline.
        let deadline = Instant::now() + timeout;
        client.exchange_handshake(info_hash, deadline)?;
        client.await_bitfield(deadline)?;

        info!("established session with peer {peer}");

        Ok(client)
    }

    fn exchange_handshake(&mut self, info_hash: Sha1Digest, deadline: Instant) -> Result<()> {
        let handshake = Handshake::new(info_hash, client_peer_id());
        self.arm_until(deadline)?;
        self.conn
            .write_all(&handshake.serialize())
            .with_context(|| format!("could not send handshake to peer {}", self.peer))?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        self.arm_until(deadline)?;
        self.conn
            .read_exact(&mut buf)
            .with_context(|| format!("could not read handshake from peer {}", self.peer))?;

        let reply = deserialize_handshake(&buf)?;
        if reply.info_hash != info_hash {
            return Err(anyhow!("peer {} is serving a different torrent", self.peer));
        }

        Ok(())
    }

    /// Read messages until the peer's bitfield is known. Choke state and
    /// `have` updates arriving first are absorbed on the way, but they do
    /// not extend the deadline.
    fn await_bitfield(&mut self, deadline: Instant) -> Result<()> {
        while self.bitfield.is_none() {
            self.arm_until(deadline)?;
            self.read_message()?;
        }

        Ok(())
    }

    /// Point the socket timeouts at whatever remains of an absolute
    /// deadline.
    fn arm_until(&self, deadline: Instant) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!(
                "peer {} did not become ready before its deadline",
                self.peer
            ));
        }

        self.set_deadline(remaining)
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    /// Outstanding requests on this connection.
    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn has_piece(&self, index: u32) -> bool {
        match &self.bitfield {
            Some(bitfield) => bitfield.has(index),
            None => false,
        }
    }

    /// Read and write deadline for everything that follows.
    pub fn set_deadline(&self, timeout: Duration) -> Result<()> {
        self.conn
            .set_read_timeout(Some(timeout))
            .context("could not set read timeout")?;
        self.conn
            .set_write_timeout(Some(timeout))
            .context("could not set write timeout")?;

        Ok(())
    }

    /// Read one framed message, applying its state side effects.
    pub fn read_message(&mut self) -> Result<Message> {
        let mut prefix = [0u8; 4];
        self.conn
            .read_exact(&mut prefix)
            .with_context(|| format!("could not read message length from peer {}", self.peer))?;

        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 {
            self.log_recv(MESSAGE_KEEPALIVE);
            return Ok(Message::keep_alive());
        }
        if len > MAX_MESSAGE_LEN {
            return Err(anyhow!(
                "peer {} sent an oversized frame of {len} bytes",
                self.peer
            ));
        }

        let mut body = vec![0u8; len];
        self.conn
            .read_exact(&mut body)
            .with_context(|| format!("could not read message body from peer {}", self.peer))?;

        let message = deserialize_message(&body)?;
        self.log_recv(message.id);
        self.absorb(&message)?;

        Ok(message)
    }

    /// State transitions on receive.
    fn absorb(&mut self, message: &Message) -> Result<()> {
        match message.id {
            MESSAGE_CHOKE => self.peer_choking = true,
            MESSAGE_UNCHOKE => self.peer_choking = false,
            MESSAGE_INTERESTED => self.peer_interested = true,
            MESSAGE_NOT_INTERESTED => self.peer_interested = false,
            MESSAGE_BITFIELD => {
                // Expected as the first message; a late one overwrites.
                self.bitfield = Some(Bitfield::from_payload(message.payload.clone()));
            }
            MESSAGE_HAVE => {
                if message.payload.len() != 4 {
                    return Err(anyhow!("peer {} sent a malformed have", self.peer));
                }
                let index = Cursor::new(&message.payload).read_u32::<BigEndian>()?;

                let total_pieces = self.total_pieces;
                self.bitfield
                    .get_or_insert_with(|| Bitfield::zeroed(total_pieces))
                    .set(index);
            }
            MESSAGE_PIECE => self.backlog = self.backlog.saturating_sub(1),
            MESSAGE_PORT => {} // no DHT
            MESSAGE_REQUEST => {} // leech only, nothing to serve
            other if other > MESSAGE_PORT => {
                debug!("peer {} sent unknown message id {other}", self.peer);
            }
            _ => {}
        }

        Ok(())
    }

    fn send_message(&mut self, message: &Message) -> Result<()> {
        let encoded = message.serialize()?;
        self.conn.write_all(&encoded).with_context(|| {
            format!(
                "could not send '{}' to peer {}",
                message_name(message.id),
                self.peer
            )
        })?;

        if logger::log_sent_messages() {
            debug!("sent '{}' to peer {}", message_name(message.id), self.peer);
        }

        Ok(())
    }

    fn log_recv(&self, id: u8) {
        if logger::log_recv_messages() {
            debug!("received '{}' from peer {}", message_name(id), self.peer);
        }
    }

    pub fn send_unchoke(&mut self) -> Result<()> {
        self.send_message(&Message::new(MESSAGE_UNCHOKE))?;
        self.am_choking = false;

        Ok(())
    }

    pub fn send_interested(&mut self) -> Result<()> {
        self.send_message(&Message::new(MESSAGE_INTERESTED))?;
        self.am_interested = true;

        Ok(())
    }

    pub fn send_keep_alive(&mut self) -> Result<()> {
        self.send_message(&Message::keep_alive())
    }

    /// Request `length` bytes of piece `index` starting at `begin`, and
    /// count it against the backlog.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let mut payload: Vec<u8> = Vec::with_capacity(12);
        payload.write_u32::<BigEndian>(index)?;
        payload.write_u32::<BigEndian>(begin)?;
        payload.write_u32::<BigEndian>(length)?;

        self.send_message(&Message::with_payload(MESSAGE_REQUEST, payload))?;
        self.backlog += 1;

        Ok(())
    }
}
