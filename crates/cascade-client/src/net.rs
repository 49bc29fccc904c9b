//! Single-threaded network reactor support: per-peer connections,
//! length-prefixed framing, and the timer wheel.
//!
//! The [`Network`] owns every socket and every timer; protocol components
//! never hold I/O state. Inbound connections feed complete frames into
//! one mpsc channel drained by the reactor loop; outbound connections are
//! write-only, one per peer identity, opened on demand through the PKI.
//!
//! Framing is a `u32` big-endian length prefix followed by an encoded
//! `DdsMessage`. Partial reads are handled by `read_exact`; a frame is
//! only surfaced once fully received.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use cascade_proto::wire::WireEncode;
use cascade_proto::{DdsMessage, Identity};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task;
use tokio::time::Instant;

use crate::pki;

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Opaque handle for a registered timeout.
pub type TimerId = u64;

/// Timer wheel keyed by an opaque id.
///
/// The heap may contain entries for unregistered timers; they are skipped
/// when popped. Unregistering is idempotent and guarantees the timer will
/// not fire afterwards, because firing consults the active map.
pub struct TimerWheel<K> {
    next_id: TimerId,
    deadlines: BinaryHeap<Reverse<(Instant, TimerId)>>,
    active: HashMap<TimerId, K>,
}

impl<K> TimerWheel<K> {
    /// Empty wheel.
    pub fn new() -> Self {
        Self { next_id: 0, deadlines: BinaryHeap::new(), active: HashMap::new() }
    }

    /// Register a timeout `delay` from now.
    pub fn register(&mut self, delay: Duration, key: K) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.deadlines.push(Reverse((Instant::now() + delay, id)));
        self.active.insert(id, key);
        id
    }

    /// Unregister a timeout. Idempotent; after this returns the callback
    /// will not fire.
    pub fn unregister(&mut self, id: TimerId) {
        self.active.remove(&id);
    }

    /// Earliest pending deadline, skipping stale heap entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if self.active.contains_key(&id) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Pop every timer due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerId, K)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(key) = self.active.remove(&id) {
                due.push((id, key));
            }
        }
        due
    }
}

impl<K> Default for TimerWheel<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a frame with its length prefix.
pub fn encode_frame(message: &DdsMessage) -> Vec<u8> {
    let body = message.encode_to_bytes();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Accept inbound connections forever, spawning one reader task per
/// connection. Each fully received frame body is pushed into `frames`.
pub fn spawn_listener(listener: TcpListener, frames: UnboundedSender<Bytes>) {
    task::spawn_local(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "inbound connection");
                    let frames = frames.clone();
                    task::spawn_local(async move {
                        if let Err(error) = read_frames(stream, frames).await {
                            tracing::debug!(%peer, %error, "inbound connection closed");
                        }
                    });
                },
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                },
            }
        }
    });
}

async fn read_frames(mut stream: TcpStream, frames: UnboundedSender<Bytes>) -> std::io::Result<()> {
    loop {
        let len = stream.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;
        if frames.send(Bytes::from(body)).is_err() {
            return Ok(()); // reactor gone, shut down quietly
        }
    }
}

/// Outbound connections and timers, owned by the reactor.
pub struct Network {
    pki_host: String,
    outbound: HashMap<Identity, OwnedWriteHalf>,
}

impl Network {
    /// Create a network using `pki_host` for address resolution.
    pub fn new(pki_host: String) -> Self {
        Self { pki_host, outbound: HashMap::new() }
    }

    /// Open a connection to `id` unless one exists. Resolution failures
    /// are fatal to this operation only.
    pub async fn connect(&mut self, id: &Identity) -> Result<(), pki::PkiError> {
        if self.outbound.contains_key(id) {
            return Ok(());
        }

        let name = id.to_string();
        let addr = pki::query_addr(&self.pki_host, &name).await?;
        let stream = TcpStream::connect(addr).await?;
        let (_, write_half) = stream.into_split();
        tracing::debug!(peer = %id, %addr, "outbound connection");
        self.outbound.insert(id.clone(), write_half);
        Ok(())
    }

    /// Drop the connection to `id`, if any.
    pub fn disconnect(&mut self, id: &Identity) {
        if self.outbound.remove(id).is_some() {
            tracing::debug!(peer = %id, "disconnected");
        }
    }

    /// Send to `id`, connecting on demand.
    pub async fn send(&mut self, id: &Identity, message: &DdsMessage) {
        if let Err(error) = self.connect(id).await {
            tracing::warn!(peer = %id, %error, "cannot reach peer");
            return;
        }
        self.write_to(id, &encode_frame(message)).await;
    }

    /// Send to every connected peer.
    pub async fn broadcast(&mut self, message: &DdsMessage) {
        let frame = encode_frame(message);
        let peers: Vec<Identity> = self.outbound.keys().cloned().collect();
        for id in peers {
            self.write_to(&id, &frame).await;
        }
    }

    /// Send to the listed peers that are currently connected.
    pub async fn send_many(&mut self, ids: &[Identity], message: &DdsMessage) {
        let frame = encode_frame(message);
        for id in ids {
            if self.outbound.contains_key(id) {
                self.write_to(id, &frame).await;
            }
        }
    }

    async fn write_to(&mut self, id: &Identity, frame: &[u8]) {
        let Some(stream) = self.outbound.get_mut(id) else {
            return;
        };
        if let Err(error) = stream.write_all(frame).await {
            tracing::warn!(peer = %id, %error, "write failed, dropping connection");
            self.outbound.remove(id);
        }
    }
}
