//! # Framed Link Sessions
//!
//! A session is one reliable TCP byte stream carrying length-prefixed
//! bincode frames of [`WireMessage`]. Both direct peer links and pooled
//! relay links sit on top of the same session type.
//!
//! ## Architecture
//!
//! Each session is split into two tasks:
//! - a writer task draining an outbound channel onto the socket
//! - a reader task decoding frames into an inbound channel
//!
//! The public [`SessionHandle`] is cheap to clone. Every session gets a
//! process-unique id; the router uses it to tell which session a flooded
//! packet arrived on (split horizon).
//!
//! ## Framing
//!
//! `u32` little-endian length followed by that many bytes of bincode. Reads
//! are bounded by [`MAX_FRAME_SIZE`] before any allocation happens.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::messages::{decode_bounded, encode, WireMessage, MAX_FRAME_SIZE};

/// Outbound queue depth per session. Senders back off when the socket
/// cannot drain.
const OUTBOUND_CAPACITY: usize = 256;

/// Inbound queue depth per session.
const INBOUND_CAPACITY: usize = 256;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a live framed session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    remote: SocketAddr,
    outbound: mpsc::Sender<WireMessage>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    /// Dial `addr` and spawn the session tasks.
    pub async fn connect(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<WireMessage>)> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect session to {addr}"))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established stream (accepted, or produced by the
    /// NAT traversal collaborator) in a session.
    pub fn from_stream(stream: TcpStream) -> (Self, mpsc::Receiver<WireMessage>) {
        let remote = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let closed = Arc::new(AtomicBool::new(false));

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WireMessage>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<WireMessage>(INBOUND_CAPACITY);

        let (mut read_half, mut write_half) = stream.into_split();

        // Writer: drain the outbound queue until it closes or the socket dies.
        {
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    let bytes = match encode(&message) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(session = id, error = %e, "failed to encode frame");
                            continue;
                        }
                    };
                    if bytes.len() > MAX_FRAME_SIZE {
                        warn!(session = id, len = bytes.len(), "dropping oversized frame");
                        continue;
                    }
                    let len = (bytes.len() as u32).to_le_bytes();
                    if write_half.write_all(&len).await.is_err()
                        || write_half.write_all(&bytes).await.is_err()
                    {
                        debug!(session = id, "session write failed, closing");
                        break;
                    }
                }
                closed.store(true, Ordering::Relaxed);
                let _ = write_half.shutdown().await;
            });
        }

        // Reader: decode frames until EOF, error, or the consumer goes away.
        {
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let mut len_buf = [0u8; 4];
                    if read_half.read_exact(&mut len_buf).await.is_err() {
                        break;
                    }
                    let len = u32::from_le_bytes(len_buf) as usize;
                    if len > MAX_FRAME_SIZE {
                        warn!(session = id, len, "peer sent oversized frame, closing");
                        break;
                    }
                    let mut frame = vec![0u8; len];
                    if read_half.read_exact(&mut frame).await.is_err() {
                        break;
                    }
                    match decode_bounded::<WireMessage>(&frame) {
                        Ok(message) => {
                            trace!(session = id, "frame received");
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // A corrupt frame desynchronizes nothing (frames are
                            // length-delimited), so drop it and keep reading.
                            warn!(session = id, error = %e, "undecodable frame dropped");
                        }
                    }
                }
                closed.store(true, Ordering::Relaxed);
                debug!(session = id, "session reader finished");
            });
        }

        let handle = Self {
            id,
            remote,
            outbound: outbound_tx,
            closed,
        };
        (handle, inbound_rx)
    }

    /// Process-unique session identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Queue a message for transmission.
    pub async fn send(&self, message: WireMessage) -> Result<()> {
        if self.is_closed() {
            bail!("session {} to {} is closed", self.id, self.remote);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("session {} writer gone", self.id))
    }

    /// Close the session by detaching the writer. The reader side notices on
    /// the next socket event; liveness checks see `is_closed` immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}
