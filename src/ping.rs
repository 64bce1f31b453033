//! Round-trip probing over a connection.
//!
//! A [`PingChecker`] serves one in-flight probe at a time; callers that
//! need concurrency hold one checker per link. Probe and response ride the
//! connection's reliable stream, so a measured round trip includes window
//! overhead, which is exactly the latency the router should be costing.

use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::trace;

use crate::connection::Connection;
use crate::messages::OverlayMessage;

/// Deadline after which a probe counts as lost.
pub const PING_DEADLINE: Duration = Duration::from_secs(5);

pub struct PingChecker {
    connection: Connection,
}

impl PingChecker {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Measure one round trip in milliseconds. Returns `u32::MAX` when the
    /// probe times out or the link cannot carry it.
    pub async fn check_ping(&mut self) -> u32 {
        let seq = self.connection.next_probe_seq();
        let pong = self.connection.register_pong(seq);
        let started = Instant::now();

        if self.connection.send(OverlayMessage::Ping { seq }).await.is_err() {
            self.connection.cancel_pong(seq);
            return u32::MAX;
        }

        match timeout(PING_DEADLINE, pong).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed().as_millis().min(u64::from(u32::MAX - 1) as u128);
                let ms = elapsed as u32;
                trace!(peer = ?self.connection.remote_id(), rtt_ms = ms, "ping answered");
                self.connection.record_rtt(ms.max(1));
                ms
            }
            _ => {
                self.connection.cancel_pong(seq);
                trace!(peer = ?self.connection.remote_id(), "ping timed out");
                u32::MAX
            }
        }
    }
}
