//! # Partner Supervisor
//!
//! One supervisor per remote peer. It keeps the peer's connection alive,
//! measures latency while it is up, and reports up/down edges so the peer
//! manager and UI layers can react.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionState};
use crate::peer::PeerId;
use crate::ping::PingChecker;

/// Period of the reconnection/latency loop.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartnerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

pub struct PartnerSupervisor {
    connection: Connection,
    events: mpsc::Sender<PartnerEvent>,
    latency_ms: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl PartnerSupervisor {
    pub fn new(
        connection: Connection,
        events: mpsc::Sender<PartnerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection,
            events,
            latency_ms: Arc::new(AtomicU32::new(u32::MAX)),
            cancel,
        }
    }

    /// Last measured round trip, `u32::MAX` until one succeeds.
    pub fn latency_ms(&self) -> u32 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Run the supervision loop until cancelled.
    pub fn spawn(&self) -> JoinHandle<()> {
        let connection = self.connection.clone();
        let events = self.events.clone();
        let latency = self.latency_ms.clone();
        let cancel = self.cancel.clone();
        let peer = connection.remote_id();

        tokio::spawn(async move {
            let mut checker = PingChecker::new(connection.clone());
            let mut was_up = false;
            let mut tick = tokio::time::interval(RECONNECT_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }

                if connection.state() != ConnectionState::Connected {
                    if was_up {
                        was_up = false;
                        latency.store(u32::MAX, Ordering::Relaxed);
                        info!(?peer, "partner link down");
                        let _ = events.send(PartnerEvent::Disconnected(peer)).await;
                    }
                    if connection.connect().await {
                        was_up = true;
                        info!(?peer, "partner link up");
                        let _ = events.send(PartnerEvent::Connected(peer)).await;
                    } else {
                        debug!(?peer, "partner connect attempt failed");
                    }
                } else {
                    let rtt = checker.check_ping().await;
                    if rtt != u32::MAX {
                        latency.store(rtt, Ordering::Relaxed);
                    }
                }
            }
            debug!(?peer, "partner supervisor stopped");
        })
    }
}
