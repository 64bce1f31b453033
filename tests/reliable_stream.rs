//! Integration test for the reliable windowed stream under ACK loss.
//!
//! A lossy middlebox sits between the two endpoints and silently drops
//! every 7th acknowledgement. Retransmission must recover every gap, the
//! receiver must observe each message exactly once and in order, and the
//! sender's window must fully drain.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test reliable_stream -- --nocapture

use std::net::SocketAddr;
use std::sync::Once;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use overlan::{
    decode_bounded, Connection, ConnectionState, DatagramFlags, MessageKind, OverlayMessage,
    P2PPacket, PeerId, SessionHandle, WireMessage,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn progress(start: Instant, msg: &str) {
    eprintln!("[{:>6.2}s] {}", start.elapsed().as_secs_f64(), msg);
}

fn peer_id(seed: u8) -> PeerId {
    let mut bytes = [0u8; 16];
    bytes[15] = seed;
    PeerId::from_bytes(bytes)
}

/// Forwards one connection to `target`. Frames travelling back from the
/// target are parsed, and every `drop_nth` ACK datagram is discarded.
async fn spawn_lossy_middlebox(target: SocketAddr, drop_nth: u64) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((from_client, _)) = listener.accept().await else { return };
        let Ok(to_target) = TcpStream::connect(target).await else { return };
        let (mut client_read, mut client_write) = from_client.into_split();
        let (mut target_read, mut target_write) = to_target.into_split();

        // Client → target: verbatim.
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut client_read, &mut target_write).await;
        });

        // Target → client: parse frames, drop every Nth ACK.
        tokio::spawn(async move {
            let mut acks_seen = 0u64;
            loop {
                let mut len_buf = [0u8; 4];
                if target_read.read_exact(&mut len_buf).await.is_err() {
                    break;
                }
                let len = u32::from_le_bytes(len_buf) as usize;
                let mut frame = vec![0u8; len];
                if target_read.read_exact(&mut frame).await.is_err() {
                    break;
                }

                let drop_frame = match decode_bounded::<WireMessage>(&frame) {
                    Ok(WireMessage::Datagram(d)) if d.flags.contains(DatagramFlags::ACK) => {
                        acks_seen += 1;
                        acks_seen % drop_nth == 0
                    }
                    _ => false,
                };
                if drop_frame {
                    continue;
                }
                if client_write.write_all(&len_buf).await.is_err()
                    || client_write.write_all(&frame).await.is_err()
                {
                    break;
                }
            }
        });
    });

    addr
}

#[tokio::test]
async fn stream_survives_dropped_acks() {
    init_tracing();
    let start = Instant::now();
    const TOTAL: usize = 2000;
    const SIZE: usize = 64;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let receiver_addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        SessionHandle::from_stream(stream)
    });

    let middlebox = spawn_lossy_middlebox(receiver_addr, 7).await;
    let (sender_session, sender_rx) = SessionHandle::connect(middlebox).await.unwrap();
    let (receiver_session, receiver_rx) = accept.await.unwrap();

    let sender = Connection::direct(peer_id(1), peer_id(2), sender_session, sender_rx);
    let receiver = Connection::direct(peer_id(2), peer_id(1), receiver_session, receiver_rx);
    assert!(sender.connect().await, "handshake through middlebox failed");
    assert_eq!(receiver.state(), ConnectionState::Connected);
    progress(start, "connected through lossy middlebox");

    let (tx, mut rx) = Connection::handler_channel();
    receiver.register_handler(MessageKind::P2P, tx);

    let producer = {
        let sender = sender.clone();
        tokio::spawn(async move {
            for i in 0..TOTAL {
                let mut payload = vec![0u8; SIZE];
                payload[..4].copy_from_slice(&(i as u32).to_le_bytes());
                let packet = P2PPacket::new(peer_id(1), peer_id(2), payload);
                sender.send(OverlayMessage::P2P(packet)).await.unwrap();
            }
        })
    };

    let mut received = 0usize;
    while received < TOTAL {
        let inbound = timeout(Duration::from_secs(120), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("stalled after {received} messages"))
            .expect("handler channel closed");
        match inbound.message {
            OverlayMessage::P2P(packet) => {
                let idx = u32::from_le_bytes(packet.payload[..4].try_into().unwrap()) as usize;
                assert_eq!(idx, received, "out-of-order delivery");
                assert_eq!(packet.payload.len(), SIZE);
                received += 1;
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
    producer.await.unwrap();
    progress(start, "all messages received in order");

    // Retransmits must eventually close every ACK gap.
    timeout(Duration::from_secs(60), async {
        loop {
            let (ack, send) = sender.window_pointers();
            if ack == send {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("sender window never drained");
    assert_eq!(sender.in_flight(), 0);
    progress(start, "window fully acknowledged");

    // No second copy of anything may surface afterwards.
    assert!(
        timeout(Duration::from_millis(500), rx.recv()).await.is_err(),
        "late duplicate dispatched"
    );
}
