//! `HeartbeatPeer` — 1Hz UDP heartbeat exchange, independent of TCP state
//! (spec.md §4.6). Each side mirrors the last `local` view it received from
//! the other into its own `remote` field, and separately mirrors both
//! directions onto local loopback ports for TUI consumption (spec.md §6).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};
use wfb_common::protocol::{HeartbeatKind, HeartbeatPayload, HeartbeatView, LinkStateName};

/// What the orchestrator hands the heartbeat task each tick to build the
/// outgoing payload — a snapshot, not a live borrow, since the heartbeat
/// task runs independently of the orchestrator's own loop (spec.md §4.6:
/// "Heartbeats are not used for state transitions in the core").
#[derive(Debug, Clone, Copy)]
pub struct LocalView {
    pub rssi: i32,
    pub per: u32,
    pub snr: i32,
    pub score: Option<f64>,
}

fn now_wallclock_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Run the heartbeat loop: bind `local_addr`, send to `peer_addr` at 1Hz,
/// receive from the peer and mirror its `local` into our outgoing
/// `remote`, and fan both directions out to the loopback mirror ports.
pub async fn run(
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    mirror_received_addr: SocketAddr,
    mirror_sent_addr: SocketAddr,
    channel: u32,
    mut status_rx: watch::Receiver<LinkStateName>,
    mut view_rx: watch::Receiver<LocalView>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(local_addr).await?;
    let mirror_received = UdpSocket::bind("127.0.0.1:0").await?;
    let mirror_sent = UdpSocket::bind("127.0.0.1:0").await?;

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut remote: Option<HeartbeatView> = None;
    let mut recv_buf = [0u8; 2048];

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let view = *view_rx.borrow();
                let status = *status_rx.borrow();
                let local = HeartbeatView {
                    timestamp: now_wallclock_secs(),
                    rssi: view.rssi,
                    per: view.per,
                    snr: view.snr,
                };
                let payload = HeartbeatPayload {
                    kind: HeartbeatKind::Heartbeat,
                    timestamp: local.timestamp,
                    status,
                    channel,
                    local,
                    remote,
                    score: view.score,
                };
                if let Ok(json) = serde_json::to_vec(&payload) {
                    if let Err(e) = socket.send_to(&json, peer_addr).await {
                        warn!(error = %e, %peer_addr, "heartbeat send failed");
                    }
                    let _ = mirror_sent.send_to(&json, mirror_sent_addr).await;
                }
            }
            result = socket.recv_from(&mut recv_buf) => {
                match result {
                    Ok((len, from)) => {
                        match serde_json::from_slice::<HeartbeatPayload>(&recv_buf[..len]) {
                            Ok(incoming) => {
                                remote = Some(incoming.local);
                                let _ = mirror_received.send_to(&recv_buf[..len], mirror_received_addr).await;
                            }
                            Err(e) => debug!(error = %e, %from, "malformed heartbeat datagram"),
                        }
                    }
                    Err(e) => warn!(error = %e, "heartbeat recv error"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}
