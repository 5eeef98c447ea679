//! End-to-end orchestrator scenarios: two full `Orchestrator::run` tasks
//! wired over `tokio::io::duplex` instead of real sockets, driven by a
//! paused clock. Unlike the per-module unit tests, these exercise the
//! actual management wire protocol between a GS and a drone side.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use wfb_common::config::{ConfigWriter, OrchestratorConfig};
use wfb_common::measurement::{Measurement, StreamId};
use wfb_common::protocol::LinkStateName;
use wfb_peer::heartbeat::LocalView;
use wfb_peer::management::{Framing, InboundRequest, ManagementConnection};
use wfb_peer::orchestrator::{IncomingConnection, Orchestrator, Role};

struct NullWriter;
impl ConfigWriter for NullWriter {
    fn persist(&self, _toml_text: &str) -> std::io::Result<()> {
        Ok(())
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig::from_toml_str(
        "[common]\nwifi_channel = 149\nfreq_sel_enabled = true\nfreq_sel_channels = [157, 161, 165]\n",
    )
    .unwrap()
}

fn local_view() -> LocalView {
    LocalView { rssi: 0, per: 0, snr: 0, score: None }
}

/// Everything a test needs to drive and observe one running orchestrator,
/// wired the way `main.rs` wires a real `wfb-peer` process.
struct Peer {
    measurement_tx: mpsc::Sender<Measurement>,
    inbound_tx: mpsc::Sender<InboundRequest>,
    conn_tx: mpsc::Sender<IncomingConnection>,
    status_rx: watch::Receiver<LinkStateName>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Peer {
    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

fn spawn_peer(role: Role) -> Peer {
    let (measurement_tx, measurement_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (conn_tx, conn_rx) = mpsc::channel(8);
    let (status_tx, status_rx) = watch::channel(LinkStateName::Waiting);
    let (view_tx, _view_rx) = watch::channel(local_view());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Orchestrator::new(
        role,
        config(),
        Arc::new(NullWriter),
        vec!["wlan0".into()],
        tokio::time::Instant::now(),
    );
    let handle = tokio::spawn(orchestrator.run(
        measurement_rx,
        inbound_rx,
        conn_rx,
        status_tx,
        view_tx,
        shutdown_rx,
    ));

    Peer { measurement_tx, inbound_tx, conn_tx, status_rx, shutdown_tx, handle }
}

/// Connects `a` and `b` over one `tokio::io::duplex` pair, each side
/// reporting inbound commands to its own peer's `inbound_tx` (a command
/// that arrives on `a`'s socket is addressed to `a`, not to whoever sent
/// it).
async fn connect(a: &Peer, a_is_outbound: bool, b: &Peer, b_is_outbound: bool) {
    let (a_side, b_side) = tokio::io::duplex(8192);
    let (conn_a, _read_a) = ManagementConnection::spawn(a_side, Framing::Bare, a.inbound_tx.clone());
    let (conn_b, _read_b) = ManagementConnection::spawn(b_side, Framing::Bare, b.inbound_tx.clone());
    a.conn_tx
        .send(IncomingConnection { conn: conn_a, is_outbound: a_is_outbound })
        .await
        .unwrap();
    b.conn_tx
        .send(IncomingConnection { conn: conn_b, is_outbound: b_is_outbound })
        .await
        .unwrap();
}

async fn advance_with_traffic(peers: &[&Peer], seconds: u32) {
    for _ in 0..seconds {
        tokio::time::advance(Duration::from_secs(1)).await;
        for peer in peers {
            let _ = peer
                .measurement_tx
                .send(Measurement::new(StreamId::Video, 10, 0, -50, 30))
                .await;
        }
        tokio::task::yield_now().await;
    }
}

// ─── Scenario A: cold start via the Init handshake ───────────────────────

#[tokio::test(start_paused = true)]
async fn init_handshake_establishes_link_on_both_peers() {
    let gs = spawn_peer(Role::Gs);
    let drone = spawn_peer(Role::Drone);
    connect(&gs, true, &drone, false).await;

    // Cold start needs both the 5s waiting-window timer and a 2s stable
    // traffic window (wfb_link::state's COLD_START_MIN_WAITING/
    // COLD_START_MIN_TRAFFIC) to elapse; the GS's INIT_RETRY_INTERVAL
    // fires every 3s, so 8s covers at least two init attempts as well.
    advance_with_traffic(&[&gs, &drone], 8).await;

    let mut gs_status = gs.status_rx.clone();
    let mut drone_status = drone.status_rx.clone();
    assert_eq!(*gs_status.borrow_and_update(), LinkStateName::Connected);
    assert_eq!(*drone_status.borrow_and_update(), LinkStateName::Connected);

    gs.shutdown().await;
    drone.shutdown().await;
}

// ─── Scenario E: GS fallback routing ─────────────────────────────────────

/// When the GS's own outbound dial hasn't connected yet but the drone
/// dialed in first, the GS must still drive the link over the inbound
/// direction (spec.md §4.5's fallback routing) rather than wait for an
/// outbound leg that may never arrive.
#[tokio::test(start_paused = true)]
async fn gs_drives_init_over_inbound_only_connection() {
    let gs = spawn_peer(Role::Gs);
    let drone = spawn_peer(Role::Drone);
    // The drone "dialed in": its connection is outbound from the drone's
    // perspective, and therefore inbound from the GS's.
    connect(&gs, false, &drone, true).await;

    advance_with_traffic(&[&gs, &drone], 8).await;

    let mut gs_status = gs.status_rx.clone();
    let mut drone_status = drone.status_rx.clone();
    assert_eq!(
        *gs_status.borrow_and_update(),
        LinkStateName::Connected,
        "GS must treat the inbound-only connection as active"
    );
    assert_eq!(*drone_status.borrow_and_update(), LinkStateName::Connected);

    gs.shutdown().await;
    drone.shutdown().await;
}

// ─── Scenario C: packet loss drives lost -> recovery ─────────────────────

#[tokio::test(start_paused = true)]
async fn silence_after_connect_reaches_lost_then_recovery() {
    let gs = spawn_peer(Role::Gs);
    let drone = spawn_peer(Role::Drone);
    connect(&gs, true, &drone, false).await;

    advance_with_traffic(&[&gs, &drone], 8).await;
    let mut gs_status = gs.status_rx.clone();
    assert_eq!(*gs_status.borrow_and_update(), LinkStateName::Connected);

    // Stop sending measurements on the GS side only; after PACKET_TIMEOUT
    // (5s) it falls to lost, and after LOST_TO_RECOVERY_TIMEOUT (10s more)
    // to recovery, while the drone (still fed) stays connected.
    for _ in 0..16 {
        tokio::time::advance(Duration::from_secs(1)).await;
        let _ = drone
            .measurement_tx
            .send(Measurement::new(StreamId::Video, 10, 0, -50, 30))
            .await;
        tokio::task::yield_now().await;
    }

    assert_eq!(*gs_status.borrow_and_update(), LinkStateName::Recovery);

    gs.shutdown().await;
    drone.shutdown().await;
}
