//! `wfb-peer` — the ground-station/drone control-plane daemon (spec.md §6
//! "Exit codes / CLI"): a single long-running process per role that wires
//! `MetricsIngest` → `{ChannelMetrics, StateMachine}`, the dual-TCP
//! `ManagementPeer`, the UDP `HeartbeatPeer`, and the `Orchestrator` loop
//! together, then runs until SIGTERM.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wfb_common::config::{AtomicFileConfigWriter, ConfigWriter, OrchestratorConfig};

use wfb_peer::heartbeat::{self, LocalView};
use wfb_peer::ingest;
use wfb_peer::management::{self, Framing, ManagementConnection};
use wfb_peer::orchestrator::{IncomingConnection, Orchestrator, Role as OrchRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliRole {
    Gs,
    Drone,
}

impl From<CliRole> for OrchRole {
    fn from(r: CliRole) -> Self {
        match r {
            CliRole::Gs => OrchRole::Gs,
            CliRole::Drone => OrchRole::Drone,
        }
    }
}

/// Ground-station/drone control-plane daemon.
#[derive(Parser, Debug)]
#[command(name = "wfb-peer", about = "wfb control-plane peer (frequency/power/link-state coordination)")]
struct Cli {
    /// Which side of the link this process is.
    #[arg(long, value_enum)]
    role: CliRole,

    /// Path to the TOML configuration file (spec.md §6's fixed config keys).
    #[arg(long, default_value = "/etc/wfb.toml")]
    config: std::path::PathBuf,

    /// Wi-Fi interface to retune on every hop. Repeat for multiple
    /// interfaces (spec.md §6: "every managed interface in `wlans`").
    #[arg(long = "wlan", required = true)]
    wlans: Vec<String>,

    /// Override RUST_LOG/the default "info" tracing filter.
    #[arg(long)]
    log_filter: Option<String>,
}

const OUTBOUND_RECONNECT_CAP: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = match &cli.log_filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let role: OrchRole = cli.role.into();

    // ConfigurationError policy (spec.md §7): fail fast at startup on a
    // missing/malformed config file rather than limping along with
    // defaults for a real deployment.
    let config = OrchestratorConfig::from_toml_path(&cli.config).map_err(|e| {
        anyhow::anyhow!("failed to load configuration from {}: {e}", cli.config.display())
    })?;

    info!(?role, config = ?cli.config, wlans = ?cli.wlans, "wfb-peer starting");

    let stats_port = match role {
        OrchRole::Gs => config.gs_stats_port,
        OrchRole::Drone => config.drone_stats_port,
    };
    let management_listen_port = match role {
        OrchRole::Gs => config.network.gs_management_port,
        OrchRole::Drone => config.network.drone_management_port,
    };
    let (peer_ip, peer_management_port): (String, u16) = match role {
        OrchRole::Gs => (config.network.drone_ip.clone(), config.network.drone_management_port),
        OrchRole::Drone => (config.network.gs_ip.clone(), config.network.gs_management_port),
    };
    let (heartbeat_local_port, heartbeat_peer_port) = match role {
        OrchRole::Gs => (config.network.gs_heartbeat_port, config.network.drone_heartbeat_port),
        OrchRole::Drone => (config.network.drone_heartbeat_port, config.network.gs_heartbeat_port),
    };
    let peer_ip_addr: IpAddr = peer_ip
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid peer IP {peer_ip:?}: {e}"))?;
    let peer_management_addr = SocketAddr::new(peer_ip_addr, peer_management_port);
    let heartbeat_peer_addr = SocketAddr::new(peer_ip_addr, heartbeat_peer_port);
    let heartbeat_local_addr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), heartbeat_local_port);
    let heartbeat_mirror_received: SocketAddr =
        SocketAddr::new(IpAddr::from([127, 0, 0, 1]), config.network.heartbeat_stats_received_port);
    let heartbeat_mirror_sent: SocketAddr =
        SocketAddr::new(IpAddr::from([127, 0, 0, 1]), config.network.heartbeat_stats_sent_port);

    let config_path = cli.config.clone();
    let config_writer: Arc<dyn ConfigWriter> = Arc::new(AtomicFileConfigWriter { path: config_path });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (measurement_tx, measurement_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (conn_tx, conn_rx) = mpsc::channel(8);
    let (status_tx, status_rx) = watch::channel(wfb_common::protocol::LinkStateName::Waiting);
    let (view_tx, view_rx) = watch::channel(LocalView {
        rssi: 0,
        per: 0,
        snr: 0,
        score: None,
    });

    let ingest_handle = tokio::spawn(ingest::run(stats_port, measurement_tx, shutdown_rx.clone()));

    let listener_handle = tokio::spawn(run_inbound_listener(
        management_listen_port,
        inbound_tx.clone(),
        conn_tx.clone(),
        shutdown_rx.clone(),
    ));

    let dialer_handle = tokio::spawn(run_outbound_dialer(
        peer_management_addr,
        inbound_tx.clone(),
        conn_tx.clone(),
        shutdown_rx.clone(),
    ));

    let heartbeat_channel = config.wifi_channel;
    let heartbeat_handle = tokio::spawn(async move {
        if let Err(e) = heartbeat::run(
            heartbeat_local_addr,
            heartbeat_peer_addr,
            heartbeat_mirror_received,
            heartbeat_mirror_sent,
            heartbeat_channel,
            status_rx,
            view_rx,
            shutdown_rx.clone(),
        )
        .await
        {
            error!(error = %e, "heartbeat task failed");
        }
    });

    let orchestrator = Orchestrator::new(role, config, config_writer, cli.wlans, tokio::time::Instant::now());
    let orchestrator_handle = tokio::spawn(orchestrator.run(
        measurement_rx,
        inbound_rx,
        conn_rx,
        status_tx,
        view_tx,
        shutdown_rx.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM");
        }
    }
    let _ = shutdown_tx.send(true);

    let _ = orchestrator_handle.await;
    ingest_handle.abort();
    listener_handle.abort();
    dialer_handle.abort();
    heartbeat_handle.abort();

    info!("wfb-peer stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}

/// Inbound server: accept connections on the reciprocal well-known port
/// (spec.md §4.5: "exactly one peer"). A second simultaneous inbound
/// connection is accepted and spawned all the same; the orchestrator's
/// "outbound always wins, else first inbound" routing keeps exactly one
/// direction active without the listener itself needing to enforce it.
async fn run_inbound_listener(
    port: u16,
    inbound_tx: mpsc::Sender<management::InboundRequest>,
    conn_tx: mpsc::Sender<IncomingConnection>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, port, "failed to bind management listen socket");
            return;
        }
    };
    info!(port, "management server listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        info!(%peer_addr, "accepted inbound management connection");
                        let framing = Framing::for_peer(peer_addr.ip());
                        let (conn, _handle) =
                            ManagementConnection::spawn_tcp(stream, framing, inbound_tx.clone());
                        if conn_tx
                            .send(IncomingConnection { conn, is_outbound: false })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "management accept error"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Outbound client: dial the peer's well-known control port, reconnecting
/// with zero initial delay and a 1s backoff cap (spec.md §4.5/§6) whenever
/// the connection drops.
async fn run_outbound_dialer(
    peer_addr: SocketAddr,
    inbound_tx: mpsc::Sender<management::InboundRequest>,
    conn_tx: mpsc::Sender<IncomingConnection>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::ZERO;
    loop {
        if *shutdown.borrow() {
            return;
        }
        if backoff > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
        match TcpStream::connect(peer_addr).await {
            Ok(stream) => {
                info!(%peer_addr, "connected outbound management socket");
                backoff = Duration::ZERO;
                let framing = Framing::for_peer(peer_addr.ip());
                let (conn, handle) = ManagementConnection::spawn_tcp(stream, framing, inbound_tx.clone());
                if conn_tx
                    .send(IncomingConnection { conn, is_outbound: true })
                    .await
                    .is_err()
                {
                    return;
                }
                // Block here until the connection's reader task exits
                // (peer closed / error), then fall through to reconnect.
                let _ = handle.await;
                warn!(%peer_addr, "outbound management connection closed, reconnecting");
            }
            Err(e) => {
                warn!(error = %e, %peer_addr, "outbound management dial failed");
                backoff = (backoff + Duration::from_millis(200)).min(OUTBOUND_RECONNECT_CAP);
                continue;
            }
        }
        backoff = (backoff + Duration::from_millis(200)).min(OUTBOUND_RECONNECT_CAP);
    }
}
