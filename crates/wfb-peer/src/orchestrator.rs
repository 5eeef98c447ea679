//! `Orchestrator` — per-peer composition (spec.md §2/§5/§9): a single owned
//! state machine, channel set, hop controller, and (drone-only) power
//! policy, driven from one `tokio::select!` loop. Every external event —
//! a `Measurement`, an inbound management command, a freshly (re)connected
//! management socket, the 1Hz tick, shutdown — arrives as a message and is
//! handled to completion before the next is dequeued, so no two callbacks
//! on this peer ever interleave (spec.md §5's "callbacks on the same peer
//! never run concurrently").
//!
//! Requests this peer sends to the other side and must await a reply for
//! (the GS's `init` retry, the GS's reactive/planned `freq_sel_hop`, the
//! drone's one-shot config sync) are spawned as background tasks that
//! report back over `signal_rx` rather than being awaited inline — inline
//! awaits here would stall every other event source for the life of the
//! round trip, which is exactly what the single-loop model forbids.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use wfb_common::config::{ConfigWriter, OrchestratorConfig};
use wfb_common::measurement::Measurement;
use wfb_common::protocol::{Command, LinkStateName, Response, TxPowerAction};
use wfb_link::{
    ChannelIdx, ChannelSet, HopController, HopTrigger, IwRadioCommand, LinkStateMachine,
    PowerPolicy, RadioTuner, StateEvent,
};

use crate::heartbeat::LocalView;
use crate::management::{InboundRequest, ManagementConnection, ManagementError};

pub type Instant = tokio::time::Instant;

/// GS drives the hop triggers and the config-sync responder side; drone
/// drives the power policy and is the config-sync requester (spec.md §4.7,
/// SPEC_FULL §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Gs,
    Drone,
}

/// A management socket becoming available, from either the outbound
/// dialer or the inbound acceptor (spec.md §4.5's two well-known-port
/// endpoints).
pub struct IncomingConnection {
    pub conn: ManagementConnection,
    pub is_outbound: bool,
}

const INIT_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const INIT_TIMEOUT: Duration = Duration::from_secs(8);
const HOP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DRONE_HOP_DELAY: Duration = Duration::from_secs_f64(1.0);
/// Initiator clock-skew rules (spec.md §4.4): ahead by more than this,
/// fire immediately instead of scheduling into the past.
const CLOCK_SKEW_IMMEDIATE: f64 = 0.5;
/// Delay beyond this only gets a warning, never a rejection.
const CLOCK_SKEW_WARN: f64 = 4.0;

enum Signal {
    InitCompleted(bool),
    HopScheduled {
        target: ChannelIdx,
        fire_at: Instant,
    },
    ConfigSynced(Option<serde_json::Map<String, serde_json::Value>>),
}

pub struct Orchestrator {
    role: Role,
    config: OrchestratorConfig,
    config_writer: Arc<dyn ConfigWriter>,
    state_machine: LinkStateMachine,
    channels: ChannelSet,
    hop: HopController<IwRadioCommand>,
    power: Option<PowerPolicy>,
    active: Option<ManagementConnection>,
    config_synced: bool,
    last_init_attempt: Option<Instant>,
    signal_tx: mpsc::Sender<Signal>,
    signal_rx: mpsc::Receiver<Signal>,
}

impl Orchestrator {
    pub fn new(
        role: Role,
        config: OrchestratorConfig,
        config_writer: Arc<dyn ConfigWriter>,
        wlans: Vec<String>,
        now: Instant,
    ) -> Self {
        let wifi_freq = wfb_common::Frequency(config.wifi_channel);
        let hop_freqs: Vec<_> = config
            .freq_sel_channels
            .iter()
            .map(|&c| wfb_common::Frequency(c))
            .collect();
        let channels = ChannelSet::new(wifi_freq, &hop_freqs, now);
        let tuner = RadioTuner::new(wlans, IwRadioCommand);
        let hop = HopController::new(tuner, config.freq_sel.clone());
        let power = match role {
            Role::Drone => Some(PowerPolicy::new(
                config.power_sel_levels.clone(),
                config.power_sel_enabled,
            )),
            Role::Gs => None,
        };
        let (signal_tx, signal_rx) = mpsc::channel(16);
        Self {
            role,
            config,
            config_writer,
            state_machine: LinkStateMachine::new(now),
            channels,
            hop,
            power,
            active: None,
            config_synced: false,
            last_init_attempt: None,
            signal_tx,
            signal_rx,
        }
    }

    pub fn current_state(&self) -> LinkStateName {
        self.state_machine.current()
    }

    fn link_is_active(&self) -> bool {
        matches!(
            self.state_machine.current(),
            LinkStateName::Connected | LinkStateName::Armed | LinkStateName::Disarmed
        )
    }

    fn local_view(&self) -> LocalView {
        let snapshot = self.channels.current().snapshot(self.hop.cfg());
        LocalView {
            rssi: snapshot.rssi,
            per: snapshot.per as u32,
            snr: snapshot.snr,
            score: Some(snapshot.score),
        }
    }

    pub async fn run(
        mut self,
        mut measurement_rx: mpsc::Receiver<Measurement>,
        mut inbound_rx: mpsc::Receiver<InboundRequest>,
        mut conn_rx: mpsc::Receiver<IncomingConnection>,
        status_tx: watch::Sender<LinkStateName>,
        view_tx: watch::Sender<LocalView>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = Instant::now();
                    self.on_tick(now).await;
                    let _ = status_tx.send(self.state_machine.current());
                    let _ = view_tx.send(self.local_view());
                }
                Some(incoming) = conn_rx.recv() => {
                    self.on_connection(incoming);
                }
                Some(m) = measurement_rx.recv() => {
                    let now = Instant::now();
                    self.on_measurement(m, now).await;
                }
                Some(req) = inbound_rx.recv() => {
                    let now = Instant::now();
                    self.on_inbound(req, now).await;
                }
                Some(signal) = self.signal_rx.recv() => {
                    let now = Instant::now();
                    self.on_signal(signal, now).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(role = ?self.role, "orchestrator shutting down");
                        return;
                    }
                }
            }
        }
    }

    fn on_connection(&mut self, incoming: IncomingConnection) {
        // Outbound always wins; an inbound connection only becomes the
        // active send path when nothing else is available yet (GS
        // fallback routing, spec.md §4.5/scenario E).
        if incoming.is_outbound || self.active.is_none() {
            info!(outbound = incoming.is_outbound, "management connection active");
            self.active = Some(incoming.conn);
        }
    }

    async fn on_tick(&mut self, now: Instant) {
        let events = self.state_machine.on_tick(now);
        self.handle_state_events(events, now).await;

        if self.state_machine.current() == LinkStateName::Waiting {
            let due = self
                .last_init_attempt
                .is_none_or(|t| now.duration_since(t) >= INIT_RETRY_INTERVAL);
            if due {
                if let Some(conn) = self.active.clone() {
                    self.last_init_attempt = Some(now);
                    spawn_init_attempt(conn, self.config.freq_sel_enabled, self.signal_tx.clone());
                }
            }
        }

        match self
            .hop
            .fire_due(&mut self.channels, now, self.link_is_active())
            .await
        {
            Some(Ok(outcome)) => info!(?outcome, "scheduled hop fire_due"),
            Some(Err(e)) => warn!(error = %e, "scheduled hop failed"),
            None => {}
        }
    }

    async fn on_measurement(&mut self, m: Measurement, now: Instant) {
        if m.packets_total > 0 {
            let events = self.state_machine.on_packet(now);
            self.handle_state_events(events, now).await;
        }

        let idx = self.channels.current_idx();
        let cfg = self.hop.cfg().clone();
        let new_score = self.channels.channel_mut(idx).add_measurement(m, &cfg, now);

        if let (Role::Gs, Some(score)) = (self.role, new_score) {
            let snapshot = self.channels.channel(idx).snapshot(&cfg);
            if let Some(trigger) = self.hop.evaluate_triggers(snapshot.per, snapshot.snr, score, now) {
                self.initiate_scheduled_hop(trigger, now);
            }
        }
    }

    fn initiate_scheduled_hop(&mut self, trigger: HopTrigger, now: Instant) {
        let Some(target) = self.hop.scheduled_target(&self.channels) else {
            warn!(?trigger, "hop trigger fired but no hop target configured");
            return;
        };
        let Some(conn) = self.active.clone() else {
            warn!(?trigger, "hop trigger fired but no management connection is active");
            return;
        };
        info!(?trigger, "initiating scheduled hop");
        spawn_hop_request(conn, target, now, self.signal_tx.clone());
    }

    async fn on_signal(&mut self, signal: Signal, now: Instant) {
        match signal {
            Signal::InitCompleted(true) => {
                let events = self.state_machine.on_init_success(now);
                self.handle_state_events(events, now).await;
            }
            Signal::InitCompleted(false) => {
                // Retried on the next 1Hz tick per INIT_RETRY_INTERVAL.
            }
            Signal::HopScheduled { target, fire_at } => {
                self.hop.schedule_hop(target, fire_at);
            }
            Signal::ConfigSynced(Some(settings)) => {
                self.config.merge_settings(&settings);
                info!("applied config received from GS during config sync");
            }
            Signal::ConfigSynced(None) => {}
        }
    }

    async fn on_inbound(&mut self, req: InboundRequest, now: Instant) {
        let response = match req.command {
            Command::Init { .. } => {
                let events = self.state_machine.on_init_success(now);
                self.handle_state_events(events, now).await;
                Response::ok()
            }
            Command::FreqSelHop => self.handle_freq_sel_hop(now),
            Command::SetStatus { status } => {
                let events = self.state_machine.on_set_status(status, now);
                self.handle_state_events(events, now).await;
                Response::ok()
            }
            Command::UpdateConfig { settings } => {
                self.config.merge_settings(&settings);
                self.persist_config().await;
                Response::ok()
            }
            Command::TxPower { action } => {
                self.apply_tx_power(action, now);
                Response::ok()
            }
            Command::GetConfigHash => match self.role {
                Role::Gs => Response {
                    status: wfb_common::protocol::ResponseStatus::Success,
                    config_hash: Some(self.config.config_hash()),
                    ..Default::default()
                },
                Role::Drone => Response::error("unsupported on drone"),
            },
            Command::GetConfig => match self.role {
                Role::Gs => Response {
                    status: wfb_common::protocol::ResponseStatus::Success,
                    config: Some(serde_json::Value::Object(self.config.common_settings())),
                    ..Default::default()
                },
                Role::Drone => Response::error("unsupported on drone"),
            },
        };
        let _ = req.respond.send(response);
    }

    /// Drone-side responder: compute `actionTime`, schedule locally, return
    /// the agreed time. GS never receives this command (spec.md §4.4:
    /// "Initiator (GS only)"); if it somehow does, reject it rather than
    /// guess a role it isn't.
    fn handle_freq_sel_hop(&mut self, now: Instant) -> Response {
        if !self.config.freq_sel_enabled {
            return Response::error("is_enabled()==false");
        }
        if self.role != Role::Drone {
            return Response::error("freq_sel_hop is only served by the drone");
        }
        let Some(target) = self.hop.scheduled_target(&self.channels) else {
            return Response::error("no hop target configured");
        };
        let action_time_wall = now_wallclock_secs() + DRONE_HOP_DELAY.as_secs_f64();
        self.hop.schedule_hop(target, now + DRONE_HOP_DELAY);
        Response::ok_with_time(action_time_wall)
    }

    fn apply_tx_power(&mut self, action: TxPowerAction, now: Instant) {
        if let Some(power) = &mut self.power {
            power.apply_external_command(action, now);
        }
    }

    async fn persist_config(&self) {
        let toml_text = match toml_text_for(&self.config) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to render config for persistence");
                return;
            }
        };
        let writer = self.config_writer.clone();
        let result = tokio::task::spawn_blocking(move || writer.persist(&toml_text)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist updated config"),
            Err(e) => warn!(error = %e, "config persist task panicked"),
        }
    }

    async fn handle_state_events(&mut self, events: Vec<StateEvent>, now: Instant) {
        for event in events {
            match event {
                StateEvent::EnteredConnected => {
                    if let Some(power) = &mut self.power {
                        power.on_link_state(LinkStateName::Connected);
                    }
                    if self.role == Role::Drone && !self.config_synced {
                        self.config_synced = true;
                        if let Some(conn) = self.active.clone() {
                            spawn_config_sync(conn, self.config.config_hash(), self.signal_tx.clone());
                        }
                    }
                }
                StateEvent::EnteredArmed => {
                    if let Some(power) = &mut self.power {
                        power.on_link_state(LinkStateName::Armed);
                    }
                }
                StateEvent::EnteredDisarmed => {
                    if let Some(power) = &mut self.power {
                        power.on_link_state(LinkStateName::Disarmed);
                    }
                }
                StateEvent::EnteredLost { schedule_hop_to_first } => {
                    self.hop.cancel_pending_scheduled_hop();
                    if schedule_hop_to_first {
                        if let Err(e) = self.hop.to_first(&mut self.channels, now).await {
                            warn!(error = %e, "lost-entry hop to first channel failed");
                        }
                    }
                }
                StateEvent::EnteredRecovery => {
                    for idx in self.channels.all_indices() {
                        self.channels.channel_mut(idx).reset_stats(now);
                    }
                    if let Err(e) = self.hop.to_wifi_channel(&mut self.channels, now).await {
                        warn!(error = %e, "recovery-entry hop to reserve failed");
                    }
                }
                StateEvent::LinkEstablished => {
                    info!("link established for the first time this process lifetime");
                }
            }
        }
    }
}

fn now_wallclock_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn toml_text_for(config: &OrchestratorConfig) -> Result<String, toml::ser::Error> {
    // Only the common.* section is round-tripped through update_config;
    // tuning/network sections are left to the on-disk file's own values.
    #[derive(serde::Serialize)]
    struct Snapshot<'a> {
        common: &'a serde_json::Map<String, serde_json::Value>,
    }
    let settings = config.common_settings();
    let common = settings
        .get("common")
        .and_then(|v| v.as_object())
        .expect("common_settings always nests under \"common\"");
    toml::to_string(&Snapshot { common })
}

fn spawn_init_attempt(conn: ManagementConnection, freq_sel_enabled: bool, signal_tx: mpsc::Sender<Signal>) {
    tokio::spawn(async move {
        let command = Command::Init {
            freq_sel: wfb_common::protocol::FreqSelInfo { enabled: freq_sel_enabled },
            status: LinkStateName::Waiting,
        };
        let success = match conn.send_command(command, INIT_TIMEOUT).await {
            Ok(resp) => resp.is_success(),
            Err(e) => {
                warn!(error = %e, "init attempt failed");
                false
            }
        };
        let _ = signal_tx.send(Signal::InitCompleted(success)).await;
    });
}

fn spawn_hop_request(
    conn: ManagementConnection,
    target: ChannelIdx,
    requested_at: Instant,
    signal_tx: mpsc::Sender<Signal>,
) {
    tokio::spawn(async move {
        match conn.send_command(Command::FreqSelHop, HOP_REQUEST_TIMEOUT).await {
            Ok(resp) if resp.is_success() => {
                let Some(action_time) = resp.time else {
                    warn!("freq_sel_hop success response missing time");
                    return;
                };
                let delay = action_time - now_wallclock_secs();
                let fire_at = if delay < -CLOCK_SKEW_IMMEDIATE {
                    warn!(delay, "clock skew: local clock ahead of agreed hop time, firing immediately");
                    requested_at
                } else {
                    if delay > CLOCK_SKEW_WARN {
                        warn!(delay, "clock skew: agreed hop delay unexpectedly long");
                    }
                    requested_at + Duration::from_secs_f64(delay.max(0.0))
                };
                let _ = signal_tx.send(Signal::HopScheduled { target, fire_at }).await;
            }
            Ok(resp) => {
                warn!(error = ?resp.error, "freq_sel_hop rejected by peer");
            }
            Err(e) => {
                warn!(error = %e, "freq_sel_hop request failed");
            }
        }
    });
}

fn spawn_config_sync(conn: ManagementConnection, local_hash: String, signal_tx: mpsc::Sender<Signal>) {
    tokio::spawn(async move {
        let outcome = run_config_sync(conn, local_hash).await;
        match outcome {
            Ok(settings) => {
                let _ = signal_tx.send(Signal::ConfigSynced(settings)).await;
            }
            Err(e) => {
                warn!(error = %e, "config sync failed");
                let _ = signal_tx.send(Signal::ConfigSynced(None)).await;
            }
        }
    });
}

async fn run_config_sync(
    conn: ManagementConnection,
    local_hash: String,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>, ManagementError> {
    let hash_resp = conn.send_command(Command::GetConfigHash, HOP_REQUEST_TIMEOUT).await?;
    if !hash_resp.is_success() {
        return Ok(None);
    }
    if hash_resp.config_hash.as_deref() == Some(local_hash.as_str()) {
        return Ok(None);
    }
    let config_resp = conn.send_command(Command::GetConfig, HOP_REQUEST_TIMEOUT).await?;
    if !config_resp.is_success() {
        return Ok(None);
    }
    Ok(config_resp.config.and_then(|v| v.as_object().cloned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wfb_common::config::OrchestratorConfig;

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

    fn orchestrator(role: Role) -> Orchestrator {
        Orchestrator::new(role, config(), Arc::new(NullWriter), vec!["wlan0".into()], Instant::now())
    }

    #[tokio::test]
    async fn boundary_13_freq_sel_hop_rejected_when_disabled() {
        let mut orch = orchestrator(Role::Drone);
        orch.config.freq_sel_enabled = false;
        let now = Instant::now();
        let resp = orch.handle_freq_sel_hop(now);
        assert!(!resp.is_success());
        assert_eq!(resp.error.as_deref(), Some("is_enabled()==false"));
    }

    #[tokio::test]
    async fn freq_sel_hop_rejected_on_gs_role() {
        let mut orch = orchestrator(Role::Gs);
        let now = Instant::now();
        let resp = orch.handle_freq_sel_hop(now);
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn drone_schedules_hop_and_returns_time() {
        let mut orch = orchestrator(Role::Drone);
        let now = Instant::now();
        let resp = orch.handle_freq_sel_hop(now);
        assert!(resp.is_success());
        assert!(resp.time.is_some());
        assert!(orch.hop.pending().is_some());
    }

    #[tokio::test]
    async fn get_config_hash_served_only_by_gs() {
        let mut gs = orchestrator(Role::Gs);
        let now = Instant::now();
        let (tx, rx) = tokio::sync::oneshot::channel();
        gs.on_inbound(
            InboundRequest { command: Command::GetConfigHash, respond: tx },
            now,
        )
        .await;
        let resp = rx.await.unwrap();
        assert!(resp.is_success());
        assert!(resp.config_hash.is_some());

        let mut drone = orchestrator(Role::Drone);
        let (tx2, rx2) = tokio::sync::oneshot::channel();
        drone
            .on_inbound(InboundRequest { command: Command::GetConfigHash, respond: tx2 }, now)
            .await;
        let resp2 = rx2.await.unwrap();
        assert!(!resp2.is_success());
    }

    #[tokio::test]
    async fn arm_disarm_drive_power_policy_through_state_events() {
        let mut drone = orchestrator(Role::Drone);
        let now = Instant::now();
        drone.handle_state_events(vec![StateEvent::EnteredConnected], now).await;
        assert_eq!(drone.power.as_ref().unwrap().state(), wfb_link::PowerState::ActiveAdjustment);
        drone.handle_state_events(vec![StateEvent::EnteredDisarmed], now).await;
        assert_eq!(drone.power.as_ref().unwrap().state(), wfb_link::PowerState::Locked);
    }

    #[tokio::test]
    async fn entered_lost_cancels_pending_hop_and_hops_to_first() {
        let mut orch = orchestrator(Role::Gs);
        let now = Instant::now();
        let target = orch.channels.first_hop().unwrap();
        orch.hop.schedule_hop(target, now + Duration::from_secs(10));
        orch
            .handle_state_events(vec![StateEvent::EnteredLost { schedule_hop_to_first: true }], now)
            .await;
        assert!(orch.hop.pending().is_none(), "scheduled hop was cancelled");
        assert_eq!(orch.channels.current_idx(), target, "lost-entry LocalOnly hop fired");
    }

    #[tokio::test]
    async fn entered_recovery_resets_channel_stats() {
        let mut orch = orchestrator(Role::Gs);
        let now = Instant::now();
        let idx = orch.channels.current_idx();
        orch.channels.channel_mut(idx).add_measurement(
            Measurement::new(wfb_common::measurement::StreamId::Video, 500, 5, -55, 28),
            orch.hop.cfg(),
            now,
        );
        orch.handle_state_events(vec![StateEvent::EnteredRecovery], now).await;
        assert_eq!(orch.channels.current_idx(), orch.channels.reserve_idx());
    }

    #[tokio::test]
    async fn update_config_merges_and_persists() {
        let mut orch = orchestrator(Role::Gs);
        let now = Instant::now();
        let mut common = serde_json::Map::new();
        common.insert("wifi_channel".into(), 100.into());
        let mut settings = serde_json::Map::new();
        settings.insert("common".into(), serde_json::Value::Object(common));
        let (tx, rx) = tokio::sync::oneshot::channel();
        orch.on_inbound(
            InboundRequest { command: Command::UpdateConfig { settings }, respond: tx },
            now,
        )
        .await;
        assert!(rx.await.unwrap().is_success());
        assert_eq!(orch.config.wifi_channel, 100);
    }
}
