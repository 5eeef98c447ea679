//! `StateMachine` — six-state link status (spec.md §4.3), identical state
//! table on both peers. Transitions are driven by three external events
//! (`on_packet`, `on_tick`, `on_init_success`/`on_arm`/`on_disarm`/
//! `on_set_status`) and produce a list of `StateEvent`s the orchestrator
//! reacts to (schedule a hop, reset channel stats, notify `PowerPolicy`) —
//! the injected-event-bus shape from spec.md §9's design note, rather than
//! six subclasses with back-pointers into the rest of the engine. The six
//! states themselves are the tagged `LinkStateName` variants dispatched by
//! a single `match`; no trait-object table is needed for six fixed cases.

use std::time::Duration;

use tracing::warn;
use wfb_common::protocol::LinkStateName;

pub type Instant = tokio::time::Instant;

const PACKET_TIMEOUT: Duration = Duration::from_secs(5);
const LOST_TO_RECOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const COLD_START_MIN_WAITING: Duration = Duration::from_secs(5);
const COLD_START_MIN_TRAFFIC: Duration = Duration::from_secs(2);

/// Side effects the orchestrator must perform in reaction to a transition.
/// The state machine itself never touches `HopController`/`PowerPolicy` —
/// it only reports what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    EnteredConnected,
    EnteredArmed,
    EnteredDisarmed,
    /// Entered `lost`; `schedule_hop_to_first` is true only when the
    /// previous state was one of {connected, armed, disarmed} (spec.md
    /// §4.3's lost-state side effect). The orchestrator must always cancel
    /// any outstanding reactive/scheduled hop on this event regardless of
    /// the flag (spec.md §5's `cancelPendingScheduledHop`).
    EnteredLost { schedule_hop_to_first: bool },
    /// Entered `recovery` — reset all channel stats and LocalOnly-retune to
    /// the reserve (wifi_channel) frequency.
    EnteredRecovery,
    /// `hasEverEstablishedLink` flipped true for the first time (invariant
    /// 7: monotonic, never clears).
    LinkEstablished,
}

#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    current: LinkStateName,
    state_entered_at: Instant,
    status_before_lost: Option<LinkStateName>,
    has_ever_established_link: bool,
    lost_since: Option<Instant>,
    last_packet_time: Option<Instant>,
    traffic_start_since_waiting: Option<Instant>,
}

impl LinkStateMachine {
    pub fn new(now: Instant) -> Self {
        Self {
            current: LinkStateName::Waiting,
            state_entered_at: now,
            status_before_lost: None,
            has_ever_established_link: false,
            lost_since: None,
            last_packet_time: None,
            traffic_start_since_waiting: None,
        }
    }

    pub fn current(&self) -> LinkStateName {
        self.current
    }

    pub fn status_before_lost(&self) -> Option<LinkStateName> {
        self.status_before_lost
    }

    pub fn has_ever_established_link(&self) -> bool {
        self.has_ever_established_link
    }

    pub fn last_packet_time(&self) -> Option<Instant> {
        self.last_packet_time
    }

    /// `current == waiting && !hasEverEstablishedLink` (spec.md §4.3).
    pub fn is_cold_start(&self) -> bool {
        self.current == LinkStateName::Waiting && !self.has_ever_established_link
    }

    /// `current in {lost, recovery}` (spec.md §4.3).
    pub fn is_after_link_loss(&self) -> bool {
        matches!(self.current, LinkStateName::Lost | LinkStateName::Recovery)
    }

    /// Any Measurement with `packetsTotal > 0`, regardless of stream,
    /// refreshes `last_packet_time` and can trigger lost→{previous}/
    /// recovery→connected.
    pub fn on_packet(&mut self, now: Instant) -> Vec<StateEvent> {
        self.last_packet_time = Some(now);
        if self.current == LinkStateName::Waiting && self.traffic_start_since_waiting.is_none() {
            self.traffic_start_since_waiting = Some(now);
        }
        match self.current {
            LinkStateName::Lost => {
                let target = self.status_before_lost.unwrap_or(LinkStateName::Connected);
                self.transition_to(target, now)
            }
            // Peer may have rebooted; never restore the pre-loss arm state.
            LinkStateName::Recovery => self.transition_to(LinkStateName::Connected, now),
            _ => Vec::new(),
        }
    }

    /// 1Hz timer tick: drives cold-start fallback, packet-timeout → lost,
    /// and lost → recovery.
    pub fn on_tick(&mut self, now: Instant) -> Vec<StateEvent> {
        match self.current {
            LinkStateName::Waiting => {
                let waited_long_enough = now.duration_since(self.state_entered_at) >= COLD_START_MIN_WAITING;
                let traffic_stable = self
                    .traffic_start_since_waiting
                    .is_some_and(|start| now.duration_since(start) >= COLD_START_MIN_TRAFFIC);
                if waited_long_enough && traffic_stable {
                    self.transition_to(LinkStateName::Connected, now)
                } else {
                    Vec::new()
                }
            }
            LinkStateName::Connected | LinkStateName::Armed | LinkStateName::Disarmed => {
                let reference = self.last_packet_time.unwrap_or(self.state_entered_at);
                if now.duration_since(reference) >= PACKET_TIMEOUT {
                    self.transition_to(LinkStateName::Lost, now)
                } else {
                    Vec::new()
                }
            }
            LinkStateName::Lost => {
                let since = self.lost_since.unwrap_or(self.state_entered_at);
                if now.duration_since(since) >= LOST_TO_RECOVERY_TIMEOUT {
                    self.transition_to(LinkStateName::Recovery, now)
                } else {
                    Vec::new()
                }
            }
            // Stays in recovery indefinitely; no further hops (spec.md §4.3).
            LinkStateName::Recovery => Vec::new(),
        }
    }

    /// Management `init` handshake succeeded — primary path out of
    /// `waiting`, or (per spec.md §4.5) `disarmed` in the reconnect case.
    pub fn on_init_success(&mut self, now: Instant) -> Vec<StateEvent> {
        match self.current {
            LinkStateName::Waiting | LinkStateName::Disarmed => {
                self.transition_to(LinkStateName::Connected, now)
            }
            _ => {
                warn!(state = %self.current, "init success ignored: not waiting/disarmed");
                Vec::new()
            }
        }
    }

    pub fn on_arm(&mut self, now: Instant) -> Vec<StateEvent> {
        match self.current {
            LinkStateName::Connected | LinkStateName::Disarmed => {
                self.transition_to(LinkStateName::Armed, now)
            }
            _ => {
                warn!(state = %self.current, "arm ignored: invalid source state");
                Vec::new()
            }
        }
    }

    pub fn on_disarm(&mut self, now: Instant) -> Vec<StateEvent> {
        match self.current {
            LinkStateName::Connected | LinkStateName::Armed => {
                self.transition_to(LinkStateName::Disarmed, now)
            }
            _ => {
                warn!(state = %self.current, "disarm ignored: invalid source state");
                Vec::new()
            }
        }
    }

    /// Remote-mirrored `set_status` (spec.md §4.5) — only connected/armed/
    /// disarmed are synchronizable; anything else is a `LogicAssertion`,
    /// logged and absorbed rather than propagated (spec.md §7).
    pub fn on_set_status(&mut self, target: LinkStateName, now: Instant) -> Vec<StateEvent> {
        match target {
            LinkStateName::Armed => self.on_arm(now),
            LinkStateName::Disarmed => self.on_disarm(now),
            LinkStateName::Connected => match self.current {
                LinkStateName::Waiting | LinkStateName::Armed | LinkStateName::Disarmed => {
                    self.transition_to(LinkStateName::Connected, now)
                }
                _ => Vec::new(),
            },
            LinkStateName::Lost | LinkStateName::Recovery => {
                warn!(target = %target, "set_status rejected: lost/recovery are locally derived only");
                Vec::new()
            }
        }
    }

    fn transition_to(&mut self, to: LinkStateName, now: Instant) -> Vec<StateEvent> {
        if to == self.current {
            return Vec::new();
        }
        let from = self.current;
        let mut events = Vec::new();

        if from == LinkStateName::Waiting
            && matches!(
                to,
                LinkStateName::Connected | LinkStateName::Armed | LinkStateName::Disarmed
            )
            && !self.has_ever_established_link
        {
            self.has_ever_established_link = true;
            events.push(StateEvent::LinkEstablished);
        }

        match to {
            LinkStateName::Lost => {
                self.lost_since = Some(now);
                let from_active = matches!(
                    from,
                    LinkStateName::Connected | LinkStateName::Armed | LinkStateName::Disarmed
                );
                self.status_before_lost = if from_active { Some(from) } else { None };
                events.push(StateEvent::EnteredLost {
                    schedule_hop_to_first: from_active,
                });
            }
            LinkStateName::Recovery => {
                self.lost_since = None;
                events.push(StateEvent::EnteredRecovery);
            }
            LinkStateName::Connected => {
                self.lost_since = None;
                events.push(StateEvent::EnteredConnected);
            }
            LinkStateName::Armed => events.push(StateEvent::EnteredArmed),
            LinkStateName::Disarmed => events.push(StateEvent::EnteredDisarmed),
            LinkStateName::Waiting => {
                self.traffic_start_since_waiting = None;
            }
        }

        self.current = to;
        self.state_entered_at = now;
        events
    }
}
