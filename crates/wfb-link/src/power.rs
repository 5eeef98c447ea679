//! `PowerPolicy` — drone-only TX power ladder (spec.md §4.7). A minimal
//! state-driven min/max policy; adaptive RSSI-following power control is an
//! external collaborator and out of scope (spec.md §1).

use std::time::Duration;

use tracing::debug;
use wfb_common::protocol::{LinkStateName, TxPowerAction};

pub type Instant = tokio::time::Instant;

const MIN_CHANGE_INTERVAL: Duration = Duration::from_secs(1);

/// The three policy states from spec.md §4.7. `Disabled` covers
/// `power_sel_enabled = false` (always max, external command ignored).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Disabled,
    /// Entered on disarm: pinned to the lowest configured level.
    Locked,
    /// Entered on arm or on connected: starts at the highest level, then
    /// accepts throttled `tx_power increase/decrease` adjustments.
    ActiveAdjustment,
}

pub struct PowerPolicy {
    levels: Vec<i32>,
    state: PowerState,
    /// Index into `levels` while in `ActiveAdjustment`; `levels.len() - 1`
    /// (max) on entry.
    active_idx: usize,
    last_change: Option<Instant>,
}

impl PowerPolicy {
    /// `levels` is the configured ladder in ascending raw-driver-unit order
    /// (dBm = value/100, spec.md §6); empty or single-entry ladders make
    /// every level selection a no-op at that one value.
    pub fn new(levels: Vec<i32>, enabled: bool) -> Self {
        let active_idx = levels.len().saturating_sub(1);
        Self {
            levels,
            state: if enabled {
                PowerState::Locked
            } else {
                PowerState::Disabled
            },
            active_idx,
            last_change: None,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    /// Current TX power level in raw driver units, or `None` when the
    /// ladder is empty (nothing to set).
    pub fn current_level(&self) -> Option<i32> {
        if self.levels.is_empty() {
            return None;
        }
        match self.state {
            PowerState::Disabled => self.levels.last().copied(),
            PowerState::Locked => self.levels.first().copied(),
            PowerState::ActiveAdjustment => self.levels.get(self.active_idx).copied(),
        }
    }

    /// Drive the policy from a `StateEvent`-level transition (spec.md
    /// §4.3's "Fires callbacks into ... PowerPolicy on transitions").
    pub fn on_link_state(&mut self, new_state: LinkStateName) {
        if self.state == PowerState::Disabled {
            return;
        }
        match new_state {
            LinkStateName::Disarmed => {
                self.state = PowerState::Locked;
            }
            LinkStateName::Armed | LinkStateName::Connected => {
                self.state = PowerState::ActiveAdjustment;
                self.active_idx = self.levels.len().saturating_sub(1);
            }
            LinkStateName::Waiting | LinkStateName::Lost | LinkStateName::Recovery => {}
        }
    }

    /// External `tx_power increase/decrease` (spec.md §4.5/§4.7) — accepted
    /// only in `ActiveAdjustment`, throttled by `MIN_CHANGE_INTERVAL`.
    pub fn apply_external_command(&mut self, action: TxPowerAction, now: Instant) -> bool {
        if self.state != PowerState::ActiveAdjustment || self.levels.is_empty() {
            return false;
        }
        if self
            .last_change
            .is_some_and(|t| now.duration_since(t) < MIN_CHANGE_INTERVAL)
        {
            debug!("tx_power command throttled, too soon since last change");
            return false;
        }
        let last = self.levels.len() - 1;
        match action {
            TxPowerAction::Increase => self.active_idx = (self.active_idx + 1).min(last),
            TxPowerAction::Decrease => self.active_idx = self.active_idx.saturating_sub(1),
        }
        self.last_change = Some(now);
        true
    }
}
