//! `HopController` — the two hop disciplines from spec.md §4.4, sharing one
//! primitive (`RadioTuner::switch_radio_to`). LocalOnly ops retune
//! immediately; the ScheduledGS2Drone discipline and the reactive/planned
//! triggers go through a single pending-hop slot that the orchestrator's
//! 1Hz tick polls and fires — the "deferLater maps to a single-shot
//! scheduled callback... cancellation is a token the HopController stores
//! and nulls out on completion" design note (spec.md §9), realized without
//! a second task/thread per scheduled hop.

use wfb_common::config::FreqSelConfig;

use crate::channel::Instant;
use crate::channels::{ChannelIdx, ChannelSet};
use crate::error::LinkError;
use crate::tuner::{RadioCommand, RadioTuner};

/// Which trigger family fired, for logging/cooldown bookkeeping (spec.md
/// §4.4: reactive ~15s cooldown, planned ~30s cooldown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopTrigger {
    Reactive,
    Planned,
}

/// A scheduled-but-not-yet-fired hop: either this peer's own ScheduledGS2Drone
/// continuation, or (conceptually) a LocalOnly hop issued with a delay. One
/// outstanding slot at a time — a second `schedule_hop` overwrites the first,
/// matching "any outstanding reactive or scheduled hop is cancelled" (spec.md
/// §4.4/§5 use a single `cancelPendingScheduledHop`, implying a single slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingHop {
    pub target: ChannelIdx,
    pub fire_at: Instant,
    generation: u64,
}

/// What to do with a fired pending hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopOutcome {
    Fired,
    /// Target already equals current, or the link left an active state
    /// before the hop could fire (boundary behavior 12 / scenario F).
    AbortedNoOp,
}

pub struct HopController<C: RadioCommand> {
    tuner: RadioTuner<C>,
    cfg: FreqSelConfig,
    pending: Option<PendingHop>,
    generation: u64,
    last_reactive_hop: Option<Instant>,
    last_planned_hop: Option<Instant>,
}

impl<C: RadioCommand> HopController<C> {
    pub fn new(tuner: RadioTuner<C>, cfg: FreqSelConfig) -> Self {
        Self {
            tuner,
            cfg,
            pending: None,
            generation: 0,
            last_reactive_hop: None,
            last_planned_hop: None,
        }
    }

    pub fn cfg(&self) -> &FreqSelConfig {
        &self.cfg
    }

    // ── LocalOnly discipline ────────────────────────────────────────────

    pub async fn to_first(
        &self,
        channels: &mut ChannelSet,
        now: Instant,
    ) -> Result<(), LinkError> {
        let Some(target) = channels.first_hop() else {
            return Ok(());
        };
        self.tuner
            .switch_radio_to(channels, target, self.cfg.channel_keep_history, now)
            .await
    }

    pub async fn to_last(&self, channels: &mut ChannelSet, now: Instant) -> Result<(), LinkError> {
        let Some(target) = channels.last_hop() else {
            return Ok(());
        };
        self.tuner
            .switch_radio_to(channels, target, self.cfg.channel_keep_history, now)
            .await
    }

    pub async fn to_next(&self, channels: &mut ChannelSet, now: Instant) -> Result<(), LinkError> {
        let Some(target) = channels.next_in_hop_list() else {
            return Ok(());
        };
        self.tuner
            .switch_radio_to(channels, target, self.cfg.channel_keep_history, now)
            .await
    }

    pub async fn to_prev(&self, channels: &mut ChannelSet, now: Instant) -> Result<(), LinkError> {
        let Some(target) = channels.prev_in_hop_list() else {
            return Ok(());
        };
        self.tuner
            .switch_radio_to(channels, target, self.cfg.channel_keep_history, now)
            .await
    }

    /// Retune to the reserve/startup channel — used on `recovery` entry.
    pub async fn to_wifi_channel(
        &self,
        channels: &mut ChannelSet,
        now: Instant,
    ) -> Result<(), LinkError> {
        let target = channels.reserve_idx();
        self.tuner
            .switch_radio_to(channels, target, self.cfg.channel_keep_history, now)
            .await
    }

    // ── ScheduledGS2Drone discipline ───────────────────────────────────

    /// Target-selection rule shared by initiator and responder: if on
    /// reserve, target the first hop-list channel; else the next one after
    /// current (spec.md §4.4).
    pub fn scheduled_target(&self, channels: &ChannelSet) -> Option<ChannelIdx> {
        if !channels.is_on_freq_sel() {
            channels.first_hop()
        } else {
            channels.next_in_hop_list()
        }
    }

    /// Arm the single pending-hop slot to fire at `fire_at` (already
    /// resolved to this process's monotonic clock by the caller, which owns
    /// the wall-clock-to-monotonic translation and clock-skew policy —
    /// spec.md §4.4's initiator clock-skew rules are a management-layer
    /// concern, not this engine's).
    pub fn schedule_hop(&mut self, target: ChannelIdx, fire_at: Instant) {
        self.generation += 1;
        self.pending = Some(PendingHop {
            target,
            fire_at,
            generation: self.generation,
        });
    }

    pub fn pending(&self) -> Option<PendingHop> {
        self.pending
    }

    /// Cancel any outstanding reactive/scheduled hop (spec.md §5's single
    /// `cancelPendingScheduledHop`) — called on every `lost` entry.
    pub fn cancel_pending_scheduled_hop(&mut self) {
        self.generation += 1;
        self.pending = None;
    }

    /// Poll the pending slot; fires the hop if `now >= fire_at`. Re-checks
    /// preconditions after the implicit suspension (spec.md §5): a hop
    /// whose target already equals current, or whose generation was
    /// cancelled, or which fires while the link is no longer in an active
    /// state, aborts as a no-op rather than retuning. Returns `None` when
    /// nothing is due yet.
    pub async fn fire_due(
        &mut self,
        channels: &mut ChannelSet,
        now: Instant,
        link_is_active: bool,
    ) -> Option<Result<HopOutcome, LinkError>> {
        let due = self.pending.filter(|p| now >= p.fire_at)?;
        // Still the same generation: nothing cancelled it out from under us.
        if self.pending.map(|p| p.generation) != Some(due.generation) {
            return None;
        }
        self.pending = None;
        if !link_is_active || due.target == channels.current_idx() {
            return Some(Ok(HopOutcome::AbortedNoOp));
        }
        let result = self
            .tuner
            .switch_radio_to(channels, due.target, self.cfg.channel_keep_history, now)
            .await;
        Some(result.map(|()| HopOutcome::Fired))
    }

    // ── Reactive/planned triggers (GS only) ─────────────────────────────

    /// Re-evaluated whenever a channel's score updates (spec.md §4.4).
    /// Cooldowns are single-valued per family; while in cooldown, evaluation
    /// is suppressed (the caller logs at 1s resolution per spec — this
    /// method just returns `None`).
    pub fn evaluate_triggers(&mut self, per: u32, snr: i32, score: f64, now: Instant) -> Option<HopTrigger> {
        let reactive_ready = self
            .last_reactive_hop
            .is_none_or(|t| now.duration_since(t).as_secs() >= self.cfg.per_hop_cooldown_sec);
        let planned_ready = self
            .last_planned_hop
            .is_none_or(|t| now.duration_since(t).as_secs() >= self.cfg.score_hop_cooldown_sec);

        if reactive_ready {
            let per_in_band = per >= self.cfg.per_hop_min && per <= self.cfg.per_hop_max;
            let snr_low = self.cfg.snr_hop_threshold > 0 && snr < self.cfg.snr_hop_threshold;
            if per_in_band || snr_low {
                self.last_reactive_hop = Some(now);
                return Some(HopTrigger::Reactive);
            }
        }
        if planned_ready && self.cfg.score_hop_threshold > 0.0 && score < self.cfg.score_hop_threshold {
            self.last_planned_hop = Some(now);
            return Some(HopTrigger::Planned);
        }
        None
    }
}
