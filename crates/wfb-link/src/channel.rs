//! A single channel's rolling statistics: per-stream measurement windows,
//! derived PER/RSSI/SNR, and the 0-100 Score that drives hop decisions.
//!
//! Grounded on `sich_frequency_selection.py`'s `Channel` class: score
//! recomputation gates on every stream that has any data reaching
//! `score_frames` samples, history is trimmed only on retune (not
//! continuously bounded), and the score formula is the weighted-penalty
//! blend below (spec.md §4.2).

use std::collections::HashMap;

use wfb_common::config::FreqSelConfig;
use wfb_common::measurement::{Measurement, StreamId};
use wfb_common::Frequency;

pub type Instant = tokio::time::Instant;

/// Point-in-time read-only view of a channel's derived metrics, used for
/// diagnostics/logging without mutating state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSnapshot {
    pub freq: Frequency,
    pub rssi: i32,
    pub per: u32,
    pub snr: i32,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct Channel {
    freq: Frequency,
    windows: HashMap<StreamId, Vec<Measurement>>,
    score_history: Vec<f64>,
    switched_at: Instant,
    last_packet_time: Option<Instant>,
}

impl Channel {
    pub fn new(freq: Frequency, now: Instant) -> Self {
        Self {
            freq,
            windows: HashMap::new(),
            score_history: vec![100.0],
            switched_at: now,
            last_packet_time: None,
        }
    }

    pub fn freq(&self) -> Frequency {
        self.freq
    }

    pub fn switched_at(&self) -> Instant {
        self.switched_at
    }

    pub fn last_packet_time(&self) -> Option<Instant> {
        self.last_packet_time
    }

    /// Current (most recent) score; 100 before any measurement has arrived.
    pub fn score(&self) -> f64 {
        *self.score_history.last().unwrap_or(&100.0)
    }

    /// Append a measurement to its stream's window. Recomputes and appends
    /// a new score only when every stream that has any data holds at least
    /// `score_frames` samples — returns the new score when that happens.
    pub fn add_measurement(
        &mut self,
        measurement: Measurement,
        cfg: &FreqSelConfig,
        now: Instant,
    ) -> Option<f64> {
        if measurement.packets_total > 0 {
            self.last_packet_time = Some(now);
        }
        self.windows
            .entry(measurement.stream)
            .or_default()
            .push(measurement);

        let lengths: Vec<usize> = self
            .windows
            .values()
            .map(|w| w.len())
            .filter(|&l| l > 0)
            .collect();
        let ready = !lengths.is_empty()
            && lengths.iter().min().copied().unwrap_or(0) >= cfg.score_frames as usize;
        if ready {
            let score = self.compute_score(cfg);
            self.score_history.push(score);
            Some(score)
        } else {
            None
        }
    }

    /// PER over the last `n` frames per stream: `round(100 * bad/total)`
    /// clamped to [0,100]; frames with `packets_total == 0` are skipped;
    /// no contributing traffic at all is total loss (100), per spec.md.
    pub fn per(&self, n: usize) -> u32 {
        let mut bad_sum: u64 = 0;
        let mut total_sum: u64 = 0;
        for window in self.windows.values() {
            for m in window.iter().rev().take(n) {
                if m.packets_total > 0 {
                    bad_sum += m.packets_bad;
                    total_sum += m.packets_total;
                }
            }
        }
        if total_sum == 0 {
            100
        } else {
            ((100.0 * bad_sum as f64 / total_sum as f64).round() as i64).clamp(0, 100) as u32
        }
    }

    /// Logarithmic mean SNR over the last `n` frames per stream: dB -> linear
    /// `10^(snr/10)` -> average -> back to dB. Only positive-SNR samples
    /// contribute; no samples at all yields 0.
    pub fn snr(&self, n: usize) -> i32 {
        let mut linear_sum = 0.0f64;
        let mut count = 0u32;
        for window in self.windows.values() {
            for m in window.iter().rev().take(n) {
                if m.snr > 0 {
                    linear_sum += 10f64.powf(m.snr as f64 / 10.0);
                    count += 1;
                }
            }
        }
        if count == 0 {
            0
        } else {
            let avg = linear_sum / count as f64;
            (10.0 * avg.log10()).round() as i32
        }
    }

    /// Arithmetic mean of the latest measurement's RSSI across streams that
    /// have any data.
    pub fn rssi(&self) -> i32 {
        let mut sum = 0i64;
        let mut count = 0i32;
        for window in self.windows.values() {
            if let Some(last) = window.last() {
                sum += last.rssi as i64;
                count += 1;
            }
        }
        if count == 0 {
            0
        } else {
            (sum as f64 / count as f64).round() as i32
        }
    }

    fn compute_score(&self, cfg: &FreqSelConfig) -> f64 {
        let per = self.per(cfg.score_frames as usize) as f64;
        let snr = self.snr(cfg.score_frames as usize) as f64;
        let pen_per =
            cfg.score_per_weight * (per / cfg.score_per_max_penalty).clamp(0.0, 1.0);
        let pen_snr = cfg.score_snr_weight
            * ((cfg.score_snr_min_threshold - snr) / cfg.score_snr_min_threshold).clamp(0.0, 1.0);
        100.0 - (pen_per + pen_snr)
    }

    /// Current stats without mutating state (teacher pattern: `get_stats_for_log`).
    pub fn snapshot(&self, cfg: &FreqSelConfig) -> ChannelSnapshot {
        ChannelSnapshot {
            freq: self.freq,
            rssi: self.rssi(),
            per: self.per(cfg.score_frames as usize),
            snr: self.snr(cfg.score_frames as usize),
            score: self.score(),
        }
    }

    /// Trim every stream window and the score history to the last
    /// `keep_history` samples, refresh `switched_at`. Called on successful
    /// retune onto this channel.
    pub fn clear_measurements(&mut self, keep_history: usize, now: Instant) {
        for window in self.windows.values_mut() {
            if window.len() > keep_history {
                let start = window.len() - keep_history;
                window.drain(0..start);
            }
        }
        if self.score_history.len() > keep_history {
            let start = self.score_history.len() - keep_history;
            self.score_history.drain(0..start);
        }
        self.switched_at = now;
    }

    /// Full statistics reset (used on entry to `recovery`, spec.md §4.3).
    pub fn reset_stats(&mut self, now: Instant) {
        self.windows.clear();
        self.score_history = vec![100.0];
        self.last_packet_time = None;
        self.switched_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meas(stream: StreamId, total: u64, bad: u64, rssi: i32, snr: i32) -> Measurement {
        Measurement::new(stream, total, bad, rssi, snr)
    }

    async fn fresh_channel() -> Channel {
        Channel::new(Frequency(149), Instant::now())
    }

    #[tokio::test]
    async fn initial_score_is_100() {
        let c = fresh_channel().await;
        assert_eq!(c.score(), 100.0);
    }

    #[tokio::test]
    async fn per_is_100_with_no_traffic() {
        let c = fresh_channel().await;
        assert_eq!(c.per(3), 100);
    }

    #[tokio::test]
    async fn score_not_recomputed_until_all_streams_reach_score_frames() {
        let mut c = fresh_channel().await;
        let cfg = FreqSelConfig::default();
        let now = Instant::now();
        // Only video stream has data; score_frames defaults to 3.
        assert!(c
            .add_measurement(meas(StreamId::Video, 500, 5, -55, 28), &cfg, now)
            .is_none());
        assert!(c
            .add_measurement(meas(StreamId::Video, 500, 5, -55, 28), &cfg, now)
            .is_none());
        assert_eq!(c.score(), 100.0, "unchanged until window fills");
    }

    #[tokio::test]
    async fn scenario_a_healthy_channel_score_near_100() {
        let mut c = fresh_channel().await;
        let cfg = FreqSelConfig::default();
        let now = Instant::now();
        let mut last = None;
        for _ in 0..3 {
            last = c.add_measurement(meas(StreamId::Video, 500, 5, -55, 28), &cfg, now);
            c.add_measurement(meas(StreamId::Mavlink, 500, 5, -55, 28), &cfg, now);
            c.add_measurement(meas(StreamId::Tunnel, 500, 5, -55, 28), &cfg, now);
        }
        let score = last.expect("window filled on third video sample");
        assert!(score > 95.0, "expected near-100 score, got {score}");
    }

    #[tokio::test]
    async fn scenario_b_reactive_per_window() {
        let mut c = fresh_channel().await;
        let cfg = FreqSelConfig::default();
        let now = Instant::now();
        for _ in 0..3 {
            c.add_measurement(meas(StreamId::Video, 100, 60, -60, 22), &cfg, now);
            c.add_measurement(meas(StreamId::Mavlink, 100, 60, -60, 22), &cfg, now);
            c.add_measurement(meas(StreamId::Tunnel, 100, 60, -60, 22), &cfg, now);
        }
        let per = c.per(cfg.score_frames as usize);
        assert!(
            per >= cfg.per_hop_min && per <= cfg.per_hop_max,
            "expected PER in reactive hop window, got {per}"
        );
    }

    #[tokio::test]
    async fn clear_measurements_trims_to_keep_history() {
        let mut c = fresh_channel().await;
        let cfg = FreqSelConfig::default();
        let now = Instant::now();
        for _ in 0..10 {
            c.add_measurement(meas(StreamId::Video, 500, 5, -55, 28), &cfg, now);
        }
        c.clear_measurements(cfg.channel_keep_history, now);
        assert_eq!(c.per(100), c.per(cfg.channel_keep_history));
    }

    #[tokio::test]
    async fn snr_zero_with_no_samples() {
        let c = fresh_channel().await;
        assert_eq!(c.snr(3), 0);
    }
}
