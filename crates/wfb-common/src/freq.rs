//! Wi-Fi channel identity, and its conversion to a display/logging MHz value.
//!
//! `Frequency` stores the *raw* configured value — whatever a peer's
//! `wifi_channel`/`freq_sel_channels` config entries say, which may be a
//! small channel number (1-14, 36-64, 100-144, 149-177) or an explicit MHz
//! value. Channel identity, the `iw` command flavor, and the wire
//! `"channel"` field all operate on this raw value directly (mirroring the
//! source, where a `Channel`'s `_freq` is never itself converted — only
//! logged through `format_channel_freq`). `resolved_mhz()` is the
//! normalizing helper used purely for human-readable display.

use serde::{Deserialize, Serialize};

/// A channel identity as configured: either a Wi-Fi channel number or an
/// already-MHz value (> 2000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frequency(pub u32);

impl Frequency {
    /// The raw configured value, as carried on the wire (heartbeat
    /// `"channel"` field, hop target identity).
    pub fn raw(self) -> u32 {
        self.0
    }

    /// True when this value is already an MHz value and `iw dev <wlan> set
    /// freq <mhz>` is the right command flavor; false selects `iw dev
    /// <wlan> set channel <n>` using the raw value unchanged.
    pub fn is_freq_flavor(self) -> bool {
        self.0 > 2000
    }

    /// Normalize to MHz for display/logging — idempotent once already MHz.
    pub fn resolved_mhz(self) -> u32 {
        channel_to_mhz(self.0)
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_channel_freq(self.0))
    }
}

impl From<u32> for Frequency {
    fn from(raw: u32) -> Self {
        Frequency(raw)
    }
}

/// Convert a Wi-Fi channel number to MHz. Values already > 2000 are assumed
/// to be MHz and passed through unchanged (idempotent once in MHz).
pub fn channel_to_mhz(channel_or_freq: u32) -> u32 {
    if channel_or_freq > 2000 {
        return channel_or_freq;
    }
    match channel_or_freq {
        1..=13 => 2407 + 5 * channel_or_freq,
        14 => 2484,
        36..=64 => 5000 + 5 * channel_or_freq,
        100..=144 => 5000 + 5 * channel_or_freq,
        149..=177 => 5000 + 5 * channel_or_freq,
        other => 5000 + 5 * other,
    }
}

/// Render a frequency for logs: `"149 (5745MHz)"` when the input looked like
/// a channel number, or just `"5745MHz"` when it was already MHz.
pub fn format_channel_freq(channel_or_freq: u32) -> String {
    let mhz = channel_to_mhz(channel_or_freq);
    if channel_or_freq > 2000 {
        format!("{mhz}MHz")
    } else {
        format!("{channel_or_freq} ({mhz}MHz)")
    }
}
