//! One second of per-stream receive statistics, post delta-computation.

use serde::{Deserialize, Serialize};

/// The three logical flows carried over the radio link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamId {
    Video,
    Mavlink,
    Tunnel,
}

impl StreamId {
    pub const ALL: [StreamId; 3] = [StreamId::Video, StreamId::Mavlink, StreamId::Tunnel];
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamId::Video => "video",
            StreamId::Mavlink => "mavlink",
            StreamId::Tunnel => "tunnel",
        };
        write!(f, "{s}")
    }
}

/// Normalized per-second sample for one stream, after wrap-safe delta
/// computation by MetricsIngest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub stream: StreamId,
    pub packets_total: u64,
    pub packets_bad: u64,
    pub rssi: i32,
    pub snr: i32,
}

impl Measurement {
    /// Enforce `packetsBad <= packetsTotal` by clamping, per spec.
    pub fn new(stream: StreamId, packets_total: u64, packets_bad: u64, rssi: i32, snr: i32) -> Self {
        Self {
            stream,
            packets_total,
            packets_bad: packets_bad.min(packets_total),
            rssi,
            snr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_bad_to_total() {
        let m = Measurement::new(StreamId::Video, 10, 99, -50, 20);
        assert_eq!(m.packets_bad, 10);
    }

    #[test]
    fn stream_display() {
        assert_eq!(StreamId::Mavlink.to_string(), "mavlink");
    }
}
