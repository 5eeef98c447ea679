//! `MetricsIngest` — consumes the local `wfb_rx` stats feed (spec.md §4.1,
//! §6): length-prefixed MessagePack records over a loopback TCP socket.
//! Decodes, normalizes, and computes wrap-safe per-stream counter deltas,
//! emitting a `Measurement` per tracked stream to every registered
//! consumer (`ChannelMetrics` via the channel cursor, `StateMachine`'s
//! packet-arrival notifier).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use wfb_common::measurement::{Measurement, StreamId};

const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Cumulative wire counters for one `id`, as last observed.
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    all: u64,
    lost: u64,
    dec_err: u64,
}

/// Probe structure: just enough to check `type` without committing to the
/// full `rx` shape (other record kinds are ignored, spec.md §6).
#[derive(Debug, Deserialize)]
struct RecordKind {
    #[serde(rename = "type")]
    kind: String,
}

/// Full `rx` record shape. `packets`/`rx_ant_stats` values are heterogeneous
/// msgpack arrays (`[?, cumulative]` / antenna tuples); decoded loosely as
/// `serde_json::Value` and picked apart by index, mirroring the dynamically
/// typed source structure (spec.md §6/§4.1).
#[derive(Debug, Deserialize)]
struct RxRecord {
    id: String,
    session: Option<serde_json::Value>,
    packets: Option<HashMap<String, Vec<serde_json::Value>>>,
    rx_ant_stats: Option<HashMap<String, Vec<serde_json::Value>>>,
}

fn stream_id_for(id: &str) -> Option<StreamId> {
    match id {
        "video" => Some(StreamId::Video),
        "mavlink" => Some(StreamId::Mavlink),
        "tunnel" => Some(StreamId::Tunnel),
        _ => None,
    }
}

/// Strip a trailing `" rx"` suffix, per spec.md §4.1 step 2.
fn normalize_id(raw: &str) -> &str {
    raw.strip_suffix(" rx").unwrap_or(raw)
}

fn as_u64(v: &serde_json::Value) -> Option<u64> {
    v.as_u64()
}

/// Mean of antenna-array index `idx`, rounding to nearest integer; 0 if no
/// antennas carry that index (spec.md §4.1/§6: RSSI = index 2, SNR = index 5).
fn mean_antenna_field(stats: &HashMap<String, Vec<serde_json::Value>>, idx: usize) -> i32 {
    let mut sum = 0i64;
    let mut count = 0i32;
    for arr in stats.values() {
        if let Some(v) = arr.get(idx).and_then(|v| v.as_i64()) {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        0
    } else {
        (sum as f64 / count as f64).round() as i32
    }
}

/// Validates and decodes one `rx` record's `packets` map, per spec.md §4.1's
/// supplement: a record missing any of `all`/`lost`/`dec_err`, or whose
/// value is not a 2+-element sequence, is a `ProtocolViolation` — logged
/// once at `warn` and skipped, not fatal.
fn decode_counters(packets: &HashMap<String, Vec<serde_json::Value>>, id: &str) -> Option<Counters> {
    let mut get = |key: &str| -> Option<u64> {
        let arr = packets.get(key)?;
        if arr.len() < 2 {
            warn!(id, key, "malformed packets entry: fewer than 2 elements");
            return None;
        }
        as_u64(&arr[1]).or_else(|| {
            warn!(id, key, "malformed packets entry: second element not an integer");
            None
        })
    };
    Some(Counters {
        all: get("all")?,
        lost: get("lost")?,
        dec_err: get("dec_err")?,
    })
}

/// Wrap-safe delta: spec.md §3/§4.1/invariant 10-11 — if the wire counter
/// regressed (receiver restart/rollover), fall back to the absolute current
/// value rather than a negative delta.
fn wrap_safe_delta(previous: u64, current: u64) -> u64 {
    current.checked_sub(previous).unwrap_or(current)
}

/// Turn the latest/previous counter pair for one `id` into a `Measurement`,
/// per spec.md §3's invariant and §4.1 step 3.
fn to_measurement(
    stream: StreamId,
    previous: Option<Counters>,
    current: Counters,
    rssi: i32,
    snr: i32,
) -> Measurement {
    let (total, bad) = match previous {
        Some(prev) if current.all >= prev.all => {
            let delta_all = wrap_safe_delta(prev.all, current.all);
            let delta_lost = wrap_safe_delta(prev.lost, current.lost);
            let delta_dec_err = wrap_safe_delta(prev.dec_err, current.dec_err);
            (delta_all, delta_lost + delta_dec_err)
        }
        Some(_) => {
            // The `all` counter regressed: wrap recovery — emit the
            // absolute current total and current lost+dec_err.
            (current.all, current.lost + current.dec_err)
        }
        // First measurement for this id: absolute counters, no previous
        // sample to diff against (boundary behavior 10).
        None => (current.all, current.lost + current.dec_err),
    };
    Measurement::new(stream, total, bad, rssi, snr)
}

/// Decode one length-prefixed frame's payload (already read) into a
/// `Measurement`, if it is a well-formed `rx` record for a tracked stream
/// with a `session` present. `previous` is mutated on success.
fn process_record(
    payload: &[u8],
    previous: &mut HashMap<String, Counters>,
) -> Option<Measurement> {
    let kind: RecordKind = match rmp_serde::from_slice(payload) {
        Ok(k) => k,
        Err(e) => {
            warn!(error = %e, "malformed stats record: missing/invalid type field");
            return None;
        }
    };
    if kind.kind != "rx" {
        return None;
    }
    let record: RxRecord = match rmp_serde::from_slice(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed rx record");
            return None;
        }
    };
    let id = normalize_id(&record.id);
    let Some(stream) = stream_id_for(id) else {
        debug!(id, "rx record for unrecognized stream id, skipping");
        return None;
    };
    record.session.as_ref()?;

    let Some(packets) = &record.packets else {
        warn!(id, "rx record missing packets map");
        return None;
    };
    let Some(current) = decode_counters(packets, id) else {
        return None;
    };

    let rssi = record
        .rx_ant_stats
        .as_ref()
        .map(|s| mean_antenna_field(s, 2))
        .unwrap_or(0);
    let snr = record
        .rx_ant_stats
        .as_ref()
        .map(|s| mean_antenna_field(s, 5))
        .unwrap_or(0);

    let prev = previous.insert(id.to_string(), current);
    Some(to_measurement(stream, prev, current, rssi, snr))
}

/// Read one big-endian u32-length-prefixed frame body from `stream`.
async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Run the ingest loop forever: connect to `127.0.0.1:{stats_port}`, read
/// frames, emit Measurements on `tx`. Reconnects with backoff capped at 1s
/// on any I/O error (spec.md §4.1/§7 TransientI/O policy); `previous` is
/// wiped on every (re)connect so the next sample is treated as absolute.
pub async fn run(stats_port: u16, tx: mpsc::Sender<Measurement>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut backoff = Duration::from_millis(50);
    loop {
        if *shutdown.borrow() {
            return;
        }
        match TcpStream::connect(("127.0.0.1", stats_port)).await {
            Ok(mut stream) => {
                let _ = stream.set_nodelay(true);
                tracing::info!(stats_port, "connected to wfb_rx stats feed");
                backoff = Duration::from_millis(50);
                let mut previous: HashMap<String, Counters> = HashMap::new();
                loop {
                    tokio::select! {
                        frame = read_frame(&mut stream) => {
                            match frame {
                                Ok(body) => {
                                    if let Some(measurement) = process_record(&body, &mut previous) {
                                        trace!(?measurement, "ingest measurement");
                                        if tx.send(measurement).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "wfb_rx stats connection dropped");
                                    break;
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                let _ = stream.shutdown().await;
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, stats_port, "failed to connect to wfb_rx stats feed");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(all: u64, lost: u64, dec_err: u64) -> Counters {
        Counters { all, lost, dec_err }
    }

    #[test]
    fn first_measurement_uses_absolute_counters() {
        let m = to_measurement(StreamId::Video, None, counters(500, 5, 0), -55, 28);
        assert_eq!(m.packets_total, 500);
        assert_eq!(m.packets_bad, 5);
    }

    #[test]
    fn normal_progression_emits_deltas() {
        let prev = counters(1000, 10, 2);
        let current = counters(1500, 15, 3);
        let m = to_measurement(StreamId::Video, Some(prev), current, -50, 25);
        assert_eq!(m.packets_total, 500);
        assert_eq!(m.packets_bad, 6);
    }

    #[test]
    fn scenario_d_counter_wrap_falls_back_to_absolute() {
        let prev = counters(18_446_744_073_709_551_600, 0, 0);
        let current = counters(50, 3, 2);
        let m = to_measurement(StreamId::Video, Some(prev), current, -50, 20);
        assert_eq!(m.packets_total, 50, "absolute current, not a negative delta");
        assert_eq!(m.packets_bad, 5, "current lost + dec_err");
    }

    #[test]
    fn normalize_strips_trailing_rx_suffix() {
        assert_eq!(normalize_id("video rx"), "video");
        assert_eq!(normalize_id("video"), "video");
    }

    #[test]
    fn decode_counters_rejects_short_pair() {
        let mut packets = HashMap::new();
        packets.insert("all".to_string(), vec![serde_json::json!(1)]);
        packets.insert("lost".to_string(), vec![serde_json::json!(0), serde_json::json!(0)]);
        packets.insert("dec_err".to_string(), vec![serde_json::json!(0), serde_json::json!(0)]);
        assert!(decode_counters(&packets, "video").is_none());
    }

    #[test]
    fn decode_counters_requires_all_three_keys() {
        let mut packets = HashMap::new();
        packets.insert("all".to_string(), vec![serde_json::json!(0), serde_json::json!(500)]);
        assert!(decode_counters(&packets, "video").is_none());
    }

    #[test]
    fn mean_antenna_field_skips_missing_and_defaults_zero() {
        let mut stats = HashMap::new();
        assert_eq!(mean_antenna_field(&stats, 2), 0);
        stats.insert(
            "0".to_string(),
            vec![0.into(), 0.into(), (-60).into(), 0.into(), 0.into(), 20.into()],
        );
        stats.insert(
            "1".to_string(),
            vec![0.into(), 0.into(), (-50).into(), 0.into(), 0.into(), 30.into()],
        );
        assert_eq!(mean_antenna_field(&stats, 2), -55);
        assert_eq!(mean_antenna_field(&stats, 5), 25);
    }

    #[test]
    fn process_record_ignores_non_rx_type() {
        let payload = rmp_serde::to_vec_named(&serde_json::json!({"type": "tx"})).unwrap();
        let mut previous = HashMap::new();
        assert!(process_record(&payload, &mut previous).is_none());
    }

    #[test]
    fn process_record_requires_session_presence() {
        let payload = rmp_serde::to_vec_named(&serde_json::json!({
            "type": "rx",
            "id": "video rx",
            "packets": {
                "all": [0, 500],
                "lost": [0, 5],
                "dec_err": [0, 0],
            },
        }))
        .unwrap();
        let mut previous = HashMap::new();
        assert!(process_record(&payload, &mut previous).is_none(), "no session key, skip");
    }

    #[test]
    fn process_record_full_round_trip() {
        let payload = rmp_serde::to_vec_named(&serde_json::json!({
            "type": "rx",
            "id": "mavlink rx",
            "session": "abc123",
            "packets": {
                "all": [0, 500],
                "lost": [0, 5],
                "dec_err": [0, 0],
            },
            "rx_ant_stats": {
                "0": [0, 0, -55, 0, 0, 28],
            },
        }))
        .unwrap();
        let mut previous = HashMap::new();
        let m = process_record(&payload, &mut previous).expect("valid rx record");
        assert_eq!(m.stream, StreamId::Mavlink);
        assert_eq!(m.packets_total, 500);
        assert_eq!(m.packets_bad, 5);
        assert_eq!(m.rssi, -55);
        assert_eq!(m.snr, 28);
        assert!(previous.contains_key("mavlink"));
    }
}
