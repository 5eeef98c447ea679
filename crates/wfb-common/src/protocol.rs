//! Management-channel wire protocol: a tagged command union with one
//! decoder and one handler per kind (see design note on "Tagged message
//! union"), plus the heartbeat UDP payload shape.

use serde::{Deserialize, Serialize};

/// The six link states, named exactly as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStateName {
    Waiting,
    Connected,
    Armed,
    Disarmed,
    Lost,
    Recovery,
}

impl std::fmt::Display for LinkStateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkStateName::Waiting => "waiting",
            LinkStateName::Connected => "connected",
            LinkStateName::Armed => "armed",
            LinkStateName::Disarmed => "disarmed",
            LinkStateName::Lost => "lost",
            LinkStateName::Recovery => "recovery",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxPowerAction {
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct FreqSelInfo {
    pub enabled: bool,
}

/// The management command sum type. One JSON object per message, tagged by
/// its `"command"` field, matching spec.md's command set plus the
/// `get_config_hash`/`get_config` supplement from the config-sync feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Init {
        freq_sel: FreqSelInfo,
        status: LinkStateName,
    },
    FreqSelHop,
    SetStatus {
        status: LinkStateName,
    },
    UpdateConfig {
        settings: serde_json::Map<String, serde_json::Value>,
    },
    TxPower {
        action: TxPowerAction,
    },
    GetConfigHash,
    GetConfig,
}

/// A loosely-typed response, mirroring the source's untyped dicts: which
/// optional fields are populated depends on which `Command` it answers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    #[default]
    Success,
    Error,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Success,
            ..Default::default()
        }
    }

    pub fn ok_with_time(time: f64) -> Self {
        Self {
            status: ResponseStatus::Success,
            time: Some(time),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// The UDP heartbeat payload, sent 1Hz each direction regardless of TCP
/// state (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub kind: HeartbeatKind,
    pub timestamp: f64,
    pub status: LinkStateName,
    pub channel: u32,
    pub local: HeartbeatView,
    pub remote: Option<HeartbeatView>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatKind {
    Heartbeat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatView {
    pub timestamp: f64,
    pub rssi: i32,
    pub per: u32,
    pub snr: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_init() {
        let cmd = Command::Init {
            freq_sel: FreqSelInfo { enabled: true },
            status: LinkStateName::Waiting,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"command\":\"init\""));
        let back: Command = serde_json::from_str(&json).unwrap();
        match back {
            Command::Init { freq_sel, status } => {
                assert!(freq_sel.enabled);
                assert_eq!(status, LinkStateName::Waiting);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn freq_sel_hop_has_no_payload_fields() {
        let json = serde_json::to_string(&Command::FreqSelHop).unwrap();
        assert_eq!(json, r#"{"command":"freq_sel_hop"}"#);
    }

    #[test]
    fn error_response_omits_optional_fields() {
        let resp = Response::error("is_enabled()==false");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"time\""));
        assert!(!json.contains("\"config_hash\""));
        assert!(json.contains("\"status\":\"error\""));
    }

    #[test]
    fn unknown_command_fails_to_parse() {
        let result: Result<Command, _> = serde_json::from_str(r#"{"command":"bogus"}"#);
        assert!(result.is_err());
    }
}
