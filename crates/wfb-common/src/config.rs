//! Configuration schema: a loosely-typed `*Input` layer parsed from TOML,
//! resolved into a fully-defaulted `OrchestratorConfig`. Mirrors the
//! two-stage `Input`/`resolve()` pattern used elsewhere in this codebase's
//! lineage for per-field defaults with config-version-free forward
//! compatibility.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(String),
    #[error("missing required key: {0}")]
    MissingKey(&'static str),
    #[error("incoherent configuration: {0}")]
    Incoherent(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CommonConfigInput {
    pub wifi_channel: Option<u32>,
    pub freq_sel_enabled: Option<bool>,
    pub freq_sel_channels: Vec<u32>,
    pub power_sel_enabled: Option<bool>,
    pub power_sel_levels: Vec<i32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FreqSelConfigInput {
    pub score_frames: Option<u32>,
    pub score_per_weight: Option<f64>,
    pub score_snr_weight: Option<f64>,
    pub score_per_max_penalty: Option<f64>,
    pub score_snr_min_threshold: Option<f64>,
    pub channel_keep_history: Option<usize>,
    pub per_hop_min: Option<u32>,
    pub per_hop_max: Option<u32>,
    pub per_hop_cooldown_sec: Option<u64>,
    pub snr_hop_threshold: Option<i32>,
    pub score_hop_threshold: Option<f64>,
    pub score_hop_cooldown_sec: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RoleConfigInput {
    pub stats_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfigInput {
    pub gs_ip: Option<String>,
    pub drone_ip: Option<String>,
    pub gs_management_port: Option<u16>,
    pub drone_management_port: Option<u16>,
    pub gs_heartbeat_port: Option<u16>,
    pub drone_heartbeat_port: Option<u16>,
    pub heartbeat_stats_received_port: Option<u16>,
    pub heartbeat_stats_sent_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfigInput {
    pub common: CommonConfigInput,
    pub freq_sel: FreqSelConfigInput,
    pub gs: RoleConfigInput,
    pub drone: RoleConfigInput,
    pub network: NetworkConfigInput,
}

// ── Resolved configuration ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FreqSelConfig {
    pub score_frames: u32,
    pub score_per_weight: f64,
    pub score_snr_weight: f64,
    pub score_per_max_penalty: f64,
    pub score_snr_min_threshold: f64,
    pub channel_keep_history: usize,
    pub per_hop_min: u32,
    pub per_hop_max: u32,
    pub per_hop_cooldown_sec: u64,
    /// 0 means disabled (spec.md §6).
    pub snr_hop_threshold: i32,
    /// 0.0 means disabled (spec.md §6).
    pub score_hop_threshold: f64,
    pub score_hop_cooldown_sec: u64,
}

impl Default for FreqSelConfig {
    /// Defaults taken from `sich_frequency_selection.py`'s config getters —
    /// the latest, most complete revision per spec.md §9's Open Questions.
    fn default() -> Self {
        Self {
            score_frames: 3,
            score_per_weight: 75.0,
            score_snr_weight: 25.0,
            score_per_max_penalty: 10.0,
            score_snr_min_threshold: 20.0,
            channel_keep_history: 5,
            per_hop_min: 25,
            per_hop_max: 80,
            per_hop_cooldown_sec: 15,
            snr_hop_threshold: 0,
            score_hop_threshold: 0.0,
            score_hop_cooldown_sec: 30,
        }
    }
}

impl FreqSelConfigInput {
    pub fn resolve(self) -> FreqSelConfig {
        let d = FreqSelConfig::default();
        FreqSelConfig {
            score_frames: self.score_frames.unwrap_or(d.score_frames).max(1),
            score_per_weight: self.score_per_weight.unwrap_or(d.score_per_weight),
            score_snr_weight: self.score_snr_weight.unwrap_or(d.score_snr_weight),
            score_per_max_penalty: self
                .score_per_max_penalty
                .unwrap_or(d.score_per_max_penalty),
            score_snr_min_threshold: self
                .score_snr_min_threshold
                .unwrap_or(d.score_snr_min_threshold),
            channel_keep_history: self
                .channel_keep_history
                .unwrap_or(d.channel_keep_history)
                .max(1),
            per_hop_min: self.per_hop_min.unwrap_or(d.per_hop_min),
            per_hop_max: self.per_hop_max.unwrap_or(d.per_hop_max),
            per_hop_cooldown_sec: self.per_hop_cooldown_sec.unwrap_or(d.per_hop_cooldown_sec),
            snr_hop_threshold: self.snr_hop_threshold.unwrap_or(d.snr_hop_threshold),
            score_hop_threshold: self.score_hop_threshold.unwrap_or(d.score_hop_threshold),
            score_hop_cooldown_sec: self
                .score_hop_cooldown_sec
                .unwrap_or(d.score_hop_cooldown_sec),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub gs_ip: String,
    pub drone_ip: String,
    pub gs_management_port: u16,
    pub drone_management_port: u16,
    pub gs_heartbeat_port: u16,
    pub drone_heartbeat_port: u16,
    pub heartbeat_stats_received_port: u16,
    pub heartbeat_stats_sent_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            gs_ip: "10.5.0.1".into(),
            drone_ip: "10.5.0.2".into(),
            gs_management_port: 14889,
            drone_management_port: 14888,
            gs_heartbeat_port: 14890,
            drone_heartbeat_port: 14891,
            heartbeat_stats_received_port: 14892,
            heartbeat_stats_sent_port: 14893,
        }
    }
}

impl NetworkConfigInput {
    pub fn resolve(self) -> NetworkConfig {
        let d = NetworkConfig::default();
        NetworkConfig {
            gs_ip: self.gs_ip.unwrap_or(d.gs_ip),
            drone_ip: self.drone_ip.unwrap_or(d.drone_ip),
            gs_management_port: self.gs_management_port.unwrap_or(d.gs_management_port),
            drone_management_port: self
                .drone_management_port
                .unwrap_or(d.drone_management_port),
            gs_heartbeat_port: self.gs_heartbeat_port.unwrap_or(d.gs_heartbeat_port),
            drone_heartbeat_port: self.drone_heartbeat_port.unwrap_or(d.drone_heartbeat_port),
            heartbeat_stats_received_port: self
                .heartbeat_stats_received_port
                .unwrap_or(d.heartbeat_stats_received_port),
            heartbeat_stats_sent_port: self
                .heartbeat_stats_sent_port
                .unwrap_or(d.heartbeat_stats_sent_port),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub wifi_channel: u32,
    pub freq_sel_enabled: bool,
    pub freq_sel_channels: Vec<u32>,
    pub power_sel_enabled: bool,
    pub power_sel_levels: Vec<i32>,
    pub freq_sel: FreqSelConfig,
    pub gs_stats_port: u16,
    pub drone_stats_port: u16,
    pub network: NetworkConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            wifi_channel: 149,
            freq_sel_enabled: false,
            freq_sel_channels: Vec::new(),
            power_sel_enabled: false,
            power_sel_levels: Vec::new(),
            freq_sel: FreqSelConfig::default(),
            gs_stats_port: 5000,
            drone_stats_port: 5000,
            network: NetworkConfig::default(),
        }
    }
}

impl OrchestratorConfigInput {
    pub fn resolve(self) -> Result<OrchestratorConfig, ConfigError> {
        let d = OrchestratorConfig::default();
        let wifi_channel = self.common.wifi_channel.unwrap_or(d.wifi_channel);
        let freq_sel_enabled = self.common.freq_sel_enabled.unwrap_or(d.freq_sel_enabled);
        let freq_sel_channels = if self.common.freq_sel_channels.is_empty() {
            d.freq_sel_channels
        } else {
            self.common.freq_sel_channels
        };

        // A recoverable mid-flight misconfiguration (spec.md §7,
        // ConfigurationError policy): freq-sel enabled with fewer than two
        // distinct hop targets downgrades is_enabled() to false rather than
        // failing startup.
        let freq_sel_enabled = freq_sel_enabled && freq_sel_channels.len() >= 2;

        Ok(OrchestratorConfig {
            wifi_channel,
            freq_sel_enabled,
            freq_sel_channels,
            power_sel_enabled: self.common.power_sel_enabled.unwrap_or(d.power_sel_enabled),
            power_sel_levels: if self.common.power_sel_levels.is_empty() {
                d.power_sel_levels
            } else {
                self.common.power_sel_levels
            },
            freq_sel: self.freq_sel.resolve(),
            gs_stats_port: self.gs.stats_port.unwrap_or(d.gs_stats_port),
            drone_stats_port: self.drone.stats_port.unwrap_or(d.drone_stats_port),
            network: self.network.resolve(),
        })
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(OrchestratorConfig::default());
        }
        let parsed: OrchestratorConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.resolve()
    }

    pub fn from_toml_path(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// SHA-256 of the canonical (sorted-key) JSON rendering of the
    /// `common.*` keys exchanged during config sync (see
    /// `sich_sync_cfg.py`'s `get_config_hash`).
    pub fn config_hash(&self) -> String {
        let mut fields: BTreeMap<&'static str, serde_json::Value> = BTreeMap::new();
        fields.insert("wifi_channel".into(), self.wifi_channel.into());
        fields.insert("freq_sel_enabled".into(), self.freq_sel_enabled.into());
        fields.insert(
            "freq_sel_channels".into(),
            serde_json::to_value(&self.freq_sel_channels).unwrap(),
        );
        fields.insert("power_sel_enabled".into(), self.power_sel_enabled.into());
        fields.insert(
            "power_sel_levels".into(),
            serde_json::to_value(&self.power_sel_levels).unwrap(),
        );
        let canonical = serde_json::to_string(&fields).expect("BTreeMap of Values always serializes");
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// The `common.*` subset exchanged during config sync, shaped exactly
    /// like an `update_config` settings payload so a drone receiving it
    /// from `get_config` can feed it straight into `merge_settings`
    /// (`sich_sync_cfg.py`'s `get_config`).
    pub fn common_settings(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut common = serde_json::Map::new();
        common.insert("wifi_channel".into(), self.wifi_channel.into());
        common.insert("freq_sel_enabled".into(), self.freq_sel_enabled.into());
        common.insert(
            "freq_sel_channels".into(),
            serde_json::to_value(&self.freq_sel_channels).unwrap(),
        );
        common.insert("power_sel_enabled".into(), self.power_sel_enabled.into());
        common.insert(
            "power_sel_levels".into(),
            serde_json::to_value(&self.power_sel_levels).unwrap(),
        );
        let mut top = serde_json::Map::new();
        top.insert("common".into(), serde_json::Value::Object(common));
        top
    }

    /// Merge externally-sourced `settings` (as carried by `update_config`)
    /// into this configuration, applying only the recognized `common.*`
    /// keys. Unknown sections/keys are ignored rather than rejected.
    pub fn merge_settings(&mut self, settings: &serde_json::Map<String, serde_json::Value>) {
        let Some(common) = settings.get("common").and_then(|v| v.as_object()) else {
            return;
        };
        if let Some(v) = common.get("wifi_channel").and_then(|v| v.as_u64()) {
            self.wifi_channel = v as u32;
        }
        if let Some(v) = common.get("freq_sel_enabled").and_then(|v| v.as_bool()) {
            self.freq_sel_enabled = v;
        }
        if let Some(v) = common.get("freq_sel_channels").and_then(|v| v.as_array()) {
            self.freq_sel_channels = v.iter().filter_map(|x| x.as_u64()).map(|x| x as u32).collect();
        }
        if let Some(v) = common.get("power_sel_enabled").and_then(|v| v.as_bool()) {
            self.power_sel_enabled = v;
        }
        if let Some(v) = common.get("power_sel_levels").and_then(|v| v.as_array()) {
            self.power_sel_levels = v.iter().filter_map(|x| x.as_i64()).map(|x| x as i32).collect();
        }
    }
}

/// Injected writer for persisting `update_config` merges. The default impl
/// does an atomic replace (write-to-temp + rename); tests substitute a
/// recording mock rather than touching disk. See spec.md §9 design note:
/// "the persistent config file is touched only through an injected writer".
pub trait ConfigWriter: Send + Sync {
    fn persist(&self, toml_text: &str) -> std::io::Result<()>;
}

pub struct AtomicFileConfigWriter {
    pub path: std::path::PathBuf,
}

impl ConfigWriter for AtomicFileConfigWriter {
    fn persist(&self, toml_text: &str) -> std::io::Result<()> {
        let tmp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml_text)?;
        std::fs::rename(&tmp_path, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let cfg = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn parses_scenario_a_config() {
        let toml = r#"
            [common]
            wifi_channel = 149
            freq_sel_enabled = true
            freq_sel_channels = [157, 161, 165]
        "#;
        let cfg = OrchestratorConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.wifi_channel, 149);
        assert!(cfg.freq_sel_enabled);
        assert_eq!(cfg.freq_sel_channels, vec![157, 161, 165]);
        assert_eq!(cfg.freq_sel.per_hop_min, 25);
        assert_eq!(cfg.freq_sel.per_hop_max, 80);
    }

    #[test]
    fn single_channel_downgrades_freq_sel_enabled() {
        let toml = r#"
            [common]
            freq_sel_enabled = true
            freq_sel_channels = [157]
        "#;
        let cfg = OrchestratorConfig::from_toml_str(toml).unwrap();
        assert!(!cfg.freq_sel_enabled);
    }

    #[test]
    fn custom_freq_sel_tuning_overrides_defaults() {
        let toml = r#"
            [freq_sel]
            score_frames = 5
            per_hop_cooldown_sec = 20
        "#;
        let cfg = OrchestratorConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.freq_sel.score_frames, 5);
        assert_eq!(cfg.freq_sel.per_hop_cooldown_sec, 20);
        assert_eq!(cfg.freq_sel.score_hop_cooldown_sec, 30);
    }

    #[test]
    fn config_hash_stable_and_sensitive_to_channels() {
        let a = OrchestratorConfig::from_toml_str(
            "[common]\nfreq_sel_channels = [157, 161]\nfreq_sel_enabled = true\n",
        )
        .unwrap();
        let b = a.clone();
        assert_eq!(a.config_hash(), b.config_hash());

        let mut c = a.clone();
        c.wifi_channel = 100;
        assert_ne!(a.config_hash(), c.config_hash());
    }

    #[test]
    fn common_settings_round_trips_through_merge() {
        let source = OrchestratorConfig::from_toml_str(
            "[common]\nwifi_channel = 161\nfreq_sel_channels = [157, 161]\nfreq_sel_enabled = true\n",
        )
        .unwrap();
        let mut target = OrchestratorConfig::default();
        target.merge_settings(&source.common_settings());
        assert_eq!(target.wifi_channel, 161);
        assert_eq!(target.freq_sel_channels, vec![157, 161]);
        assert!(target.freq_sel_enabled);
    }

    #[test]
    fn merge_settings_updates_wifi_channel() {
        let mut cfg = OrchestratorConfig::default();
        let mut common = serde_json::Map::new();
        common.insert("wifi_channel".into(), 100.into());
        let mut settings = serde_json::Map::new();
        settings.insert("common".into(), serde_json::Value::Object(common));
        cfg.merge_settings(&settings);
        assert_eq!(cfg.wifi_channel, 100);
    }

    #[test]
    fn merge_settings_ignores_unknown_sections() {
        let mut cfg = OrchestratorConfig::default();
        let before = cfg.clone();
        let mut settings = serde_json::Map::new();
        settings.insert("bogus".into(), serde_json::Value::Null);
        cfg.merge_settings(&settings);
        assert_eq!(cfg, before);
    }
}
