//! Shared data model, wire protocol, and configuration schema for the
//! wfb-peer ground-station/drone control plane.

pub mod config;
pub mod freq;
pub mod measurement;
pub mod protocol;

pub use config::{ConfigError, OrchestratorConfig};
pub use freq::{channel_to_mhz, format_channel_freq, Frequency};
pub use measurement::{Measurement, StreamId};
