//! `RadioTuner` — the one place that actually invokes `iw`. Every hop
//! discipline in `hop.rs` bottoms out in `RadioTuner::switch_radio_to`.

use tracing::{info, warn};
use wfb_common::Frequency;

use crate::channel::Instant;
use crate::channels::{ChannelIdx, ChannelSet};
use crate::error::LinkError;

/// Abstraction over "invoke a subprocess that retunes one interface",
/// implemented for real by `IwRadioTuner` and by a recording fake in tests.
/// Keeping this a trait (rather than hardcoding `tokio::process::Command`)
/// is what lets `hop.rs`/`state.rs` tests run without `iw` on PATH.
pub trait RadioCommand: Send + Sync {
    fn retune(
        &self,
        wlan: &str,
        freq: Frequency,
    ) -> impl std::future::Future<Output = Result<(), LinkError>> + Send;
}

/// Invokes the real `iw` binary: `iw dev <wlan> set freq <mhz>` when the
/// configured value is already an MHz value (> 2000), else `iw dev <wlan>
/// set channel <n>` using the raw channel number (spec.md §6).
pub struct IwRadioCommand;

impl RadioCommand for IwRadioCommand {
    async fn retune(&self, wlan: &str, freq: Frequency) -> Result<(), LinkError> {
        let mut cmd = tokio::process::Command::new("iw");
        cmd.arg("dev").arg(wlan).arg("set");
        if freq.is_freq_flavor() {
            cmd.arg("freq").arg(freq.raw().to_string());
        } else {
            cmd.arg("channel").arg(freq.raw().to_string());
        }
        let status = cmd
            .status()
            .await
            .map_err(|e| LinkError::HardwareFailure(format!("spawning iw failed: {e}")))?;
        if !status.success() {
            return Err(LinkError::HardwareFailure(format!(
                "iw exited with {status}"
            )));
        }
        Ok(())
    }
}

pub struct RadioTuner<C: RadioCommand> {
    wlans: Vec<String>,
    command: C,
}

impl<C: RadioCommand> RadioTuner<C> {
    pub fn new(wlans: Vec<String>, command: C) -> Self {
        Self { wlans, command }
    }

    /// Retune every managed interface to `target`'s frequency. On success,
    /// advances the `ChannelSet` cursor, refreshes `switched_at`, and trims
    /// the target channel's measurement windows to `keep_history`. On
    /// failure, state is left untouched and the error is propagated —
    /// callers do not retry automatically (spec.md §7 HardwareFailure
    /// policy: the next trigger re-evaluates).
    ///
    /// A no-op when `target` is already `current` (boundary behavior 12):
    /// no `iw` invocation, no state mutation.
    pub async fn switch_radio_to(
        &self,
        channels: &mut ChannelSet,
        target: ChannelIdx,
        keep_history: usize,
        now: Instant,
    ) -> Result<(), LinkError> {
        if target == channels.current_idx() {
            return Ok(());
        }
        let freq = channels.channel(target).freq();
        for wlan in &self.wlans {
            self.command.retune(wlan, freq).await.inspect_err(|e| {
                warn!(wlan, %freq, error = %e, "hop aborted, radio tuner failed");
            })?;
        }
        channels.set_current(target);
        channels.channel_mut(target).clear_measurements(keep_history, now);
        info!(%freq, "retuned onto channel");
        Ok(())
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeRadioCommand {
        pub invocations: Mutex<Vec<(String, Frequency)>>,
        pub fail_next: Mutex<bool>,
    }

    impl RadioCommand for FakeRadioCommand {
        async fn retune(&self, wlan: &str, freq: Frequency) -> Result<(), LinkError> {
            let mut fail = self.fail_next.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(LinkError::HardwareFailure("simulated failure".into()));
            }
            self.invocations
                .lock()
                .unwrap()
                .push((wlan.to_string(), freq));
            Ok(())
        }
    }
}
