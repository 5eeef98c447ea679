//! `ChannelSet` — the arena of configured channels plus the three roles
//! spec.md §3 assigns over it (startup/reserve, hop list, current cursor).
//!
//! The source's `Channel <-> Channels <-> FrequencySelection` web of
//! back-references becomes a flat arena indexed by `ChannelIdx`; callers
//! navigate via indices rather than shared/aliased references (spec.md §9
//! design note on cyclic references).

use wfb_common::Frequency;

use crate::channel::{Channel, Instant};

/// An index into a `ChannelSet`'s arena. Cheap, `Copy`, stable for the
/// lifetime of the set (channels are never removed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelIdx(usize);

pub struct ChannelSet {
    arena: Vec<Channel>,
    startup_idx: ChannelIdx,
    /// Only the configured `freq_sel_channels`, in config order — the
    /// sequence hops cycle through. Distinct from `arena`, which may also
    /// hold the startup/reserve channel when it isn't itself a hop target.
    hop_list: Vec<ChannelIdx>,
    current_idx: ChannelIdx,
}

impl ChannelSet {
    /// `wifi_channel_freq` is both the startup channel and the permanent
    /// reserve; `hop_freqs` is the ordered `freq_sel_channels` list. A
    /// frequency appearing in both collapses onto the same `Channel`
    /// (mirrors `ChannelsFactory.get_single_freq`).
    pub fn new(wifi_channel_freq: Frequency, hop_freqs: &[Frequency], now: Instant) -> Self {
        let mut arena = Vec::new();
        let mut get_or_create = |arena: &mut Vec<Channel>, freq: Frequency| -> ChannelIdx {
            if let Some(pos) = arena.iter().position(|c: &Channel| c.freq() == freq) {
                ChannelIdx(pos)
            } else {
                let idx = ChannelIdx(arena.len());
                arena.push(Channel::new(freq, now));
                idx
            }
        };
        let startup_idx = get_or_create(&mut arena, wifi_channel_freq);
        let hop_list: Vec<ChannelIdx> = hop_freqs
            .iter()
            .map(|&f| get_or_create(&mut arena, f))
            .collect();
        Self {
            arena,
            startup_idx,
            hop_list,
            current_idx: startup_idx,
        }
    }

    pub fn channel(&self, idx: ChannelIdx) -> &Channel {
        &self.arena[idx.0]
    }

    pub fn channel_mut(&mut self, idx: ChannelIdx) -> &mut Channel {
        &mut self.arena[idx.0]
    }

    pub fn current_idx(&self) -> ChannelIdx {
        self.current_idx
    }

    pub fn current(&self) -> &Channel {
        &self.arena[self.current_idx.0]
    }

    /// Reassign the current cursor. Does not perform any hardware retune —
    /// callers (HopController/RadioTuner) are responsible for invoking `iw`
    /// first and only updating the cursor on success (spec.md §4.4).
    pub fn set_current(&mut self, idx: ChannelIdx) {
        self.current_idx = idx;
    }

    pub fn startup_idx(&self) -> ChannelIdx {
        self.startup_idx
    }

    pub fn reserve_idx(&self) -> ChannelIdx {
        self.startup_idx
    }

    pub fn by_freq(&self, freq: Frequency) -> Option<ChannelIdx> {
        self.arena
            .iter()
            .position(|c| c.freq() == freq)
            .map(ChannelIdx)
    }

    pub fn is_on_freq_sel(&self) -> bool {
        self.hop_list.contains(&self.current_idx)
    }

    pub fn first_hop(&self) -> Option<ChannelIdx> {
        self.hop_list.first().copied()
    }

    pub fn last_hop(&self) -> Option<ChannelIdx> {
        self.hop_list.last().copied()
    }

    fn position_in_hop_list(&self) -> Option<usize> {
        self.hop_list.iter().position(|&i| i == self.current_idx)
    }

    /// Next channel in `freq_sel_channels`, cyclic. Falls back to the first
    /// hop target when the current channel isn't itself in the hop list
    /// (mirrors `Channels.next_channel`).
    pub fn next_in_hop_list(&self) -> Option<ChannelIdx> {
        if self.hop_list.is_empty() {
            return None;
        }
        match self.position_in_hop_list() {
            Some(pos) => Some(self.hop_list[(pos + 1) % self.hop_list.len()]),
            None => Some(self.hop_list[0]),
        }
    }

    pub fn prev_in_hop_list(&self) -> Option<ChannelIdx> {
        if self.hop_list.is_empty() {
            return None;
        }
        match self.position_in_hop_list() {
            Some(pos) => Some(self.hop_list[(pos + self.hop_list.len() - 1) % self.hop_list.len()]),
            None => Some(self.hop_list[0]),
        }
    }

    pub fn hop_list(&self) -> &[ChannelIdx] {
        &self.hop_list
    }

    pub fn all_indices(&self) -> impl Iterator<Item = ChannelIdx> + '_ {
        (0..self.arena.len()).map(ChannelIdx)
    }
}
