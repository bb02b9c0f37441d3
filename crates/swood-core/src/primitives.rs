//! Small time-domain newtypes shared by the MIDI parser and renderer.
//!
//! Generalized from chaosgarden's `primitives.rs`: the tick/tempo-map
//! machinery is kept, since a standard MIDI file's delta-times are
//! expressed in ticks against a tempo map exactly as chaosgarden models
//! them. The realtime graph/Node/Lifecycle machinery in the original file
//! has no counterpart in an offline renderer and was dropped.

use std::ops::{Add, Sub};

/// A tick is the smallest unit of musical time (1/PPQ of a quarter note).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(pub u64);

impl Tick {
    pub fn zero() -> Self {
        Self(0)
    }
}

impl Add for Tick {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Tick(self.0 + rhs.0)
    }
}

impl Sub for Tick {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Tick(self.0.saturating_sub(rhs.0))
    }
}

/// Physical time in seconds.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Second(pub f64);

/// A tempo change at a specific tick.
#[derive(Debug, Clone)]
pub struct TempoChange {
    pub tick: Tick,
    pub bpm: f64,
}

/// Converts MIDI ticks to seconds, accounting for tempo changes.
///
/// Standard MIDI files with no explicit tempo meta-event default to 120
/// BPM, matching `chaosgarden::midi_file`'s convention.
#[derive(Debug, Clone)]
pub struct TempoMap {
    pub ppq: u16,
    pub tempo_changes: Vec<TempoChange>,
}

impl TempoMap {
    pub fn new(ppq: u16) -> Self {
        Self {
            ppq,
            tempo_changes: vec![TempoChange {
                tick: Tick::zero(),
                bpm: 120.0,
            }],
        }
    }

    pub fn add_tempo_change(&mut self, tick: Tick, bpm: f64) {
        self.tempo_changes.push(TempoChange { tick, bpm });
        self.tempo_changes.sort_by_key(|tc| tc.tick);
    }

    pub fn tempo_at(&self, tick: Tick) -> f64 {
        self.tempo_changes
            .iter()
            .rev()
            .find(|tc| tc.tick <= tick)
            .map(|tc| tc.bpm)
            .unwrap_or(120.0)
    }

    /// Convert tick to seconds, accounting for tempo changes before it.
    pub fn tick_to_second(&self, tick: Tick) -> Second {
        let mut seconds = 0.0;
        let mut current_tick = 0u64;
        let mut current_tempo = self.tempo_at(Tick::zero());

        for change in &self.tempo_changes {
            if change.tick.0 >= tick.0 {
                break;
            }
            if change.tick.0 > current_tick {
                let delta_ticks = change.tick.0 - current_tick;
                let delta_beats = delta_ticks as f64 / self.ppq as f64;
                seconds += delta_beats * 60.0 / current_tempo;
                current_tick = change.tick.0;
            }
            current_tempo = change.bpm;
        }

        let remaining_ticks = tick.0 - current_tick;
        let remaining_beats = remaining_ticks as f64 / self.ppq as f64;
        seconds += remaining_beats * 60.0 / current_tempo;

        Second(seconds)
    }
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::new(480)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_to_second_constant_tempo() {
        let map = TempoMap::new(480);
        // 480 ticks = 1 quarter note at 120bpm = 0.5s
        let second = map.tick_to_second(Tick(480));
        assert!((second.0 - 0.5).abs() < 1e-9);
    }

    #[test]
    fn tick_to_second_with_tempo_change() {
        let mut map = TempoMap::new(480);
        map.add_tempo_change(Tick(480), 60.0);
        let at_one_beat = map.tick_to_second(Tick(480));
        assert!((at_one_beat.0 - 0.5).abs() < 1e-9);
        // next quarter note takes 1s at 60bpm
        let at_two_beats = map.tick_to_second(Tick(960));
        assert!((at_two_beats.0 - 1.5).abs() < 1e-9);
    }

    #[test]
    fn tempo_at_picks_most_recent_change() {
        let mut map = TempoMap::new(480);
        map.add_tempo_change(Tick(480), 140.0);
        assert_eq!(map.tempo_at(Tick(0)), 120.0);
        assert_eq!(map.tempo_at(Tick(479)), 120.0);
        assert_eq!(map.tempo_at(Tick(480)), 140.0);
    }
}
