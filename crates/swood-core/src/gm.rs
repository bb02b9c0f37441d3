//! General MIDI instrument and percussion-note name tables.
//!
//! Reconstructed from the published GM1 Sound Set in the shape
//! `get_instruments.py` (in the retrieved reference pack) scrapes it
//! into: `(program_number, name, category)` for melodic instruments,
//! `(note_number, name)` for percussion. Program numbers here are the
//! raw 0-indexed MIDI program-change byte value, not the 1-indexed
//! numbering GM documentation displays.
//!
//! Neither the teacher's declared `midi_analysis::gm` module nor the
//! original's `.instruments` import were present in the retrieved
//! example pack, so this table is authored fresh from the GM standard
//! rather than copied.

include!("gm_table.rs");

/// Look up a melodic instrument name by its 0-indexed program number.
pub fn instrument_name(program: u8) -> &'static str {
    GM_INSTRUMENTS
        .iter()
        .find(|(p, _, _)| *p == program)
        .map(|(_, name, _)| *name)
        .unwrap_or("Unknown")
}

/// Look up a percussion instrument's name by its note number (35-81 on
/// channel 10).
pub fn percussion_name(note: u8) -> Option<&'static str> {
    GM_PERCUSSION
        .iter()
        .find(|(n, _)| *n == note)
        .map(|(_, name)| *name)
}

/// The General MIDI default program used when a channel receives
/// note-on events before any `program_change` (spec: "assume General
/// MIDI program #1 (acoustic piano)").
pub const DEFAULT_PROGRAM: u8 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_program_is_acoustic_grand_piano() {
        assert_eq!(instrument_name(DEFAULT_PROGRAM), "Acoustic Grand Piano");
    }

    #[test]
    fn table_has_128_entries_covering_every_program_byte() {
        assert_eq!(GM_INSTRUMENTS.len(), 128);
        for p in 0u8..=127 {
            assert_ne!(instrument_name(p), "Unknown");
        }
    }

    #[test]
    fn percussion_lookup_covers_standard_kit() {
        assert_eq!(percussion_name(38), Some("Acoustic Snare"));
        assert_eq!(percussion_name(49), Some("Crash Cymbal 1"));
        assert_eq!(percussion_name(34), None);
    }
}
