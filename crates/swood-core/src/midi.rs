//! Translates a standard MIDI byte stream into a sample-indexed, sorted
//! note schedule.
//!
//! Grounded on `chaosgarden::midi_file::parse_midi_file` for the `midly`
//! `Smf::parse` usage, tempo-change bookkeeping, and tick-to-second
//! conversion (via `crate::primitives::TempoMap`); grounded on
//! `examples/original_source/swood/midiparse.py` for the note-on/off FIFO
//! per note number, `note_to_freq`, and the running max-volume/max-pitch
//! bookkeeping. The original has no pitch-bend or soundfont-aware
//! instrument pipeline at all (it hardcodes a single sample and skips
//! channel 10 outright); that half is built fresh here from `spec.md`
//! §4.2's prose, since no retrieved source demonstrates it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use midly::{Format, MetaMessage, MidiMessage as MidlyMessage, Smf, TrackEventKind};
use tracing::warn;

use crate::error::{Result, SwoodError};
use crate::gm;
use crate::primitives::{TempoMap, Tick};
use crate::soundfont::{Instrument, InstrumentLookup};

/// MIDI channel 10 (1-indexed) is reserved for percussion; `midly`
/// channels are 0-indexed, so this is channel index 9.
const PERCUSSION_CHANNEL: u8 = 9;

/// A fully scheduled note, ready for the renderer.
///
/// Two notes are equal (for cache purposes, see `render::NoteKey`) iff
/// `(length, pitch_hz, sample_start, instrument identity, percussion)`
/// match; this struct itself derives no `PartialEq`/`Hash` because the
/// instrument-identity comparison needs pointer equality, which lives in
/// `render::NoteKey`.
#[derive(Debug, Clone)]
pub struct Note {
    /// Output-sample index this note begins at.
    pub start: usize,
    /// Duration in output samples.
    pub length: usize,
    /// Finalized pitch in Hz (MIDI note number + transpose + active bend).
    pub pitch_hz: f64,
    /// Linear volume scalar: `velocity * instrument.volume`. Scaled
    /// against the schedule's max polyphonic volume at render time, never
    /// mutated after parsing (`spec.md` §9's guidance on `maxvolume`).
    pub volume: f64,
    /// Offset into the rendered (resampled) waveform to start reading
    /// from; nonzero only for notes continuing after a pitch-bend split.
    pub sample_start: usize,
    pub instrument: Arc<Instrument>,
    pub percussion: bool,
    /// True for the early half of a note split by a pitch-wheel event:
    /// the renderer uses `data[sample_start..sample_start+length]`
    /// directly and never searches for a zero crossing.
    pub bend_continuation: bool,
}

/// The MIDI parser's complete output (`spec.md` §4.2's contract).
pub struct ParsedSchedule {
    /// Buckets keyed by start sample, strictly ascending; within a bucket,
    /// insertion order is preserved.
    pub schedule: Vec<(usize, Vec<Note>)>,
    pub total_length: usize,
    pub max_polyphonic_volume: f64,
    pub max_pitch_hz: f64,
    pub note_count: usize,
}

/// `440 * 2^((note_number + bend_semitones - 69) / 12)`, the equal-tempered
/// formula named in `spec.md` §4.2.
pub fn note_to_freq(note_number: u8, bend_semitones: f64) -> f64 {
    440.0 * 2f64.powf((note_number as f64 + bend_semitones - 69.0) / 12.0)
}

/// An in-flight note, still waiting for its note-off (or the next
/// pitch-wheel event that splits it).
struct OpenNote {
    start: usize,
    pitch_number: u8,
    bend: f64,
    volume: f64,
    sample_start: usize,
    instrument: Arc<Instrument>,
    percussion: bool,
}

struct ChannelState {
    program: u8,
    bend_semitones: f64,
    open: HashMap<u8, VecDeque<OpenNote>>,
}

impl Default for ChannelState {
    fn default() -> Self {
        ChannelState {
            program: gm::DEFAULT_PROGRAM,
            bend_semitones: 0.0,
            open: HashMap::new(),
        }
    }
}

/// Parse a standard MIDI byte stream into a `ParsedSchedule`.
///
/// Rejects type-2 (asynchronous multi-track) MIDI with `UnsupportedMidi`;
/// rejects non-positive `speed` with `InvalidArgument`.
pub fn parse_midi<L: InstrumentLookup>(
    bytes: &[u8],
    lookup: &L,
    transpose: i32,
    speed: f64,
) -> Result<ParsedSchedule> {
    if speed <= 0.0 {
        return Err(SwoodError::InvalidArgument(format!(
            "speed must be a positive number, got {speed}"
        )));
    }

    let smf = Smf::parse(bytes)
        .map_err(|e| SwoodError::UnsupportedMidi(format!("could not parse MIDI file: {e}")))?;

    if smf.header.format == Format::Sequential {
        return Err(SwoodError::UnsupportedMidi(
            "type-2 (asynchronous multi-track) MIDI files are not supported".into(),
        ));
    }

    let ppq = match smf.header.timing {
        midly::Timing::Metrical(t) => t.as_int(),
        midly::Timing::Timecode(..) => 480,
    };

    // Pass 1: merge every track's events onto one absolute-tick timeline
    // and collect every tempo change, exactly as chaosgarden's
    // `parse_midi_file` does for its own (note-lifecycle-free) purposes.
    struct RawEvent {
        tick: u64,
        channel: u8,
        message: MidlyMessage,
    }
    let mut raw_events = Vec::new();
    let mut tempo_map = TempoMap::new(ppq);

    for track in &smf.tracks {
        let mut tick: u64 = 0;
        for event in track {
            tick += event.delta.as_int() as u64;
            match event.kind {
                TrackEventKind::Midi { channel, message } => {
                    raw_events.push(RawEvent {
                        tick,
                        channel: channel.as_int(),
                        message,
                    });
                }
                TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => {
                    let bpm = 60_000_000.0 / tempo.as_int() as f64;
                    tempo_map.add_tempo_change(Tick(tick), bpm);
                }
                _ => {}
            }
        }
    }
    raw_events.sort_by_key(|e| e.tick);

    let to_samples = |tick: u64| -> usize {
        let seconds = tempo_map.tick_to_second(Tick(tick)).0;
        (seconds * lookup.frame_rate() as f64 / speed).round() as usize
    };

    let mut channels: HashMap<u8, ChannelState> = HashMap::new();
    let mut results: HashMap<usize, Vec<Note>> = HashMap::new();
    let mut bucket_order: Vec<usize> = Vec::new();
    let mut note_count = 0usize;
    let mut running_volume = 0.0f64;
    let mut max_polyphonic_volume = 0.0f64;
    let mut max_pitch_hz = 0.0f64;
    let mut last_tick = 0u64;

    let mut emit = |results: &mut HashMap<usize, Vec<Note>>, bucket_order: &mut Vec<usize>, note: Note| {
        if !results.contains_key(&note.start) {
            bucket_order.push(note.start);
        }
        results.entry(note.start).or_default().push(note);
    };

    for raw in &raw_events {
        last_tick = last_tick.max(raw.tick);
        let now = to_samples(raw.tick);
        let channel_num = raw.channel;
        let is_percussion = channel_num == PERCUSSION_CHANNEL;
        let state = channels.entry(channel_num).or_default();

        match raw.message {
            MidlyMessage::NoteOn { key, vel } => {
                let note_number = key.as_int();
                let velocity = vel.as_int();
                if velocity == 0 {
                    close_note(
                        state,
                        is_percussion,
                        note_number,
                        now,
                        &mut results,
                        &mut bucket_order,
                        &mut note_count,
                        &mut running_volume,
                        &mut max_pitch_hz,
                        &mut emit,
                    );
                    continue;
                }

                let instrument = if is_percussion {
                    lookup.percussion(note_number)
                } else {
                    lookup.program(state.program)
                };
                let volume = velocity as f64 * instrument.volume;
                let pitch_number = if is_percussion {
                    note_number
                } else {
                    (note_number as i32 + transpose).clamp(0, 127) as u8
                };
                let open = OpenNote {
                    start: now,
                    pitch_number,
                    bend: if is_percussion { 0.0 } else { state.bend_semitones },
                    volume,
                    sample_start: 0,
                    instrument,
                    percussion: is_percussion,
                };
                state.open.entry(note_number).or_default().push_back(open);
                running_volume += volume;
                max_polyphonic_volume = max_polyphonic_volume.max(running_volume);
            }
            MidlyMessage::NoteOff { key, .. } => {
                close_note(
                    state,
                    is_percussion,
                    key.as_int(),
                    now,
                    &mut results,
                    &mut bucket_order,
                    &mut note_count,
                    &mut running_volume,
                    &mut max_pitch_hz,
                    &mut emit,
                );
            }
            MidlyMessage::ProgramChange { program } => {
                state.program = program.as_int();
            }
            MidlyMessage::PitchBend { bend } => {
                if is_percussion {
                    continue; // percussion skips the pitch-bend pipeline entirely
                }
                let new_bend = (bend.as_int() as i32 - 8192) as f64 / 8192.0 * 12.0;
                if (new_bend - state.bend_semitones).abs() > f64::EPSILON {
                    for queue in state.open.values_mut() {
                        for open in queue.iter_mut() {
                            let length_so_far = now.saturating_sub(open.start);
                            let pitch_so_far = note_to_freq(open.pitch_number, open.bend);

                            let pre_bend = Note {
                                start: open.start,
                                length: length_so_far,
                                pitch_hz: pitch_so_far,
                                volume: open.volume,
                                sample_start: open.sample_start,
                                instrument: open.instrument.clone(),
                                percussion: false,
                                bend_continuation: true,
                            };
                            emit(&mut results, &mut bucket_order, pre_bend);

                            let fundamental = instrument_fundamental(&open.instrument).unwrap_or(pitch_so_far);
                            open.sample_start = (length_so_far as f64 * fundamental / pitch_so_far).round() as usize;
                            open.start = now;
                            open.bend = new_bend;
                        }
                    }
                }
                state.bend_semitones = new_bend;
            }
            _ => {}
        }
    }

    // Terminal policy: close anything still open at the final tick.
    let final_now = to_samples(last_tick);
    for (_, state) in channels.iter_mut() {
        for (note_number, queue) in state.open.iter_mut() {
            if !queue.is_empty() {
                warn!(note_number, "MIDI ended with this note still playing; closing it at the final tick");
            }
            while let Some(open) = queue.pop_front() {
                let note = finalize_note(open, final_now);
                max_pitch_hz = max_pitch_hz.max(note.pitch_hz);
                running_volume -= note.volume;
                note_count += 1;
                emit(&mut results, &mut bucket_order, note);
            }
        }
    }

    if note_count == 0 {
        return Err(SwoodError::InvalidArgument(
            "this MIDI file doesn't have any notes in it".into(),
        ));
    }

    bucket_order.sort_unstable();
    bucket_order.dedup();
    let schedule: Vec<(usize, Vec<Note>)> = bucket_order
        .into_iter()
        .map(|key| (key, results.remove(&key).unwrap_or_default()))
        .collect();

    let total_length = schedule
        .iter()
        .flat_map(|(_, notes)| notes.iter())
        .map(|n| n.start + n.length)
        .max()
        .unwrap_or(0);

    Ok(ParsedSchedule {
        schedule,
        total_length,
        max_polyphonic_volume,
        max_pitch_hz,
        note_count,
    })
}

fn instrument_fundamental(instrument: &Instrument) -> Result<f64> {
    if let Some(hz) = instrument.pitch_override {
        return Ok(hz);
    }
    match &instrument.sample {
        Some(sample) => sample.fundamental_freq(),
        None => Ok(440.0),
    }
}

fn finalize_note(open: OpenNote, now: usize) -> Note {
    let pitch_hz = if open.percussion {
        note_to_freq(open.pitch_number, 0.0)
    } else {
        note_to_freq(open.pitch_number, open.bend)
    };
    Note {
        start: open.start,
        length: now.saturating_sub(open.start),
        pitch_hz,
        volume: open.volume,
        sample_start: open.sample_start,
        instrument: open.instrument,
        percussion: open.percussion,
        bend_continuation: false,
    }
}

#[allow(clippy::too_many_arguments)]
fn close_note(
    state: &mut ChannelState,
    is_percussion: bool,
    note_number: u8,
    now: usize,
    results: &mut HashMap<usize, Vec<Note>>,
    bucket_order: &mut Vec<usize>,
    note_count: &mut usize,
    running_volume: &mut f64,
    max_pitch_hz: &mut f64,
    emit: &mut impl FnMut(&mut HashMap<usize, Vec<Note>>, &mut Vec<usize>, Note),
) {
    let Some(queue) = state.open.get_mut(&note_number) else {
        warn!(note_number, "note-off with no matching note-on; skipping");
        return;
    };
    let Some(open) = queue.pop_front() else {
        warn!(note_number, "note-off with no matching note-on; skipping");
        return;
    };
    if queue.is_empty() {
        state.open.remove(&note_number);
    }
    debug_assert_eq!(open.percussion, is_percussion);

    let note = finalize_note(open, now);
    *max_pitch_hz = max_pitch_hz.max(note.pitch_hz);
    *running_volume -= note.volume;
    *note_count += 1;
    emit(results, bucket_order, note);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Sample;
    use crate::soundfont::SoundFont;
    use std::f64::consts::PI;
    use std::sync::Arc;

    fn sine_wav_bytes(frequency: f64, frame_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: frame_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..4410 {
                let t = i as f64 / frame_rate as f64;
                let v = (2.0 * PI * frequency * t).sin() * 20000.0;
                writer.write_sample(v as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn trivial_font() -> SoundFont {
        let sample = Arc::new(Sample::from_wav_bytes(&sine_wav_bytes(440.0, 44100), 8192).unwrap());
        SoundFont::trivial_default(sample)
    }

    fn build_midi(events: Vec<(u32, midly::TrackEventKind<'static>)>, ppq: u16) -> Vec<u8> {
        use midly::{Header, Timing, Format as MFormat, Track, TrackEvent};
        let mut track: Track = Vec::new();
        let mut last_tick = 0u32;
        for (tick, kind) in events {
            let delta = tick - last_tick;
            last_tick = tick;
            track.push(TrackEvent {
                delta: delta.into(),
                kind,
            });
        }
        track.push(TrackEvent {
            delta: 0.into(),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        let smf = Smf {
            header: Header {
                format: MFormat::SingleTrack,
                timing: Timing::Metrical(ppq.into()),
            },
            tracks: vec![track],
        };
        let mut buf = Vec::new();
        smf.write(&mut buf).unwrap();
        buf
    }

    fn note_on(channel: u8, key: u8, vel: u8) -> TrackEventKind<'static> {
        TrackEventKind::Midi {
            channel: channel.into(),
            message: MidlyMessage::NoteOn { key: key.into(), vel: vel.into() },
        }
    }

    fn note_off(channel: u8, key: u8) -> TrackEventKind<'static> {
        TrackEventKind::Midi {
            channel: channel.into(),
            message: MidlyMessage::NoteOff { key: key.into(), vel: 0.into() },
        }
    }

    #[test]
    fn single_note_schedule_is_sample_indexed_and_ordered() {
        let font = trivial_font();
        let midi = build_midi(
            vec![(0, note_on(0, 69, 100)), (480, note_off(0, 69))],
            480,
        );
        let parsed = parse_midi(&midi, &font, 0, 1.0).unwrap();
        assert_eq!(parsed.note_count, 1);
        assert_eq!(parsed.schedule.len(), 1);
        let (start, notes) = &parsed.schedule[0];
        assert_eq!(*start, 0);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].length, 22050); // 1 beat at 120bpm, 480ppq = 0.5s = 22050 frames at 44100Hz
    }

    #[test]
    fn bucket_keys_strictly_increase() {
        let font = trivial_font();
        let midi = build_midi(
            vec![
                (0, note_on(0, 60, 100)),
                (240, note_off(0, 60)),
                (240, note_on(0, 64, 100)),
                (480, note_off(0, 64)),
            ],
            480,
        );
        let parsed = parse_midi(&midi, &font, 0, 1.0).unwrap();
        let keys: Vec<usize> = parsed.schedule.iter().map(|(k, _)| *k).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn every_note_ends_within_total_length() {
        let font = trivial_font();
        let midi = build_midi(
            vec![(0, note_on(0, 69, 100)), (480, note_off(0, 69))],
            480,
        );
        let parsed = parse_midi(&midi, &font, 0, 1.0).unwrap();
        for (_, notes) in &parsed.schedule {
            for n in notes {
                assert!(n.start + n.length <= parsed.total_length);
            }
        }
    }

    #[test]
    fn type_2_midi_is_rejected() {
        use midly::{Header, Timing, Format as MFormat};
        let smf = Smf {
            header: Header {
                format: MFormat::Sequential,
                timing: Timing::Metrical(480.into()),
            },
            tracks: vec![vec![]],
        };
        let mut buf = Vec::new();
        smf.write(&mut buf).unwrap();
        let font = trivial_font();
        let err = parse_midi(&buf, &font, 0, 1.0).unwrap_err();
        assert!(matches!(err, SwoodError::UnsupportedMidi(_)));
    }

    #[test]
    fn non_positive_speed_is_rejected() {
        let font = trivial_font();
        let midi = build_midi(vec![(0, note_on(0, 69, 100)), (480, note_off(0, 69))], 480);
        let err = parse_midi(&midi, &font, 0, 0.0).unwrap_err();
        assert!(matches!(err, SwoodError::InvalidArgument(_)));
    }

    #[test]
    fn note_off_without_note_on_warns_and_does_not_panic() {
        let font = trivial_font();
        let midi = build_midi(vec![(0, note_off(0, 69))], 480);
        let err = parse_midi(&midi, &font, 0, 1.0).unwrap_err();
        // No notes ever open + closed -> "no notes" error, not a panic.
        assert!(matches!(err, SwoodError::InvalidArgument(_)));
    }

    #[test]
    fn pitch_bend_splits_an_open_note_into_two_buckets() {
        let font = trivial_font();
        let midi = build_midi(
            vec![
                (0, note_on(0, 60, 100)),
                (240, TrackEventKind::Midi {
                    channel: 0.into(),
                    message: MidlyMessage::PitchBend { bend: (8192u16 + 2048).into() },
                }),
                (480, note_off(0, 60)),
            ],
            480,
        );
        let parsed = parse_midi(&midi, &font, 0, 1.0).unwrap();
        assert_eq!(parsed.schedule.len(), 2);
        let first = &parsed.schedule[0].1[0];
        assert!(first.bend_continuation);
        let second = &parsed.schedule[1].1[0];
        assert!(!second.bend_continuation);
        assert_ne!(first.pitch_hz, second.pitch_hz);
    }

    #[test]
    fn percussion_channel_skips_transpose_and_bend() {
        let font = trivial_font();
        let midi = build_midi(
            vec![(0, note_on(PERCUSSION_CHANNEL, 38, 100)), (480, note_off(PERCUSSION_CHANNEL, 38))],
            480,
        );
        let parsed = parse_midi(&midi, &font, 12, 1.0).unwrap();
        let note = &parsed.schedule[0].1[0];
        assert!(note.percussion);
        assert_eq!(note.pitch_hz, note_to_freq(38, 0.0));
    }

    #[test]
    fn note_to_freq_a4_is_440() {
        assert!((note_to_freq(69, 0.0) - 440.0).abs() < 1e-9);
    }
}
