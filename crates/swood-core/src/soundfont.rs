//! Soundfont adapter: maps MIDI programs and percussion notes to
//! instrument parameters (sample, volume, pan, pitch override, fullclip,
//! noscale).
//!
//! Grounded on `examples/original_source/swood/soundfont.py`'s
//! line-oriented config grammar (`[section]` headers selecting one or
//! more instruments by name/program/percussion-note/special-set, then
//! `key = value` properties mutating every selected instrument) and on
//! `abc::feedback::Feedback`'s `(line, raw_line, message)` diagnostic
//! shape, carried here as `SwoodError::ConfigSyntax`. The Python original
//! gives every selected instrument a *shared* object reference — setting
//! a property under `[all]` mutates the same object a later `[piano]`
//! section would also mutate — so this keeps that aliasing with
//! `Rc<RefCell<Instrument>>` during parsing, then freezes the result into
//! read-only `Arc<Instrument>`s once parsing finishes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, SwoodError};
use crate::gm;
use crate::sample::Sample;

/// Parameters the renderer reads for every instrument a MIDI channel
/// (or percussion note) resolves to.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub fullclip: bool,
    pub noscale: bool,
    pub sample: Option<Arc<Sample>>,
    pub volume: f64,
    pub pan: f64,
    pub pitch_override: Option<f64>,
}

impl Default for Instrument {
    fn default() -> Self {
        Instrument {
            fullclip: false,
            noscale: false,
            sample: None,
            volume: 0.9,
            pan: 0.5,
            pitch_override: None,
        }
    }
}

/// Process-wide knobs a bundle's `[arguments]` section may override.
#[derive(Debug, Clone, Default)]
pub struct SoundFontArguments {
    pub transpose: Option<i32>,
    pub speed: Option<f64>,
    pub cachesize: Option<f64>,
    pub binsize: Option<u32>,
}

/// What both the MIDI parser and the renderer consume: an instrument
/// lookup by MIDI program number or percussion note number.
pub trait InstrumentLookup {
    fn program(&self, program: u8) -> Arc<Instrument>;
    fn percussion(&self, note: u8) -> Arc<Instrument>;
    /// The shared output frame rate every loaded `Sample` was resampled
    /// to (`spec.md` Non-goals: rate unification across sources is this
    /// adapter's job, not the renderer's).
    fn frame_rate(&self) -> u32;
    fn channels(&self) -> usize;
}

pub struct SoundFont {
    programs: Vec<Arc<Instrument>>,
    percussion: HashMap<u8, Arc<Instrument>>,
    frame_rate: u32,
    channels: usize,
    pub arguments: SoundFontArguments,
}

impl InstrumentLookup for SoundFont {
    fn program(&self, program: u8) -> Arc<Instrument> {
        self.programs
            .get(program as usize)
            .cloned()
            .unwrap_or_else(|| Arc::new(Instrument::default()))
    }

    fn percussion(&self, note: u8) -> Arc<Instrument> {
        self.percussion
            .get(&note)
            .cloned()
            .unwrap_or_else(|| Arc::new(Instrument { fullclip: true, noscale: true, ..Instrument::default() }))
    }

    fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }
}

impl SoundFont {
    /// The degenerate soundfont a bare `sample midi output` invocation
    /// builds: every melodic program and every percussion note plays the
    /// one clip (`swood/soundfont.py`'s `DefaultFont`).
    pub fn trivial_default(sample: Arc<Sample>) -> Self {
        let frame_rate = sample.frame_rate();
        let channels = sample.channels();
        let instrument = Arc::new(Instrument {
            sample: Some(sample),
            ..Instrument::default()
        });
        let programs = vec![instrument.clone(); 128];
        let percussion = (35u8..=81).map(|n| (n, instrument.clone())).collect();
        SoundFont {
            programs,
            percussion,
            frame_rate,
            channels,
            arguments: SoundFontArguments::default(),
        }
    }

    /// Parse a bundle: a plain-text config, or a ZIP containing a
    /// `.swood`/`.ini`/`.txt` config plus the WAV samples it references
    /// by relative path.
    pub fn load_bundle(bytes: &[u8], binsize: u32) -> Result<Self> {
        if is_zip(bytes) {
            load_zip(bytes, binsize)
        } else {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| SwoodError::ConfigSyntax { line: 0, raw_line: String::new(), message: "config is not valid UTF-8".into() })?;
            load_text(text, binsize, &HashMap::new())
        }
    }
}

fn is_zip(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[0..4] == b"PK\x03\x04"
}

fn load_zip(bytes: &[u8], binsize: u32) -> Result<SoundFont> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| SwoodError::ConfigSyntax { line: 0, raw_line: String::new(), message: format!("not a valid soundfont bundle: {e}") })?;

    let mut config_text: Option<String> = None;
    let mut wav_files: HashMap<String, Vec<u8>> = HashMap::new();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| SwoodError::ConfigSyntax { line: 0, raw_line: String::new(), message: format!("corrupt bundle entry: {e}") })?;
        let name = entry.name().to_string();
        if entry.is_dir() {
            continue;
        }
        let lower = name.to_lowercase();
        if lower.ends_with(".swood") || lower.ends_with(".ini") || lower.ends_with(".txt") {
            let mut s = String::new();
            entry
                .read_to_string(&mut s)
                .map_err(|e| SwoodError::ConfigSyntax { line: 0, raw_line: String::new(), message: format!("config entry is not UTF-8: {e}") })?;
            config_text = Some(s);
        } else if lower.ends_with(".wav") {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            wav_files.insert(name, buf);
        }
    }

    let config_text = config_text.ok_or_else(|| SwoodError::ConfigSyntax {
        line: 0,
        raw_line: String::new(),
        message: "bundle contains no .swood/.ini/.txt config file".into(),
    })?;

    let mut samples = HashMap::new();
    for (name, bytes) in &wav_files {
        let sample = Sample::from_wav_bytes(bytes, binsize)?;
        samples.insert(name.clone(), Arc::new(sample));
    }

    load_text(&config_text, binsize, &samples)
}

/// Resolved header selection: a set of instrument cells a later property
/// line mutates.
type Cell = Rc<RefCell<Instrument>>;

fn build_instrument_table() -> (Vec<Cell>, HashMap<u8, Cell>, HashMap<String, Vec<Cell>>) {
    let mut programs: Vec<Cell> = Vec::with_capacity(128);
    for _ in 0..128 {
        programs.push(Rc::new(RefCell::new(Instrument::default())));
    }

    let mut percussion: HashMap<u8, Cell> = HashMap::new();
    for note in 35u8..=81 {
        percussion.insert(note, Rc::new(RefCell::new(Instrument { fullclip: true, noscale: true, ..Instrument::default() })));
    }

    let mut by_header: HashMap<String, Vec<Cell>> = HashMap::new();
    for (p, cell) in programs.iter().enumerate() {
        let name = gm::instrument_name(p as u8).to_lowercase();
        by_header.entry(name).or_default().push(cell.clone());
        by_header.entry("non-percussion".into()).or_default().push(cell.clone());
        by_header.entry("all".into()).or_default().push(cell.clone());
    }
    for (&note, cell) in &percussion {
        if let Some(name) = gm::percussion_name(note) {
            by_header.entry(name.to_lowercase()).or_default().push(cell.clone());
        }
        by_header.entry("percussion".into()).or_default().push(cell.clone());
        by_header.entry("all".into()).or_default().push(cell.clone());
    }

    (programs, percussion, by_header)
}

fn resolve_header(
    name: &str,
    programs: &[Cell],
    percussion: &HashMap<u8, Cell>,
    by_header: &HashMap<String, Vec<Cell>>,
) -> Option<Vec<Cell>> {
    match name {
        "default" | "all" => return by_header.get("all").cloned(),
        "non percussion" | "nonpercussion" | "non-percussion" => return by_header.get("non-percussion").cloned(),
        _ => {}
    }
    if let Some(v) = by_header.get(name) {
        return Some(v.clone());
    }
    if let Some(rest) = name.strip_prefix('p') {
        if let Ok(note) = rest.parse::<u8>() {
            if let Some(cell) = percussion.get(&note) {
                return Some(vec![cell.clone()]);
            }
        }
        return None;
    }
    if let Ok(program) = name.parse::<u8>() {
        return programs.get(program as usize).cloned().map(|c| vec![c]);
    }
    None
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => line[..i].trim(),
        None => line.trim(),
    }
}

fn cfg_err(linenum: usize, raw_line: &str, message: impl Into<String>) -> SwoodError {
    SwoodError::ConfigSyntax {
        line: linenum + 1,
        raw_line: raw_line.to_string(),
        message: message.into(),
    }
}

fn parse_bool(value: &str, linenum: usize, raw_line: &str, property: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(cfg_err(linenum, raw_line, format!("'{value}' is not a valid boolean for '{property}'"))),
    }
}

fn apply_argument(args: &mut SoundFontArguments, name: &str, value: &str, linenum: usize, raw_line: &str) -> Result<()> {
    match name {
        "transpose" => {
            args.transpose = Some(value.parse().map_err(|_| cfg_err(linenum, raw_line, format!("'{value}' is not a valid integer")))?);
        }
        "speed" => {
            let speed: f64 = value.parse().map_err(|_| cfg_err(linenum, raw_line, format!("'{value}' is not a valid number")))?;
            if speed <= 0.0 {
                return Err(cfg_err(linenum, raw_line, "speed must be positive"));
            }
            args.speed = Some(speed);
        }
        "cachesize" => {
            args.cachesize = Some(value.parse().map_err(|_| cfg_err(linenum, raw_line, format!("'{value}' is not a valid number")))?);
        }
        "binsize" => {
            let b: u32 = value.parse().map_err(|_| cfg_err(linenum, raw_line, format!("'{value}' is not a valid integer")))?;
            if b < 2 || b % 2 != 0 {
                return Err(cfg_err(linenum, raw_line, "binsize must be even and at least 2"));
            }
            args.binsize = Some(b);
        }
        _ => return Err(cfg_err(linenum, raw_line, format!("'{name}' is not a recognized argument"))),
    }
    Ok(())
}

fn apply_property(
    targets: &[Cell],
    sample_refs: &mut Vec<(Cell, String)>,
    name: &str,
    value: &str,
    linenum: usize,
    raw_line: &str,
) -> Result<()> {
    match name {
        "file" | "sample" => {
            for cell in targets {
                if matches!(value.to_lowercase().as_str(), "" | "none" | "null") {
                    cell.borrow_mut().sample = None;
                } else {
                    sample_refs.push((cell.clone(), value.to_string()));
                }
            }
        }
        "volume" | "vol" => {
            let raw: f64 = value.parse().map_err(|_| cfg_err(linenum, raw_line, format!("'{value}' is not a valid number")))?;
            let vol = raw / 100.0;
            if vol > 0.95 {
                warn!(value, "volumes above 95 may cause clipping or other glitches");
            }
            for cell in targets {
                cell.borrow_mut().volume = vol;
            }
        }
        "pan" => {
            let pan: f64 = value.parse().map_err(|_| cfg_err(linenum, raw_line, format!("'{value}' is not a valid number")))?;
            if !(0.0..=1.0).contains(&pan) {
                return Err(cfg_err(linenum, raw_line, format!("'{value}' is outside of the 0.0-1.0 range")));
            }
            for cell in targets {
                cell.borrow_mut().pan = pan;
            }
        }
        "pitch" => {
            let pitch: f64 = value.parse().map_err(|_| cfg_err(linenum, raw_line, format!("'{value}' is not a valid number")))?;
            if pitch <= 0.0 {
                return Err(cfg_err(linenum, raw_line, format!("'{value}' must be a positive frequency")));
            }
            for cell in targets {
                cell.borrow_mut().pitch_override = Some(pitch);
            }
        }
        "fullclip" => {
            let b = parse_bool(value, linenum, raw_line, "fullclip")?;
            for cell in targets {
                cell.borrow_mut().fullclip = b;
            }
        }
        "noscale" => {
            let b = parse_bool(value, linenum, raw_line, "noscale")?;
            for cell in targets {
                cell.borrow_mut().noscale = b;
            }
        }
        _ => return Err(cfg_err(linenum, raw_line, format!("'{name}' is not a recognized property"))),
    }
    Ok(())
}

fn load_text(config_text: &str, binsize: u32, loaded_samples: &HashMap<String, Arc<Sample>>) -> Result<SoundFont> {
    let (programs, percussion, by_header) = build_instrument_table();

    let mut affected: Option<Vec<Cell>> = None;
    let mut in_arguments = false;
    let mut arguments = SoundFontArguments::default();
    let mut sample_refs: Vec<(Cell, String)> = Vec::new();

    for (i, raw_line) in config_text.lines().enumerate() {
        let text = strip_comment(raw_line);
        if text.is_empty() {
            continue;
        }
        if text.starts_with('[') && text.ends_with(']') {
            let header = text[1..text.len() - 1].trim().to_lowercase();
            if matches!(header.as_str(), "arguments" | "args" | "options") {
                in_arguments = true;
                affected = None;
            } else {
                in_arguments = false;
                affected = Some(
                    resolve_header(&header, &programs, &percussion, &by_header)
                        .ok_or_else(|| cfg_err(i, raw_line, format!("'{header}' is not a recognized instrument, program number, or special set")))?,
                );
            }
            continue;
        }

        let eq = text.find('=').ok_or_else(|| {
            cfg_err(i, raw_line, "line is neither a '[section]' header nor a 'key = value' property")
        })?;
        let name = text[..eq].trim().to_lowercase();
        let value = text[eq + 1..].trim();

        if in_arguments {
            apply_argument(&mut arguments, &name, value, i, raw_line)?;
        } else {
            let targets = affected.as_ref().ok_or_else(|| {
                cfg_err(i, raw_line, "no instrument section active; add a '[default]' line before this one")
            })?;
            apply_property(targets, &mut sample_refs, &name, value, i, raw_line)?;
        }
    }

    let binsize = arguments.binsize.unwrap_or(binsize);

    let mut resolved: HashMap<String, Arc<Sample>> = HashMap::new();
    for (cell, path) in &sample_refs {
        if let Some(sample) = resolved.get(path) {
            cell.borrow_mut().sample = Some(sample.clone());
            continue;
        }
        let sample = if let Some(s) = loaded_samples.get(path) {
            s.clone()
        } else {
            let bytes = std::fs::read(path)
                .map_err(|e| SwoodError::InvalidSample(format!("could not read sample file '{path}': {e}")))?;
            Arc::new(Sample::from_wav_bytes(&bytes, binsize)?)
        };
        resolved.insert(path.clone(), sample.clone());
        cell.borrow_mut().sample = Some(sample);
    }

    let frame_rate = resolved.values().map(|s| s.frame_rate()).max().unwrap_or(44100);
    let channels = resolved.values().map(|s| s.channels()).max().unwrap_or(1);

    let frozen_programs: Vec<Arc<Instrument>> = programs.into_iter().map(|c| Arc::new(c.borrow().clone())).collect();
    let frozen_percussion: HashMap<u8, Arc<Instrument>> =
        percussion.into_iter().map(|(note, c)| (note, Arc::new(c.borrow().clone()))).collect();

    Ok(SoundFont {
        programs: frozen_programs,
        percussion: frozen_percussion,
        frame_rate,
        channels,
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

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

    #[test]
    fn trivial_default_covers_every_program_and_percussion_note() {
        let sample = Arc::new(Sample::from_wav_bytes(&sine_wav_bytes(440.0, 44100), 8192).unwrap());
        let font = SoundFont::trivial_default(sample);
        for p in 0u8..=127 {
            assert!(font.program(p).sample.is_some());
        }
        for n in 35u8..=81 {
            assert!(font.percussion(n).sample.is_some());
            assert!(font.percussion(n).fullclip);
            assert!(font.percussion(n).noscale);
        }
    }

    #[test]
    fn volume_pan_pitch_parse_and_apply_under_default_header() {
        let config = "[default]\nvolume = 80\npan = 0.25\npitch = 220.0\n";
        let font = load_text(config, 8192, &HashMap::new()).unwrap();
        let inst = font.program(5);
        assert!((inst.volume - 0.8).abs() < 1e-9);
        assert!((inst.pan - 0.25).abs() < 1e-9);
        assert_eq!(inst.pitch_override, Some(220.0));
    }

    #[test]
    fn pan_out_of_range_is_a_config_syntax_error() {
        let config = "[default]\npan = 1.5\n";
        let err = load_text(config, 8192, &HashMap::new()).unwrap_err();
        match err {
            SwoodError::ConfigSyntax { line, .. } => assert_eq!(line, 2),
            other => panic!("expected ConfigSyntax, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_header_is_reported_with_line_number() {
        let config = "[nonexistent instrument]\nvolume = 50\n";
        let err = load_text(config, 8192, &HashMap::new()).unwrap_err();
        match err {
            SwoodError::ConfigSyntax { line, .. } => assert_eq!(line, 1),
            other => panic!("expected ConfigSyntax, got {other:?}"),
        }
    }

    #[test]
    fn property_without_preceding_header_is_rejected() {
        let config = "volume = 50\n";
        let err = load_text(config, 8192, &HashMap::new()).unwrap_err();
        assert!(matches!(err, SwoodError::ConfigSyntax { .. }));
    }

    #[test]
    fn percussion_by_name_selects_only_that_note() {
        let config = "[acoustic snare]\nvolume = 100\n";
        let font = load_text(config, 8192, &HashMap::new()).unwrap();
        assert!((font.percussion(38).volume - 1.0).abs() < 1e-9);
        assert!((font.percussion(36).volume - 0.9).abs() < 1e-9);
    }

    #[test]
    fn arguments_section_overrides_render_defaults() {
        let config = "[arguments]\ntranspose = -12\nspeed = 1.5\n";
        let font = load_text(config, 8192, &HashMap::new()).unwrap();
        assert_eq!(font.arguments.transpose, Some(-12));
        assert_eq!(font.arguments.speed, Some(1.5));
    }
}
