//! Decoded PCM sample data and spectral analysis of the instrument clip.
//!
//! The decode half is grounded on `chaosgarden::nodes::audio_file::decode_wav`
//! (`hound::WavReader`, int/float normalization); the normalization and
//! FFT/fundamental-frequency formulas are grounded on
//! `examples/original_source/swood/sample.py`, translated from numpy/pyfftw
//! to `rustfft` (adopted from `twitchax-kord/src/analyze/base.rs`, which is
//! the only FFT consumer in the retrieved pack — `chaosgarden` has no FFT
//! dependency of its own).

use std::io::Cursor;
use std::sync::OnceLock;

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use tracing::warn;

use crate::error::{Result, SwoodError};

/// An averaged magnitude spectrum computed over fixed-size windows of a
/// `Sample`'s PCM (`spec.md` §3 `CalculatedFFT`).
#[derive(Debug, Clone)]
pub struct CalculatedFft {
    /// Magnitude sum across every full window and channel, length `binsize/2`.
    pub avg: Vec<f64>,
    /// Bin spacing in Hz: `frame_rate / binsize`.
    pub spacing: f64,
    /// The bin size this spectrum was actually computed at (may be smaller
    /// than the one requested, if halving was needed to escape silence).
    pub binsize: u32,
}

/// Decoded, normalized, multi-channel PCM for the instrument clip.
///
/// Immutable after construction except for the lazily computed spectral
/// fields (`fft`, `fundamental_freq`), matching `spec.md` §3's lifecycle.
pub struct Sample {
    channels: usize,
    frame_rate: u32,
    length: usize,
    sample_width: u8,
    pcm: Vec<Vec<i32>>,
    requested_binsize: u32,
    fft: OnceLock<CalculatedFft>,
    fundamental: OnceLock<f64>,
    fundamental_override: Option<f64>,
}

/// Target peak amplitude after normalization: `0.9 * 2^31`.
const NORMALIZED_PEAK: f64 = 0.9 * 2147483648.0;

impl Sample {
    /// Decode a WAV byte stream into a normalized `Sample`.
    ///
    /// `binsize` seeds the analyzer's initial FFT window; it is not used
    /// at decode time, only remembered for `fft()`/`fundamental_freq()`.
    pub fn from_wav_bytes(bytes: &[u8], binsize: u32) -> Result<Self> {
        let cursor = Cursor::new(bytes);
        let reader = hound::WavReader::new(cursor)
            .map_err(|e| SwoodError::InvalidSample(format!("unreadable WAV: {e}")))?;

        let spec = reader.spec();
        let channels = spec.channels as usize;
        let frame_rate = spec.sample_rate;
        let sample_width = (spec.bits_per_sample / 8).max(1) as u8;

        if spec.bits_per_sample > 32 {
            return Err(SwoodError::InvalidSample(format!(
                "unsupported bit depth: {} bits (max 32)",
                spec.bits_per_sample
            )));
        }
        if channels == 0 {
            return Err(SwoodError::InvalidSample("sample has no channels".into()));
        }

        let interleaved: Vec<i64> = match spec.sample_format {
            hound::SampleFormat::Int => reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as i64))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| SwoodError::InvalidSample(format!("failed to read samples: {e}")))?,
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .map(|s| s.map(|v| (v * i32::MAX as f32) as i64))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| SwoodError::InvalidSample(format!("failed to read samples: {e}")))?,
        };

        let length = interleaved.len() / channels;
        if length == 0 {
            return Err(SwoodError::InvalidSample("sample has no frames".into()));
        }

        let mut raw: Vec<Vec<i64>> = vec![Vec::with_capacity(length); channels];
        for (i, v) in interleaved.into_iter().enumerate() {
            raw[i % channels].push(v);
        }

        let peak = raw
            .iter()
            .flat_map(|chan| chan.iter())
            .map(|&v| v.unsigned_abs())
            .max()
            .unwrap_or(0);

        if peak == 0 {
            return Err(SwoodError::InvalidSample(
                "sample is silent (peak amplitude is zero)".into(),
            ));
        }

        let volume_mult = NORMALIZED_PEAK / peak as f64;
        let pcm: Vec<Vec<i32>> = raw
            .into_iter()
            .map(|chan| {
                chan.into_iter()
                    .map(|v| (v as f64 * volume_mult).round() as i32)
                    .collect()
            })
            .collect();

        Ok(Sample {
            channels,
            frame_rate,
            length,
            sample_width,
            pcm,
            requested_binsize: binsize,
            fft: OnceLock::new(),
            fundamental: OnceLock::new(),
            fundamental_override: None,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn sample_width(&self) -> u8 {
        self.sample_width
    }

    pub fn pcm(&self) -> &[Vec<i32>] {
        &self.pcm
    }

    /// Override the fundamental frequency a soundfont's `pitch` property
    /// supplies, bypassing spectral analysis entirely.
    pub fn set_fundamental_override(&mut self, hz: f64) {
        self.fundamental_override = Some(hz);
    }

    /// Compute (or return the cached) averaged magnitude spectrum.
    ///
    /// Halves the bin size and retries when a window yields an all-zero
    /// spectrum, per `spec.md` §4.1; fails with `InvalidSample` once the
    /// bin size drops below 2.
    pub fn fft(&self) -> Result<&CalculatedFft> {
        if let Some(fft) = self.fft.get() {
            return Ok(fft);
        }
        let computed = compute_fft_with_halving(&self.pcm, self.frame_rate, self.requested_binsize)?;
        Ok(self.fft.get_or_init(|| computed))
    }

    /// The sample's fundamental frequency (`spec.md` §3 `FundamentalFreq`),
    /// or a soundfont-supplied override if one was set.
    pub fn fundamental_freq(&self) -> Result<f64> {
        if let Some(hz) = self.fundamental_override {
            return Ok(hz);
        }
        if let Some(&hz) = self.fundamental.get() {
            return Ok(hz);
        }
        let fft = self.fft()?;
        let hz = fundamental_from_fft(fft);
        Ok(*self.fundamental.get_or_init(|| hz))
    }
}

/// `argmax(avg[1..]) * spacing + spacing/2`, excluding the DC bin.
fn fundamental_from_fft(fft: &CalculatedFft) -> f64 {
    let (idx, _) = fft.avg[1..]
        .iter()
        .enumerate()
        .fold((0usize, f64::MIN), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) });
    idx as f64 * fft.spacing + fft.spacing / 2.0
}

fn compute_fft_with_halving(pcm: &[Vec<i32>], frame_rate: u32, requested_binsize: u32) -> Result<CalculatedFft> {
    let mut binsize = requested_binsize;
    if binsize % 2 != 0 {
        warn!(binsize, "bin size must be a multiple of 2, correcting automatically");
        binsize += 1;
    }

    loop {
        if binsize < 2 {
            return Err(SwoodError::InvalidSample(
                "sample is effectively silent at every bin size tried".into(),
            ));
        }

        let b = binsize as usize;
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(b);
        let mut avg = vec![0.0f64; b / 2];

        for channel in pcm {
            let mut i = 0;
            while i + b <= channel.len() {
                let mut buffer: Vec<Complex<f64>> =
                    channel[i..i + b].iter().map(|&s| Complex::new(s as f64, 0.0)).collect();
                fft.process(&mut buffer);
                for (bin, c) in buffer.iter().take(b / 2).enumerate() {
                    avg[bin] += c.norm();
                }
                i += b;
            }
        }

        if avg.iter().all(|&v| v == 0.0) {
            warn!(
                old_binsize = binsize,
                new_binsize = binsize / 2,
                "bin size is too large to analyze sample; dividing by 2 and trying again"
            );
            binsize /= 2;
            continue;
        }

        let spacing = frame_rate as f64 / binsize as f64;
        return Ok(CalculatedFft { avg, spacing, binsize });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sine_wav(frequency: f64, seconds: f64, frame_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: frame_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            let n = (frame_rate as f64 * seconds) as usize;
            for i in 0..n {
                let t = i as f64 / frame_rate as f64;
                let v = (2.0 * PI * frequency * t).sin() * i16::MAX as f64 * 0.8;
                writer.write_sample(v as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decodes_mono_16_bit_wav() {
        let wav = sine_wav(440.0, 0.1, 44100);
        let sample = Sample::from_wav_bytes(&wav, 8192).unwrap();
        assert_eq!(sample.channels(), 1);
        assert_eq!(sample.frame_rate(), 44100);
        assert_eq!(sample.length(), 4410);
    }

    #[test]
    fn rejects_silent_sample() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..1000 {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        let err = Sample::from_wav_bytes(&cursor.into_inner(), 512).unwrap_err();
        assert!(matches!(err, SwoodError::InvalidSample(_)));
    }

    #[test]
    fn pure_tone_fundamental_matches_scenario_1() {
        // End-to-end scenario 1: 440 Hz sine, 44100 Hz, 2s, binsize 8192.
        let wav = sine_wav(440.0, 2.0, 44100);
        let sample = Sample::from_wav_bytes(&wav, 8192).unwrap();
        let spacing = 44100.0 / 8192.0;
        let fundamental = sample.fundamental_freq().unwrap();
        assert!(
            (fundamental - 440.0).abs() <= spacing / 2.0 + 1e-6,
            "fundamental {fundamental} not within {spacing} of 440"
        );
    }

    #[test]
    fn fundamental_override_bypasses_analysis() {
        let wav = sine_wav(440.0, 0.2, 44100);
        let mut sample = Sample::from_wav_bytes(&wav, 8192).unwrap();
        sample.set_fundamental_override(261.63);
        assert_eq!(sample.fundamental_freq().unwrap(), 261.63);
    }

    #[test]
    fn spacing_times_binsize_equals_frame_rate() {
        let wav = sine_wav(220.0, 0.5, 44100);
        let sample = Sample::from_wav_bytes(&wav, 2048).unwrap();
        let fft = sample.fft().unwrap();
        assert!((fft.spacing * fft.binsize as f64 - 44100.0).abs() < 1e-6);
    }
}
