//! Pitch/rate-ratio resampling for note synthesis.
//!
//! The original implementation zooms a PIL image by a multiplier (PIL's
//! BICUBIC resize applied to the PCM treated as an image) to change a
//! clip's pitch. `spec.md` §9 explicitly allows substituting "a polyphase
//! resampler provided the spectral test scenario remains within
//! tolerance" — this uses `rubato`'s windowed-sinc interpolator as that
//! substitute. No crate in the retrieved pack performs resampling; `rubato`
//! is adopted fresh as a genuine, commonly used resampling crate, per the
//! "enrich from the rest of the pack" rule for capabilities the teacher
//! never needed.

use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

use crate::error::{Result, SwoodError};

/// Resample every channel of `pcm` by `ratio` (`output_len ≈ input_len *
/// ratio`).
///
/// `ratio == 1.0` is a cheap no-op copy, used for `noscale` instruments
/// and percussion notes, which never change pitch.
pub fn resample_by_ratio(pcm: &[Vec<i32>], ratio: f64) -> Result<Vec<Vec<i32>>> {
    if pcm.is_empty() || pcm[0].is_empty() {
        return Ok(pcm.to_vec());
    }
    if (ratio - 1.0).abs() < f64::EPSILON {
        return Ok(pcm.to_vec());
    }
    if ratio <= 0.0 {
        return Err(SwoodError::InvalidArgument(format!(
            "resample ratio must be positive, got {ratio}"
        )));
    }

    let channels = pcm.len();
    let input_len = pcm[0].len();

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        oversampling_factor: 256,
        interpolation: SincInterpolationType::Cubic,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f64>::new(ratio, 2.0, params, input_len, channels)
        .map_err(|e| SwoodError::InternalInconsistency(format!("resampler setup failed: {e}")))?;

    let waves_in: Vec<Vec<f64>> = pcm
        .iter()
        .map(|chan| chan.iter().map(|&s| s as f64).collect())
        .collect();

    let waves_out = resampler
        .process(&waves_in, None)
        .map_err(|e| SwoodError::InternalInconsistency(format!("resample failed: {e}")))?;

    Ok(waves_out
        .into_iter()
        .map(|chan| {
            chan.into_iter()
                .map(|s| s.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_one_is_identity() {
        let pcm = vec![vec![1, 2, 3, 4, 5]];
        let out = resample_by_ratio(&pcm, 1.0).unwrap();
        assert_eq!(out, pcm);
    }

    #[test]
    fn upsampling_lengthens_every_channel() {
        let wave: Vec<i32> = (0..4096).map(|i| ((i as f64 * 0.05).sin() * 10000.0) as i32).collect();
        let pcm = vec![wave.clone(), wave];
        let out = resample_by_ratio(&pcm, 2.0).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].len() > pcm[0].len());
        assert!(out[1].len() > pcm[1].len());
    }

    #[test]
    fn downsampling_shortens_every_channel() {
        let wave: Vec<i32> = (0..4096).map(|i| ((i as f64 * 0.05).sin() * 10000.0) as i32).collect();
        let pcm = vec![wave];
        let out = resample_by_ratio(&pcm, 0.5).unwrap();
        assert!(out[0].len() < pcm[0].len());
    }

    #[test]
    fn rejects_non_positive_ratio() {
        let pcm = vec![vec![1, 2, 3]];
        let err = resample_by_ratio(&pcm, 0.0).unwrap_err();
        assert!(matches!(err, SwoodError::InvalidArgument(_)));
    }
}
