use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Batch-resample a finished mono utterance using Rubato's sinc
/// interpolation, medium-quality preset (speech-appropriate).
///
/// The whole buffer is fed through in fixed chunks, the tail via a partial
/// process call, then the filter delay is flushed so the end of the
/// utterance is not truncated.
pub fn resample_mono(samples: &[i16], in_rate: u32, out_rate: u32) -> Result<Vec<i16>, String> {
    if in_rate == out_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 512;
    let params = SincInterpolationParameters {
        sinc_len: 64,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 128,
        window: WindowFunction::Blackman2,
    };
    let mut resampler = SincFixedIn::<f32>::new(
        out_rate as f64 / in_rate as f64,
        2.0,
        params,
        chunk_size,
        1,
    )
    .map_err(|e| format!("resampler construction failed: {e}"))?;

    let as_f32: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
    let mut out = Vec::with_capacity(samples.len() * out_rate as usize / in_rate as usize + 64);

    let mut chunks = as_f32.chunks_exact(chunk_size);
    for chunk in &mut chunks {
        let produced = resampler
            .process(&[chunk.to_vec()], None)
            .map_err(|e| format!("resample failed: {e}"))?;
        out.extend_from_slice(&produced[0]);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let produced = resampler
            .process_partial(Some(&[tail.to_vec()]), None)
            .map_err(|e| format!("resample failed: {e}"))?;
        out.extend_from_slice(&produced[0]);
    }

    // Flush the sinc filter's internal delay.
    let none: Option<&[Vec<f32>]> = None;
    let produced = resampler
        .process_partial(none, None)
        .map_err(|e| format!("resample flush failed: {e}"))?;
    out.extend_from_slice(&produced[0]);

    Ok(out
        .into_iter()
        .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_passthrough() {
        let samples = vec![100i16, -100, 200, -200];
        assert_eq!(resample_mono(&samples, 16_000, 16_000).unwrap(), samples);
    }

    #[test]
    fn downsample_halves_length_approximately() {
        let samples: Vec<i16> = (0..48_000)
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect();
        let out = resample_mono(&samples, 48_000, 16_000).unwrap();
        let expected = samples.len() / 3;
        let tolerance = expected / 10;
        assert!(
            out.len().abs_diff(expected) < tolerance,
            "expected ~{expected}, got {}",
            out.len()
        );
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(resample_mono(&[], 48_000, 16_000).unwrap().is_empty());
    }
}
