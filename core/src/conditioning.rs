//! Conditioning of a single channel's time series ahead of a Q-scan.
//!
//! The pipeline is: optional resampling → optional Butterworth high-pass
//! → whitening against the series' own amplitude spectral density.  The
//! whitened series is what the tile transform searches; the high-passed
//! (but not whitened) series feeds the secondary "raw" tiling used for
//! visual comparison.
//!
//! Every function here is a pure transform of its inputs: identical input
//! produces bit-identical output.

use log::debug;

use crate::fft::RealFft;
use crate::filter::{detrend_linear, hann, FilterError, SosFilter};
use crate::types::TimeSeries;

/// Order of the high-pass Butterworth filter.
pub const HIGHPASS_ORDER: usize = 12;

/// The high-pass corner sits this factor below the requested low frequency.
pub const HIGHPASS_CORNER_RATIO: f64 = 1.5;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while conditioning a series.
#[derive(Debug, thiserror::Error)]
pub enum ConditioningError {
    #[error("cannot condition empty series '{0}'")]
    EmptySeries(String),

    #[error("series '{name}' contains {count} non-finite samples")]
    NonFinite { name: String, count: usize },

    #[error("FFT length {fftlength} s must be positive and no longer than the series ({duration} s)")]
    BadFftLength { fftlength: f64, duration: f64 },

    #[error("overlap {overlap} s must be non-negative and shorter than the FFT length ({fftlength} s)")]
    BadOverlap { overlap: f64, fftlength: f64 },

    #[error("resample rate must be positive, got {0} Hz")]
    BadResampleRate(f64),

    #[error("high-pass filter: {0}")]
    Filter(#[from] FilterError),

    #[error("FFT failure: {0}")]
    Fft(String),
}

impl From<realfft::FftError> for ConditioningError {
    fn from(err: realfft::FftError) -> Self {
        Self::Fft(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Conditioned output
// ---------------------------------------------------------------------------

/// Intermediate data products of [`condition`].
#[derive(Clone, Debug)]
pub struct Conditioned {
    /// Zero-mean, unit-variance whitened series.
    pub whitened: TimeSeries,

    /// High-passed series, present when a low-frequency cutoff was given.
    pub highpassed: Option<TimeSeries>,

    /// The input after (optional) resampling.
    pub resampled: TimeSeries,
}

impl Conditioned {
    /// The series used for the non-whitened tiling: the high-passed series
    /// if there is one, otherwise the resampled input.
    pub fn unwhitened(&self) -> &TimeSeries {
        self.highpassed.as_ref().unwrap_or(&self.resampled)
    }
}

/// Condition `series` for an Omega scan.
///
/// # Arguments
/// * `fftlength`: FFT integration length (s) for ASD estimation.
/// * `overlap`: overlap (s) between FFTs, defaults to `fftlength / 2`.
/// * `resample`: output sampling rate (Hz), if different from the input.
/// * `f_low`: low-frequency cutoff (Hz); enables the high-pass stage.
pub fn condition(
    series: &TimeSeries,
    fftlength: f64,
    overlap: Option<f64>,
    resample: Option<f64>,
    f_low: Option<f64>,
) -> Result<Conditioned, ConditioningError> {
    check_samples(series)?;

    let resampled = match resample {
        Some(rate) => self::resample(series, rate)?,
        None => series.clone(),
    };

    match f_low {
        Some(f_low) => {
            let highpassed = highpass(&resampled, f_low)?;
            let whitened = whiten(&highpassed, fftlength, overlap)?;
            Ok(Conditioned {
                whitened,
                highpassed: Some(highpassed),
                resampled,
            })
        }
        None => {
            let whitened = whiten(&resampled, fftlength, overlap)?;
            Ok(Conditioned {
                whitened,
                highpassed: None,
                resampled,
            })
        }
    }
}

fn check_samples(series: &TimeSeries) -> Result<(), ConditioningError> {
    if series.is_empty() {
        return Err(ConditioningError::EmptySeries(series.name.clone()));
    }
    let count = series.data.iter().filter(|v| !v.is_finite()).count();
    if count > 0 {
        return Err(ConditioningError::NonFinite {
            name: series.name.clone(),
            count,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Resampling
// ---------------------------------------------------------------------------

/// Resample `series` to `rate` Hz in the Fourier domain.
///
/// Downsampling discards every component above the new Nyquist frequency;
/// a series already at `rate` is returned unchanged.
pub fn resample(series: &TimeSeries, rate: f64) -> Result<TimeSeries, ConditioningError> {
    if !(rate > 0.0) || !rate.is_finite() {
        return Err(ConditioningError::BadResampleRate(rate));
    }
    if (rate - series.sample_rate).abs() <= f64::EPSILON * series.sample_rate {
        return Ok(series.clone());
    }
    if series.is_empty() {
        return Err(ConditioningError::EmptySeries(series.name.clone()));
    }

    let n = series.len();
    let m = ((n as f64) * rate / series.sample_rate).round() as usize;
    if m < 2 {
        return Err(ConditioningError::BadResampleRate(rate));
    }
    debug!("Resampling {} from {} Hz to {} Hz", series.name, series.sample_rate, rate);

    let spectrum = RealFft::new(n).forward(&series.data)?;
    let out_fft = RealFft::new(m);
    let scale = m as f64 / n as f64;
    let mut out_spectrum = vec![Default::default(); out_fft.spectrum_len()];
    for (dst, src) in out_spectrum.iter_mut().zip(spectrum.iter()) {
        *dst = *src * scale;
    }
    let data = out_fft.inverse(out_spectrum)?;

    Ok(TimeSeries {
        name: series.name.clone(),
        t0: series.t0,
        sample_rate: rate,
        data,
    })
}

// ---------------------------------------------------------------------------
// High-pass
// ---------------------------------------------------------------------------

/// High-pass `series` with a zero-phase Butterworth filter whose corner is
/// `f_low / 1.5`.
pub fn highpass(series: &TimeSeries, f_low: f64) -> Result<TimeSeries, ConditioningError> {
    let corner = f_low / HIGHPASS_CORNER_RATIO;
    let filt = SosFilter::butterworth_highpass(HIGHPASS_ORDER, corner, series.sample_rate)?;
    Ok(series.with_data(filt.filtfilt(&series.data)?))
}

// ---------------------------------------------------------------------------
// Spectral density & whitening
// ---------------------------------------------------------------------------

/// One-sided amplitude spectral density on a uniform frequency grid.
#[derive(Clone, Debug)]
pub struct Asd {
    /// Frequency spacing in Hz; bin `k` sits at `k * df`.
    pub df: f64,
    pub values: Vec<f64>,
}

impl Asd {
    /// Linearly interpolated ASD at `freq`, clamped to the grid.
    pub fn at(&self, freq: f64) -> f64 {
        let pos = freq / self.df;
        let last = self.values.len() - 1;
        if pos <= 0.0 {
            return self.values[0];
        }
        let lo = pos.floor() as usize;
        if lo >= last {
            return self.values[last];
        }
        let frac = pos - lo as f64;
        self.values[lo] * (1.0 - frac) + self.values[lo + 1] * frac
    }
}

/// Bias of the median of `n` chi-squared (2 dof) estimates relative to
/// their mean.
fn median_bias(n: usize) -> f64 {
    let half = (n.saturating_sub(1)) / 2;
    1.0 + (1..=half)
        .map(|i| {
            let ii = 2.0 * i as f64;
            1.0 / (ii + 1.0) - 1.0 / ii
        })
        .sum::<f64>()
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

fn fft_samples(series: &TimeSeries, fftlength: f64, overlap: f64) -> Result<(usize, usize), ConditioningError> {
    let duration = series.duration();
    if !(fftlength > 0.0) || fftlength > duration {
        return Err(ConditioningError::BadFftLength { fftlength, duration });
    }
    if !(overlap >= 0.0) || overlap >= fftlength {
        return Err(ConditioningError::BadOverlap { overlap, fftlength });
    }
    let nfft = ((fftlength * series.sample_rate).round() as usize).min(series.len());
    let noverlap = (overlap * series.sample_rate).round() as usize;
    if nfft < 2 {
        return Err(ConditioningError::BadFftLength { fftlength, duration });
    }
    Ok((nfft, noverlap.min(nfft - 1)))
}

/// Median-averaged Welch estimate of the ASD of `series`.
///
/// Each segment is linearly detrended and Hann-windowed; the per-bin
/// median across segments is corrected for its bias with respect to the
/// mean.
pub fn asd(series: &TimeSeries, fftlength: f64, overlap: f64) -> Result<Asd, ConditioningError> {
    let (nfft, noverlap) = fft_samples(series, fftlength, overlap)?;
    let step = nfft - noverlap;
    let nseg = (series.len() - nfft) / step + 1;

    let window = hann(nfft);
    let window_power: f64 = window.iter().map(|w| w * w).sum();
    let fft = RealFft::new(nfft);
    let nbins = fft.spectrum_len();

    let mut periodograms: Vec<Vec<f64>> = vec![Vec::with_capacity(nseg); nbins];
    for seg in 0..nseg {
        let start = seg * step;
        let detrended = detrend_linear(&series.data[start..start + nfft]);
        let windowed: Vec<f64> = detrended.iter().zip(&window).map(|(x, w)| x * w).collect();
        let spectrum = fft.forward(&windowed)?;
        for (k, bin) in spectrum.iter().enumerate() {
            let one_sided = if k == 0 || (nfft % 2 == 0 && k == nbins - 1) { 1.0 } else { 2.0 };
            periodograms[k].push(one_sided * bin.norm_sqr() / (series.sample_rate * window_power));
        }
    }

    let bias = median_bias(nseg);
    let values = periodograms
        .iter_mut()
        .map(|bin| (median(bin) / bias).sqrt())
        .collect();

    Ok(Asd {
        df: series.sample_rate / nfft as f64,
        values,
    })
}

/// Whiten `series` against its own ASD.
///
/// The result has zero mean and unit variance (away from the tapered
/// edges), the same rate and span as the input, and no residual linear
/// trend.
pub fn whiten(series: &TimeSeries, fftlength: f64, overlap: Option<f64>) -> Result<TimeSeries, ConditioningError> {
    check_samples(series)?;
    let overlap = overlap.unwrap_or(fftlength / 2.0);
    let spectrum_asd = asd(series, fftlength, overlap)?;

    let n = series.len();
    let fs = series.sample_rate;
    let mut data = detrend_linear(&series.data);

    // Taper the edges over half an FFT length to suppress wrap-around.
    let ntaper = ((fftlength * fs / 2.0).round() as usize).min(n / 2);
    let edge = hann(2 * ntaper);
    for i in 0..ntaper {
        data[i] *= edge[i];
        data[n - 1 - i] *= edge[i];
    }

    let fft = RealFft::new(n);
    let mut spectrum = fft.forward(&data)?;
    let df = fs / n as f64;
    for (k, bin) in spectrum.iter_mut().enumerate() {
        let amp = spectrum_asd.at(k as f64 * df);
        if k == 0 || !(amp > 0.0) || !amp.is_finite() {
            *bin = Default::default();
        } else {
            *bin /= amp;
        }
    }
    let norm = (2.0 / fs).sqrt();
    let whitened: Vec<f64> = fft.inverse(spectrum)?.into_iter().map(|v| v * norm).collect();

    Ok(series.with_data(detrend_linear(&whitened)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn noise(seed: u64, fs: f64, duration: f64, mean: f64, sigma: f64) -> TimeSeries {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Normal::new(mean, sigma).unwrap();
        let n = (fs * duration) as usize;
        TimeSeries::new("X1:TEST-NOISE", -duration / 2.0, fs, (0..n).map(|_| dist.sample(&mut rng)).collect())
    }

    #[test]
    fn test_median_bias_limits() {
        assert_eq!(median_bias(1), 1.0);
        assert!((median_bias(2) - 1.0).abs() < 1e-12);
        // Converges to ln 2 for many segments.
        assert!((median_bias(10001) - std::f64::consts::LN_2).abs() < 1e-3);
    }

    #[test]
    fn test_asd_of_white_noise_is_flat() {
        let fs = 1024.0;
        let ts = noise(7, fs, 64.0, 0.0, 2.0);
        let asd = asd(&ts, 4.0, 2.0).unwrap();
        let expected = 2.0 * (2.0 / fs).sqrt();
        let band = &asd.values[100..1900];
        let mean = band.iter().sum::<f64>() / band.len() as f64;
        assert!((mean / expected - 1.0).abs() < 0.05, "mean ASD {} vs {}", mean, expected);
    }

    #[test]
    fn test_whiten_gives_unit_variance() {
        let ts = noise(11, 2048.0, 64.0, 5.0, 0.3);
        let white = whiten(&ts, 8.0, None).unwrap();
        assert_eq!(white.len(), ts.len());
        assert_eq!(white.t0, ts.t0);

        let core = white.crop(-24.0, 24.0);
        assert!(core.mean().abs() < 0.02, "mean {}", core.mean());
        assert!((core.std() - 1.0).abs() < 0.05, "std {}", core.std());
    }

    #[test]
    fn test_condition_is_deterministic() {
        let ts = noise(3, 1024.0, 32.0, 0.0, 1.0);
        let a = condition(&ts, 4.0, None, Some(512.0), Some(8.0)).unwrap();
        let b = condition(&ts, 4.0, None, Some(512.0), Some(8.0)).unwrap();
        assert_eq!(a.whitened.data, b.whitened.data);
        assert_eq!(a.highpassed, b.highpassed);
    }

    #[test]
    fn test_condition_with_highpass() {
        let ts = noise(5, 1024.0, 32.0, 10.0, 1.0);
        let out = condition(&ts, 4.0, None, Some(512.0), Some(4.0)).unwrap();
        assert_eq!(out.resampled.sample_rate, 512.0);
        assert_eq!(out.resampled.len(), 512 * 32);
        let hp = out.highpassed.as_ref().unwrap();
        assert_eq!(hp.len(), out.resampled.len());
        assert!(hp.mean().abs() < 0.05);
        assert_eq!(out.whitened.sample_rate, 512.0);
        assert!(std::ptr::eq(out.unwhitened(), hp));
    }

    #[test]
    fn test_resample_preserves_tone() {
        let fs = 1024.0;
        let data: Vec<f64> = (0..4096)
            .map(|i| (2.0 * std::f64::consts::PI * 16.0 * i as f64 / fs).sin())
            .collect();
        let ts = TimeSeries::new("X1:TONE", 0.0, fs, data);
        let down = resample(&ts, 256.0).unwrap();
        assert_eq!(down.len(), 1024);
        for (i, v) in down.data.iter().enumerate() {
            let expected = (2.0 * std::f64::consts::PI * 16.0 * i as f64 / 256.0).sin();
            assert!((v - expected).abs() < 1e-9);
        }
        let same = resample(&ts, fs).unwrap();
        assert_eq!(same, ts);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let ts = noise(1, 256.0, 8.0, 0.0, 1.0);
        assert!(matches!(
            condition(&ts, 16.0, None, None, None),
            Err(ConditioningError::BadFftLength { .. })
        ));
        assert!(matches!(
            condition(&ts, 2.0, None, Some(0.0), None),
            Err(ConditioningError::BadResampleRate(_))
        ));

        let mut bad = ts.clone();
        bad.data[100] = f64::NAN;
        bad.data[200] = f64::INFINITY;
        assert!(matches!(
            condition(&bad, 2.0, None, None, Some(4.0)),
            Err(ConditioningError::NonFinite { count: 2, .. })
        ));
    }
}
