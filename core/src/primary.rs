//! Primary-channel matched filter.
//!
//! The primary channel (usually calibrated strain) is conditioned once per
//! run, cropped to a short window around the trigger and tapered.  Every
//! auxiliary channel that passes the significance gate is then correlated
//! against this template to measure how closely, and with what delay, it
//! follows the primary.

use log::info;

use crate::conditioning::{self, condition, ConditioningError};
use crate::fft::{next_power_of_two, RealFft};
use crate::filter::{auto_taper_lengths, hann, planck};
use crate::types::{round_dp, CorrelationFeatures, TimeSeries};

/// Errors raised while building the template or correlating against it.
#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("conditioning failed: {0}")]
    Conditioning(#[from] ConditioningError),

    #[error("incompatible series: {0}")]
    IncompatibleSeries(String),

    #[error("matched-filter window [{start}, {end}) is not covered by '{channel}'")]
    WindowNotCovered { channel: String, start: f64, end: f64 },

    #[error("FFT failure: {0}")]
    Fft(String),
}

impl From<realfft::FftError> for CorrelationError {
    fn from(err: realfft::FftError) -> Self {
        Self::Fft(err.to_string())
    }
}

/// The conditioned primary channel, ready to be used as a matched filter.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimaryTemplate {
    pub channel: String,
    /// Whitened, cropped and Planck-tapered samples.
    pub series: TimeSeries,
    pub gps: f64,
    /// Nominal template length in seconds.
    pub length: f64,
}

/// Condition `raw` and cut the matched filter `[gps - length/2, gps + length/2)`
/// out of the whitened series.
///
/// Both edges are Planck-tapered up to the first (and from the last) local
/// extremum so the template starts and ends at zero.
pub fn build_primary(
    gps: f64,
    length: f64,
    raw: &TimeSeries,
    fftlength: f64,
    resample: Option<f64>,
    f_low: Option<f64>,
) -> Result<PrimaryTemplate, CorrelationError> {
    let conditioned = condition(raw, fftlength, None, resample, f_low)?;
    let (start, end) = (gps - length / 2.0, gps + length / 2.0);
    let span = conditioned.whitened.span();
    let cropped = conditioned.whitened.crop(start, end);
    if !(length > 0.0) || start < span.start || end > span.end || cropped.len() < 3 {
        return Err(CorrelationError::WindowNotCovered {
            channel: raw.name.clone(),
            start,
            end,
        });
    }

    let (nleft, nright) = auto_taper_lengths(&cropped.data);
    let window = planck(cropped.len(), nleft, nright);
    let tapered: Vec<f64> = cropped.data.iter().zip(&window).map(|(x, w)| x * w).collect();

    info!(
        "Built {:.3} s matched filter from {} at {} Hz",
        length,
        raw.name,
        cropped.sample_rate
    );

    Ok(PrimaryTemplate {
        channel: raw.name.clone(),
        series: cropped.with_data(tapered),
        gps,
        length,
    })
}

fn rates_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

/// Single-phase matched filter of `xoft` against `template`.
///
/// The higher-rate of the two series is first downsampled to the lower
/// rate.  The template is Hann-windowed and normalised to unit L2 norm;
/// sample `n` of the output is the inner product of `xoft` with the
/// template centred on sample `n`.  The output shares the span and rate of
/// (the possibly resampled) `xoft`.
pub fn cross_correlate(xoft: &TimeSeries, template: &TimeSeries) -> Result<TimeSeries, CorrelationError> {
    if xoft.is_empty() || template.is_empty() {
        return Err(CorrelationError::IncompatibleSeries(format!(
            "empty input ('{}': {} samples, template: {} samples)",
            xoft.name,
            xoft.len(),
            template.len()
        )));
    }

    let (x, h) = if template.sample_rate < xoft.sample_rate && !rates_match(template.sample_rate, xoft.sample_rate) {
        (conditioning::resample(xoft, template.sample_rate)?, template.clone())
    } else if template.sample_rate > xoft.sample_rate && !rates_match(template.sample_rate, xoft.sample_rate) {
        (xoft.clone(), conditioning::resample(template, xoft.sample_rate)?)
    } else {
        (xoft.clone(), template.clone())
    };
    if !rates_match(x.sample_rate, h.sample_rate) {
        return Err(CorrelationError::IncompatibleSeries(format!(
            "sample rates {} Hz and {} Hz disagree after resampling",
            x.sample_rate, h.sample_rate
        )));
    }

    let (n, m) = (x.len(), h.len());
    if m > n {
        return Err(CorrelationError::IncompatibleSeries(format!(
            "template ({} samples) is longer than '{}' ({} samples)",
            m, x.name, n
        )));
    }

    let window = hann(m);
    let mut kernel: Vec<f64> = h.data.iter().zip(&window).map(|(v, w)| v * w).collect();
    let norm = kernel.iter().map(|v| v * v).sum::<f64>().sqrt();
    if !(norm > 0.0) {
        return Err(CorrelationError::IncompatibleSeries("template has zero norm".into()));
    }
    for v in kernel.iter_mut() {
        *v /= norm;
    }

    let padded = next_power_of_two((n + m) as f64);
    let fft = RealFft::new(padded);
    let mut xbuf = x.data.clone();
    xbuf.resize(padded, 0.0);
    kernel.resize(padded, 0.0);
    let xs = fft.forward(&xbuf)?;
    let hs = fft.forward(&kernel)?;
    let product = xs.iter().zip(&hs).map(|(a, b)| a * b.conj()).collect();
    let lags = fft.inverse(product)?;

    let centre = m / 2;
    let data = (0..n).map(|i| lags[(i + padded - centre) % padded]).collect();
    Ok(x.with_data(data))
}

/// Summarise a correlation series around the trigger.
///
/// `peak` is the largest `|correlation|` within `gps ± dt`, `delay_ms` its
/// offset from `gps` truncated to whole milliseconds and `stdev` the
/// standard deviation of the whole series.
pub fn correlation_features(corr: &TimeSeries, gps: f64, dt: f64) -> Result<CorrelationFeatures, CorrelationError> {
    let window = corr.crop(gps - dt, gps + dt);
    let idx = window.argmax_abs().ok_or_else(|| {
        CorrelationError::IncompatibleSeries(format!(
            "correlation of '{}' does not cover {} ± {} s",
            corr.name, gps, dt
        ))
    })?;
    let delay = window.time_at(idx) - gps;
    Ok(CorrelationFeatures {
        peak: round_dp(window.data[idx].abs(), 1),
        stdev: corr.std(),
        delay_ms: (delay * 1000.0).trunc() as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn noise(name: &str, seed: u64, fs: f64, t0: f64, duration: f64) -> TimeSeries {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Normal::new(0.0, 1.0).unwrap();
        let n = (fs * duration) as usize;
        TimeSeries::new(name, t0, fs, (0..n).map(|_| dist.sample(&mut rng)).collect())
    }

    #[test]
    fn test_downsamples_the_faster_series() {
        let xoft = noise("X1:AUX", 1, 4096.0, -4.0, 8.0);
        let template = noise("X1:PRIMARY", 2, 2048.0, -0.5, 1.0);
        let out = cross_correlate(&xoft, &template).unwrap();
        assert_eq!(out.sample_rate, 2048.0);
        assert_eq!(out.len(), 2048 * 8);
        assert_eq!(out.t0, xoft.t0);

        let fast_template = noise("X1:PRIMARY", 3, 4096.0, -0.5, 1.0);
        let slow = noise("X1:AUX", 4, 2048.0, -4.0, 8.0);
        let out = cross_correlate(&slow, &fast_template).unwrap();
        assert_eq!(out.sample_rate, 2048.0);
    }

    #[test]
    fn test_equal_rates_are_not_resampled() {
        let xoft = noise("X1:AUX", 5, 512.0, 0.0, 4.0);
        let template = xoft.crop(1.5, 2.5);
        let out = cross_correlate(&xoft, &template).unwrap();
        assert_eq!(out.sample_rate, 512.0);
        assert_eq!(out.len(), xoft.len());
    }

    #[test]
    fn test_self_correlation_peaks_at_template_centre() {
        let xoft = noise("X1:AUX", 6, 256.0, 0.0, 8.0);
        let template = xoft.crop(3.5, 4.5);
        let corr = cross_correlate(&xoft, &template).unwrap();

        // The template centre is at t = 4.0, i.e. sample 1024.
        assert_eq!(corr.argmax_abs(), Some(1024));

        // Direct evaluation of the same sample.
        let window = hann(template.len());
        let kernel: Vec<f64> = template.data.iter().zip(&window).map(|(v, w)| v * w).collect();
        let norm = kernel.iter().map(|v| v * v).sum::<f64>().sqrt();
        let direct: f64 = kernel
            .iter()
            .enumerate()
            .map(|(k, h)| xoft.data[1024 - 128 + k] * h / norm)
            .sum();
        assert_relative_eq!(corr.data[1024], direct, epsilon = 1e-9);
    }

    #[test]
    fn test_incompatible_inputs() {
        let xoft = noise("X1:AUX", 7, 256.0, 0.0, 1.0);
        let long = noise("X1:PRIMARY", 8, 256.0, 0.0, 2.0);
        assert!(matches!(
            cross_correlate(&xoft, &long),
            Err(CorrelationError::IncompatibleSeries(_))
        ));
        let empty = TimeSeries::new("X1:EMPTY", 0.0, 256.0, vec![]);
        assert!(matches!(
            cross_correlate(&empty, &xoft),
            Err(CorrelationError::IncompatibleSeries(_))
        ));
    }

    #[test]
    fn test_correlation_features() {
        let mut data = vec![0.0; 1000];
        data[500] = 0.5;
        data[530] = -2.26;
        data[900] = 10.0; // outside gps ± dt
        let corr = TimeSeries::new("X1:AUX", -0.5, 1000.0, data);
        let features = correlation_features(&corr, 0.0, 0.1).unwrap();
        assert_eq!(features.peak, 2.3);
        assert_eq!(features.delay_ms, 30);
        assert_relative_eq!(features.stdev, corr.std());

        assert!(correlation_features(&corr, 50.0, 0.1).is_err());
    }

    #[test]
    fn test_build_primary_crops_and_tapers() {
        let raw = noise("X1:PRIMARY", 9, 1024.0, -16.0, 32.0);
        let template = build_primary(0.0, 1.0, &raw, 4.0, Some(512.0), Some(4.0)).unwrap();
        assert_eq!(template.series.sample_rate, 512.0);
        assert_eq!(template.series.len(), 512);
        assert_eq!(template.series.t0, -0.5);
        assert_eq!(template.series.data[0], 0.0);
        assert_eq!(template.series.data[511], 0.0);

        assert!(matches!(
            build_primary(20.0, 1.0, &raw, 4.0, None, None),
            Err(CorrelationError::WindowNotCovered { .. })
        ));
    }
}
