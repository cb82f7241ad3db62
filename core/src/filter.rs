//! Digital filters and window functions used by the conditioning stage.
//!
//! - [`SosFilter`]: cascaded second-order sections, designed as a
//!   Butterworth high-pass via the bilinear transform and applied
//!   forward-backward for zero phase distortion.
//! - [`hann`] / [`planck`]: window functions.
//! - [`detrend_linear`]: least-squares linear trend removal.

use std::f64::consts::PI;

use rustfft::num_complex::Complex;

/// Errors raised while designing or applying a filter.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("corner frequency {corner} Hz must lie strictly between 0 and Nyquist ({nyquist} Hz)")]
    InvalidCorner { corner: f64, nyquist: f64 },

    #[error("filter order must be at least 1")]
    ZeroOrder,

    #[error("input of {len} samples is too short for forward-backward filtering (needs more than {padlen})")]
    TooShort { len: usize, padlen: usize },
}

// ---------------------------------------------------------------------------
// Second-order sections
// ---------------------------------------------------------------------------

/// One biquad in transposed direct form II; `a[0]` is implicitly 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl Biquad {
    /// Steady-state gain for a constant input.
    fn dc_gain(&self) -> f64 {
        (self.b[0] + self.b[1] + self.b[2]) / (self.a[0] + self.a[1] + self.a[2])
    }

    /// Filter state that yields a steady-state response to a constant
    /// input of unit amplitude.
    fn steady_state(&self) -> [f64; 2] {
        let g = self.dc_gain();
        [g - self.b[0], self.b[2] - self.a[2] * g]
    }
}

/// A cascade of [`Biquad`] sections.
#[derive(Clone, Debug, PartialEq)]
pub struct SosFilter {
    sections: Vec<Biquad>,
}

impl SosFilter {
    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    /// Design a digital Butterworth high-pass of the given order.
    ///
    /// The analog prototype is frequency-warped so the -3 dB point lands
    /// exactly on `corner`; every section has unit gain at Nyquist.
    pub fn butterworth_highpass(order: usize, corner: f64, sample_rate: f64) -> Result<Self, FilterError> {
        let nyquist = sample_rate / 2.0;
        if order == 0 {
            return Err(FilterError::ZeroOrder);
        }
        if !(corner > 0.0 && corner < nyquist) {
            return Err(FilterError::InvalidCorner { corner, nyquist });
        }

        let fs2 = 2.0 * sample_rate;
        let warped = fs2 * (PI * corner / sample_rate).tan();
        let bilinear = |s: Complex<f64>| (Complex::new(fs2, 0.0) + s) / (Complex::new(fs2, 0.0) - s);

        let mut sections = Vec::with_capacity(order.div_ceil(2));
        for k in 0..order / 2 {
            // Upper-half-plane member of each conjugate pole pair.
            let theta = PI * (2 * k + 1 + order) as f64 / (2 * order) as f64;
            let proto = Complex::from_polar(1.0, theta);
            let z = bilinear(Complex::new(warped, 0.0) / proto);
            let a1 = -2.0 * z.re;
            let a2 = z.norm_sqr();
            let gain = (1.0 - a1 + a2) / 4.0;
            sections.push(Biquad {
                b: [gain, -2.0 * gain, gain],
                a: [1.0, a1, a2],
            });
        }
        if order % 2 == 1 {
            // Real pole at s = -1 maps to a first-order section.
            let z = bilinear(Complex::new(-warped, 0.0)).re;
            let gain = (1.0 + z) / 2.0;
            sections.push(Biquad {
                b: [gain, -gain, 0.0],
                a: [1.0, -z, 0.0],
            });
        }

        Ok(Self { sections })
    }

    /// Edge padding used by [`SosFilter::filtfilt`].
    pub fn padlen(&self) -> usize {
        3 * (2 * self.sections.len() + 1)
    }

    /// Single forward pass, initialised to the steady state of `input[0]`.
    pub fn filter(&self, input: &[f64]) -> Vec<f64> {
        let mut out = input.to_vec();
        let Some(&first) = input.first() else {
            return out;
        };

        let mut level = first;
        for section in &self.sections {
            let [s1, s2] = section.steady_state();
            let (mut z1, mut z2) = (s1 * level, s2 * level);
            let [b0, b1, b2] = section.b;
            let [_, a1, a2] = section.a;
            for v in out.iter_mut() {
                let x = *v;
                let y = b0 * x + z1;
                z1 = b1 * x - a1 * y + z2;
                z2 = b2 * x - a2 * y;
                *v = y;
            }
            level *= section.dc_gain();
        }
        out
    }

    /// Zero-phase forward-backward filtering with odd-extension padding.
    pub fn filtfilt(&self, input: &[f64]) -> Result<Vec<f64>, FilterError> {
        let n = input.len();
        let padlen = self.padlen();
        if n <= padlen {
            return Err(FilterError::TooShort { len: n, padlen });
        }

        let mut ext = Vec::with_capacity(n + 2 * padlen);
        let (first, last) = (input[0], input[n - 1]);
        ext.extend((1..=padlen).rev().map(|i| 2.0 * first - input[i]));
        ext.extend_from_slice(input);
        ext.extend((1..=padlen).map(|i| 2.0 * last - input[n - 1 - i]));

        let mut y = self.filter(&ext);
        y.reverse();
        let mut y = self.filter(&y);
        y.reverse();
        Ok(y[padlen..padlen + n].to_vec())
    }
}

// ---------------------------------------------------------------------------
// Windows and detrending
// ---------------------------------------------------------------------------

/// Periodic Hann window of length `n`.
pub fn hann(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos())
        .collect()
}

/// Planck-taper window of length `n` rising over `nleft` samples and
/// falling over the last `nright` samples.
pub fn planck(n: usize, nleft: usize, nright: usize) -> Vec<f64> {
    let mut w = vec![1.0; n];
    if n == 0 {
        return w;
    }
    let expit = |z: f64| 1.0 / (1.0 + z.exp());

    let nleft = nleft.min(n);
    if nleft > 0 {
        w[0] = 0.0;
        for k in 1..nleft {
            let z = nleft as f64 * (1.0 / k as f64 + 1.0 / (k as f64 - nleft as f64));
            w[k] *= expit(z);
        }
    }
    let nright = nright.min(n);
    if nright > 0 {
        w[n - 1] = 0.0;
        for k in 1..nright {
            let z = -(nright as f64) * (1.0 / (k as f64 - nright as f64) + 1.0 / k as f64);
            w[n - nright + k - 1] *= expit(z);
        }
    }
    w
}

/// Sample counts to taper at each edge: up to the first and from the last
/// local extremum of `data`.
pub fn auto_taper_lengths(data: &[f64]) -> (usize, usize) {
    let n = data.len();
    let is_min = |i: usize| data[i] < data[i - 1] && data[i] < data[i + 1];
    let is_max = |i: usize| data[i] > data[i - 1] && data[i] > data[i + 1];
    if n < 3 {
        return (0, 0);
    }

    let first_min = (1..n - 1).find(|&i| is_min(i));
    let first_max = (1..n - 1).find(|&i| is_max(i));
    let last_min = (1..n - 1).rev().find(|&i| is_min(i));
    let last_max = (1..n - 1).rev().find(|&i| is_max(i));

    let nleft = match (first_min, first_max) {
        (Some(a), Some(b)) => a.max(b),
        _ => 0,
    };
    let nright = match (last_min, last_max) {
        (Some(a), Some(b)) => n - a.min(b),
        _ => 0,
    };
    (nleft, nright)
}

/// Remove the least-squares straight line from `data`.
pub fn detrend_linear(data: &[f64]) -> Vec<f64> {
    let n = data.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let nf = n as f64;
    let x_mean = (nf - 1.0) / 2.0;
    let y_mean = data.iter().sum::<f64>() / nf;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, &y) in data.iter().enumerate() {
        let dx = i as f64 - x_mean;
        sxy += dx * (y - y_mean);
        sxx += dx * dx;
    }
    let slope = sxy / sxx;
    data.iter()
        .enumerate()
        .map(|(i, &y)| y - y_mean - slope * (i as f64 - x_mean))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| (2.0 * PI * freq * i as f64 / fs).sin()).collect()
    }

    fn rms(x: &[f64]) -> f64 {
        (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
    }

    #[test]
    fn test_highpass_passes_high_and_blocks_low_frequencies() {
        let fs = 1024.0;
        let filt = SosFilter::butterworth_highpass(12, 20.0, fs).unwrap();
        assert_eq!(filt.sections().len(), 6);

        let high = filt.filtfilt(&sine(200.0, fs, 8192)).unwrap();
        let low = filt.filtfilt(&sine(2.0, fs, 8192)).unwrap();

        // Ignore the edges, where the padding still rings.
        let mid = 1024..7168;
        assert!((rms(&high[mid.clone()]) - 0.5f64.sqrt()).abs() < 1e-3);
        assert!(rms(&low[mid]) < 1e-6);
    }

    #[test]
    fn test_highpass_removes_constant_offset() {
        let filt = SosFilter::butterworth_highpass(12, 4.0 / 1.5, 256.0).unwrap();
        let data: Vec<f64> = sine(50.0, 256.0, 4096).iter().map(|v| v + 10.0).collect();
        let out = filt.filtfilt(&data).unwrap();
        let mean = out.iter().sum::<f64>() / out.len() as f64;
        assert!(mean.abs() < 1e-2, "mean = {}", mean);
    }

    #[test]
    fn test_odd_order_design() {
        let filt = SosFilter::butterworth_highpass(3, 10.0, 100.0).unwrap();
        assert_eq!(filt.sections().len(), 2);
    }

    #[test]
    fn test_invalid_corner_rejected() {
        assert!(SosFilter::butterworth_highpass(4, 0.0, 100.0).is_err());
        assert!(SosFilter::butterworth_highpass(4, 60.0, 100.0).is_err());
        assert!(matches!(
            SosFilter::butterworth_highpass(0, 10.0, 100.0),
            Err(FilterError::ZeroOrder)
        ));
    }

    #[test]
    fn test_filtfilt_too_short() {
        let filt = SosFilter::butterworth_highpass(12, 10.0, 100.0).unwrap();
        assert!(matches!(filt.filtfilt(&[1.0; 20]), Err(FilterError::TooShort { .. })));
    }

    #[test]
    fn test_planck_edges() {
        let w = planck(100, 10, 20);
        assert_eq!(w[0], 0.0);
        assert_eq!(w[99], 0.0);
        assert!(w[1] < 1e-3);
        assert!(w[5] > 0.0 && w[5] < 1.0);
        assert_eq!(w[50], 1.0);
        assert!(w[81] > 0.99);
        assert!(w[98] < 1e-3);
    }

    #[test]
    fn test_detrend_linear_removes_ramp() {
        let data: Vec<f64> = (0..50).map(|i| 3.0 + 0.5 * i as f64).collect();
        assert!(detrend_linear(&data).iter().all(|v| v.abs() < 1e-10));
    }
}
