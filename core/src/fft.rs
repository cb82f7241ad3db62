//! Thin FFT helpers over `realfft`/`rustfft`.
//!
//! Plans are built once per length and reused; inverse transforms are
//! normalised so that `inverse(forward(x)) == x`.

use std::collections::HashMap;
use std::sync::Arc;

use realfft::{ComplexToReal, FftError, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Forward/inverse real FFT pair for a fixed length.
pub struct RealFft {
    len: usize,
    forward_r2c: Arc<dyn RealToComplex<f64>>,
    inverse_c2r: Arc<dyn ComplexToReal<f64>>,
}

impl RealFft {
    pub fn new(len: usize) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        Self {
            len,
            forward_r2c: planner.plan_fft_forward(len),
            inverse_c2r: planner.plan_fft_inverse(len),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of one-sided spectrum bins, `len / 2 + 1`.
    pub fn spectrum_len(&self) -> usize {
        self.len / 2 + 1
    }

    /// One-sided, unnormalised spectrum of `input` (length must be `len`).
    pub fn forward(&self, input: &[f64]) -> Result<Vec<Complex<f64>>, FftError> {
        let mut buffer = input.to_vec();
        let mut spectrum = self.forward_r2c.make_output_vec();
        self.forward_r2c.process(&mut buffer, &mut spectrum)?;
        Ok(spectrum)
    }

    /// Inverse of [`RealFft::forward`], scaled by `1 / len`.
    ///
    /// The imaginary parts of the DC and (for even lengths) Nyquist bins
    /// are discarded, as a real signal cannot carry them.
    pub fn inverse(&self, mut spectrum: Vec<Complex<f64>>) -> Result<Vec<f64>, FftError> {
        if let Some(dc) = spectrum.first_mut() {
            dc.im = 0.0;
        }
        if self.len % 2 == 0 {
            if let Some(nyquist) = spectrum.last_mut() {
                nyquist.im = 0.0;
            }
        }
        let mut output = self.inverse_c2r.make_output_vec();
        self.inverse_c2r.process(&mut spectrum, &mut output)?;
        let scale = 1.0 / self.len as f64;
        for value in output.iter_mut() {
            *value *= scale;
        }
        Ok(output)
    }
}

/// Cache of unnormalised complex inverse FFT plans keyed by length.
///
/// Plans are `Send + Sync`, so a populated cache can be shared by rayon
/// workers without locking.
#[derive(Default)]
pub struct InversePlans {
    plans: HashMap<usize, Arc<dyn Fft<f64>>>,
}

impl InversePlans {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan every length in `lens` that is not already cached.
    pub fn prepare(&mut self, lens: impl IntoIterator<Item = usize>) {
        let mut planner = FftPlanner::<f64>::new();
        for len in lens {
            self.plans
                .entry(len)
                .or_insert_with(|| planner.plan_fft_inverse(len));
        }
    }

    pub fn get(&self, len: usize) -> Option<&Arc<dyn Fft<f64>>> {
        self.plans.get(&len)
    }
}

/// Smallest power of two `>= value` (and at least 1).
pub fn next_power_of_two(value: f64) -> usize {
    if value.is_nan() || value <= 1.0 {
        return 1;
    }
    2usize.pow(value.log2().ceil() as u32)
}
