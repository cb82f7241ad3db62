//! Multi-resolution Q-transform: the significance test of an Omega scan.
//!
//! # Background
//!
//! A transient burst of energy in a whitened time series is best resolved
//! by a time-frequency tile whose aspect ratio matches the burst.  The
//! Q-transform therefore tiles the time-frequency plane at several quality
//! factors `Q = f / Δf`: low-Q planes resolve short broadband glitches,
//! high-Q planes resolve long narrowband ones.  Every tile's energy is
//! normalised to the median of its row so that, for Gaussian noise, tile
//! energies are exponentially distributed with unit mean.
//!
//! # Algorithm overview
//!
//! 1. **Tiling**: planes are spaced logarithmically in Q and rows
//!    logarithmically in frequency so that the fractional energy loss
//!    between adjacent tiles never exceeds the configured mismatch.
//! 2. **Row transform**: each row multiplies the one-sided spectrum by a
//!    bisquare window centred on the row frequency and inverse-FFTs the
//!    product into a row of complex tile amplitudes.  Rows are independent
//!    and evaluated in parallel with **rayon**.
//! 3. **Normalisation**: tile energies are divided by `median / ln 2`.
//! 4. **Peak search**: the plane with the loudest tile inside the search
//!    window is retained.
//! 5. **Significance**: the white-noise false-alarm rate of the peak is
//!    `1.5 · N · exp(−E) / duration`, `N` being the weighted number of
//!    statistically independent tiles in the whole tiling.

use std::f64::consts::{LN_2, PI};

use log::debug;
use ndarray::Array2;
use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::fft::{next_power_of_two, InversePlans, RealFft};
use crate::types::{FrequencyScale, Segment, TimeSeries};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during a tile search.
#[derive(Debug, thiserror::Error)]
pub enum TileSearchError {
    #[error("cannot tile series '{0}': fewer than two samples")]
    EmptySeries(String),

    #[error("invalid Q range ({qlow}, {qhigh}): need 0 < qlow <= qhigh")]
    BadQRange { qlow: f64, qhigh: f64 },

    #[error("invalid frequency range ({flow}, {fhigh}) Hz after clipping to the usable band")]
    BadFrequencyRange { flow: f64, fhigh: f64 },

    #[error("mismatch must be positive, got {0}")]
    BadMismatch(f64),

    #[error("search window [{start}, {end}) contains no tiles")]
    SearchOutsideSpan { start: f64, end: f64 },

    #[error("cannot interpolate: {0}")]
    BadInterpolation(String),

    #[error("FFT failure: {0}")]
    Fft(String),
}

impl From<realfft::FftError> for TileSearchError {
    fn from(err: realfft::FftError) -> Self {
        Self::Fft(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Parameters of one tile search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileSearch {
    /// `(qlow, qhigh)`; equal bounds produce a single plane at that Q.
    pub q_range: (f64, f64),

    /// `(flow, fhigh)` in Hz.  `flow == 0` and `fhigh == inf` are resolved
    /// against the series duration and Nyquist frequency.
    pub f_range: (f64, f64),

    /// Absolute GPS window in which the loudest tile is sought.
    pub search: Segment,

    /// Maximum fractional energy loss between adjacent tiles.
    pub mismatch: f64,
}

/// A time-frequency significance search over a single series.
///
/// Implementations must be deterministic: the same series and search yield
/// the same [`QGram`] and false-alarm rate.
pub trait TileTransform {
    /// Tile `series` and return the loudest plane together with the
    /// white-noise false-alarm rate (Hz) of its peak tile.
    fn scan_tiles(&self, series: &TimeSeries, search: &TileSearch) -> Result<(QGram, f64), TileSearchError>;
}

// ---------------------------------------------------------------------------
// QGram
// ---------------------------------------------------------------------------

/// Normalised tile energies of one frequency row.
#[derive(Clone, Debug, PartialEq)]
pub struct QRow {
    pub frequency: f64,
    pub energies: Vec<f64>,
}

impl QRow {
    pub fn new(frequency: f64, energies: Vec<f64>) -> Self {
        Self { frequency, energies }
    }

    /// Tile `k` starts at `epoch + k * duration / ntiles`.
    fn tile_width(&self, duration: f64) -> f64 {
        duration / self.energies.len() as f64
    }

    /// Energy at time offset `dt` from the epoch, linearly interpolated
    /// between tile start times and clamped at the ends.
    fn energy_at(&self, dt: f64, duration: f64) -> f64 {
        let Some(last) = self.energies.len().checked_sub(1) else {
            return 0.0;
        };
        let pos = dt / self.tile_width(duration);
        if pos <= 0.0 {
            return self.energies[0];
        }
        let lo = pos.floor() as usize;
        if lo >= last {
            return self.energies[last];
        }
        let frac = pos - lo as f64;
        self.energies[lo] * (1.0 - frac) + self.energies[lo + 1] * frac
    }
}

/// The loudest tile of a [`QGram`] inside its search window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TilePeak {
    pub time: f64,
    pub frequency: f64,
    pub energy: f64,
    pub snr: f64,
}

/// One Q-plane of normalised tile energies.
#[derive(Clone, Debug)]
pub struct QGram {
    q: f64,
    frange: (f64, f64),
    epoch: f64,
    duration: f64,
    rows: Vec<QRow>,
    peak: TilePeak,
}

impl QGram {
    /// Assemble a plane from rows (ascending in frequency) and locate its
    /// peak inside `search`.
    pub fn new(
        q: f64,
        frange: (f64, f64),
        epoch: f64,
        duration: f64,
        rows: Vec<QRow>,
        search: Segment,
    ) -> Result<Self, TileSearchError> {
        let peak = find_peak(&rows, epoch, duration, search).ok_or(TileSearchError::SearchOutsideSpan {
            start: search.start,
            end: search.end,
        })?;
        Ok(Self {
            q,
            frange,
            epoch,
            duration,
            rows,
            peak,
        })
    }

    pub fn q(&self) -> f64 {
        self.q
    }

    /// Frequency range the tiling resolved to.
    pub fn frange(&self) -> (f64, f64) {
        self.frange
    }

    pub fn peak(&self) -> &TilePeak {
        &self.peak
    }

    pub fn rows(&self) -> &[QRow] {
        &self.rows
    }

    pub fn epoch(&self) -> f64 {
        self.epoch
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Resample the tiles onto a dense `time × frequency` grid.
    ///
    /// The time axis starts at `outseg.start` with spacing `tres`.  The
    /// frequency axis has `nf` samples over [`QGram::frange`], spaced
    /// geometrically for [`FrequencyScale::Log`] and uniformly otherwise.
    pub fn interpolate(
        &self,
        tres: f64,
        nf: usize,
        scale: FrequencyScale,
        outseg: Segment,
    ) -> Result<Spectrogram, TileSearchError> {
        if !(tres > 0.0) || nf == 0 || !(outseg.duration() > 0.0) {
            return Err(TileSearchError::BadInterpolation(format!(
                "tres={}, nf={}, outseg=[{}, {})",
                tres, nf, outseg.start, outseg.end
            )));
        }
        if self.rows.is_empty() {
            return Err(TileSearchError::BadInterpolation("q-gram has no rows".into()));
        }

        let nt = ((outseg.duration() / tres).round() as usize).max(1);
        let (fmin, fmax) = self.frange;
        let frequencies: Vec<f64> = match scale {
            FrequencyScale::Log if nf > 1 => {
                let ratio = (fmax / fmin).ln() / (nf - 1) as f64;
                (0..nf).map(|j| fmin * (ratio * j as f64).exp()).collect()
            }
            FrequencyScale::Log => vec![fmin],
            FrequencyScale::Linear => {
                let step = (fmax - fmin) / nf as f64;
                (0..nf).map(|j| fmin + step * j as f64).collect()
            }
        };

        // Interpolate every row in time first, then across rows.
        let by_row: Vec<Vec<f64>> = self
            .rows
            .par_iter()
            .map(|row| {
                (0..nt)
                    .map(|i| row.energy_at(outseg.start + i as f64 * tres - self.epoch, self.duration))
                    .collect()
            })
            .collect();

        let mut values = Array2::<f64>::zeros((nt, nf));
        for (j, &f) in frequencies.iter().enumerate() {
            let hi = self.rows.partition_point(|r| r.frequency < f);
            let (lo, hi, w) = if hi == 0 {
                (0, 0, 0.0)
            } else if hi >= self.rows.len() {
                let last = self.rows.len() - 1;
                (last, last, 0.0)
            } else {
                let (f0, f1) = (self.rows[hi - 1].frequency, self.rows[hi].frequency);
                let w = if f1 > f0 { (f - f0) / (f1 - f0) } else { 0.0 };
                (hi - 1, hi, w)
            };
            for i in 0..nt {
                values[[i, j]] = by_row[lo][i] * (1.0 - w) + by_row[hi][i] * w;
            }
        }

        Ok(Spectrogram {
            t0: outseg.start,
            dt: tres,
            frequencies,
            values,
        })
    }
}

fn find_peak(rows: &[QRow], epoch: f64, duration: f64, search: Segment) -> Option<TilePeak> {
    let mut best: Option<TilePeak> = None;
    for row in rows.iter().filter(|r| !r.energies.is_empty()) {
        let width = row.tile_width(duration);
        for (k, &energy) in row.energies.iter().enumerate() {
            let time = epoch + k as f64 * width;
            if !search.contains(time) {
                continue;
            }
            if best.map_or(true, |b| energy > b.energy) {
                best = Some(TilePeak {
                    time,
                    frequency: row.frequency,
                    energy,
                    snr: (2.0 * energy).sqrt(),
                });
            }
        }
    }
    best
}

/// A dense, interpolated time-frequency energy map.
#[derive(Clone, Debug)]
pub struct Spectrogram {
    /// GPS time of the first column.
    pub t0: f64,
    /// Time spacing in seconds.
    pub dt: f64,
    pub frequencies: Vec<f64>,
    /// Energies with shape `(nt, nf)`.
    pub values: Array2<f64>,
}

impl Spectrogram {
    pub fn nt(&self) -> usize {
        self.values.nrows()
    }

    pub fn nf(&self) -> usize {
        self.values.ncols()
    }

    pub fn max_energy(&self) -> f64 {
        self.values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }
}

// ---------------------------------------------------------------------------
// Tiling
// ---------------------------------------------------------------------------

/// Frequency-domain description of one row of tiles.
#[derive(Clone, Debug)]
struct RowPlan {
    frequency: f64,
    ntiles: usize,
    /// Spectrum bin of the first window sample.
    first_bin: i64,
    window: Vec<f64>,
}

impl RowPlan {
    fn new(q: f64, frequency: f64, duration: f64, deltam: f64) -> Self {
        let qprime = q / 11f64.sqrt();
        let half = (frequency / qprime * duration).floor() as i64;
        let windowsize = (2 * half + 1) as usize;

        let mut ntiles = next_power_of_two(duration * 2.0 * PI * frequency / q / deltam);
        if ntiles < windowsize {
            ntiles = next_power_of_two(windowsize as f64);
        }

        let window = (-half..=half)
            .map(|i| {
                let x = i as f64 / duration * qprime / frequency;
                (1.0 - x * x).powi(2)
            })
            .collect();

        Self {
            frequency,
            ntiles,
            first_bin: (frequency * duration).round() as i64 - half,
            window,
        }
    }

    /// Number of statistically independent tiles in this row.
    fn independents(&self, deltam: f64) -> f64 {
        1.0 + self.ntiles as f64 * deltam
    }

    fn transform(&self, spectrum: &[Complex<f64>], plans: &InversePlans) -> Result<QRow, TileSearchError> {
        let n = self.ntiles;
        let fft = plans
            .get(n)
            .ok_or_else(|| TileSearchError::Fft(format!("no inverse plan for length {}", n)))?;

        // Centre the windowed band, pad to `ntiles`, then ifftshift.
        let pad = n - self.window.len();
        let left = pad.saturating_sub(1) / 2;
        let shift = n / 2;
        let mut buffer = vec![Complex::new(0.0, 0.0); n];
        for (j, &w) in self.window.iter().enumerate() {
            let bin = self.first_bin + j as i64;
            if bin < 0 || bin as usize >= spectrum.len() {
                continue;
            }
            let centred = left + j;
            buffer[(centred + n - shift) % n] = spectrum[bin as usize] * w;
        }
        fft.process(&mut buffer);

        let mut energies: Vec<f64> = buffer.iter().map(|z| z.norm_sqr()).collect();
        let scale = median(&energies) / LN_2;
        if scale > 0.0 {
            for e in energies.iter_mut() {
                *e /= scale;
            }
        }
        Ok(QRow::new(self.frequency, energies))
    }
}

#[derive(Clone, Debug)]
struct PlanePlan {
    q: f64,
    rows: Vec<RowPlan>,
}

/// The full multi-plane tiling of a series.
#[derive(Clone, Debug)]
struct Tiling {
    deltam: f64,
    frange: (f64, f64),
    planes: Vec<PlanePlan>,
    /// `1 + log10(qhigh / qlow) / sqrt(2)`
    weight: f64,
}

impl Tiling {
    fn new(duration: f64, sample_rate: f64, search: &TileSearch) -> Result<Self, TileSearchError> {
        let (qlow, qhigh) = search.q_range;
        if !(qlow > 0.0) || !(qhigh >= qlow) || !qhigh.is_finite() {
            return Err(TileSearchError::BadQRange { qlow, qhigh });
        }
        if !(search.mismatch > 0.0) {
            return Err(TileSearchError::BadMismatch(search.mismatch));
        }
        let deltam = 2.0 * (search.mismatch / 3.0).sqrt();

        let cumum = (qhigh / qlow).ln() / 2f64.sqrt();
        let nplanes = ((cumum / deltam).ceil() as usize).max(1);
        let dq = cumum / nplanes as f64;
        let qs: Vec<f64> = (0..nplanes)
            .map(|i| qlow * (2f64.sqrt() * dq * (i as f64 + 0.5)).exp())
            .collect();
        let qmax = qs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let qmin = qs.iter().cloned().fold(f64::INFINITY, f64::min);

        let (mut flow, mut fhigh) = search.f_range;
        if flow == 0.0 {
            flow = 50.0 * qmax / (2.0 * PI * duration);
        }
        let fmax = sample_rate / 2.0 / (1.0 + 11f64.sqrt() / qmin);
        if fhigh.is_infinite() || fhigh > fmax {
            fhigh = fmax;
        }
        if !(flow > 0.0) || !(fhigh > flow) {
            return Err(TileSearchError::BadFrequencyRange { flow, fhigh });
        }

        let fstepmin = 1.0 / duration;
        let planes = qs
            .iter()
            .map(|&q| {
                let qterm = (2.0 + q * q).sqrt();
                let fcum = (fhigh / flow).ln() * qterm / 2.0;
                let nfreq = ((fcum / deltam).ceil() as usize).max(1);
                let fstep = fcum / nfreq as f64;
                let rows = (0..nfreq)
                    .map(|i| {
                        let f = flow * (2.0 / qterm * (i as f64 + 0.5) * fstep).exp();
                        let f = (f / fstepmin).floor() * fstepmin;
                        RowPlan::new(q, f, duration, deltam)
                    })
                    .filter(|row| row.frequency > 0.0)
                    .collect();
                PlanePlan { q, rows }
            })
            .collect();

        Ok(Self {
            deltam,
            frange: (flow, fhigh),
            planes,
            weight: 1.0 + (qhigh / qlow).log10() / 2f64.sqrt(),
        })
    }

    /// Weighted count of independent tiles across all planes.
    fn independents(&self) -> f64 {
        let total: f64 = self
            .planes
            .iter()
            .flat_map(|p| p.rows.iter())
            .map(|r| r.independents(self.deltam))
            .sum();
        total * self.weight / self.planes.len() as f64
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

// ---------------------------------------------------------------------------
// QTransform
// ---------------------------------------------------------------------------

/// The shipped [`TileTransform`]: a bisquare-windowed multi-Q tiling.
#[derive(Clone, Copy, Debug, Default)]
pub struct QTransform;

impl QTransform {
    pub fn new() -> Self {
        Self
    }
}

impl TileTransform for QTransform {
    fn scan_tiles(&self, series: &TimeSeries, search: &TileSearch) -> Result<(QGram, f64), TileSearchError> {
        if series.len() < 2 {
            return Err(TileSearchError::EmptySeries(series.name.clone()));
        }
        let duration = series.duration();
        let tiling = Tiling::new(duration, series.sample_rate, search)?;

        let mut plans = InversePlans::new();
        plans.prepare(tiling.planes.iter().flat_map(|p| p.rows.iter().map(|r| r.ntiles)));
        let spectrum = RealFft::new(series.len()).forward(&series.data)?;

        debug!(
            "Tiling {}: {} planes, f=({:.1}, {:.1}) Hz",
            series.name,
            tiling.planes.len(),
            tiling.frange.0,
            tiling.frange.1
        );

        let mut best: Option<QGram> = None;
        for plane in &tiling.planes {
            let rows = plane
                .rows
                .par_iter()
                .map(|row| row.transform(&spectrum, &plans))
                .collect::<Result<Vec<QRow>, TileSearchError>>()?;
            let Some(peak) = find_peak(&rows, series.t0, duration, search.search) else {
                continue;
            };
            if best.as_ref().map_or(true, |b| peak.energy > b.peak.energy) {
                best = Some(QGram {
                    q: plane.q,
                    frange: tiling.frange,
                    epoch: series.t0,
                    duration,
                    rows,
                    peak,
                });
            }
        }

        let qgram = best.ok_or(TileSearchError::SearchOutsideSpan {
            start: search.search.start,
            end: search.search.end,
        })?;
        let far = 1.5 * tiling.independents() * (-qgram.peak.energy).exp() / duration;
        debug!(
            "{}: peak Q={:.1} f={:.1} Hz E={:.1} at {:.3}, FAR={:.3e} Hz",
            series.name, qgram.q, qgram.peak.frequency, qgram.peak.energy, qgram.peak.time, far
        );
        Ok((qgram, far))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};

    fn white_noise(seed: u64, fs: f64, duration: f64) -> TimeSeries {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = (fs * duration) as usize;
        let data = (0..n).map(|_| StandardNormal.sample(&mut rng)).collect();
        TimeSeries::new("X1:TEST-WHITE", -duration / 2.0, fs, data)
    }

    fn search(q_range: (f64, f64), f_range: (f64, f64)) -> TileSearch {
        TileSearch {
            q_range,
            f_range,
            search: Segment::centred(0.0, 0.5),
            mismatch: 0.2,
        }
    }

    #[test]
    fn test_tiling_resolves_open_frequency_range() {
        let tiling = Tiling::new(16.0, 1024.0, &search((4.0, 64.0), (0.0, f64::INFINITY))).unwrap();
        let qmin = tiling.planes[0].q;
        let qmax = tiling.planes.last().unwrap().q;
        assert_relative_eq!(tiling.frange.0, 50.0 * qmax / (2.0 * PI * 16.0), epsilon = 1e-9);
        assert_relative_eq!(tiling.frange.1, 512.0 / (1.0 + 11f64.sqrt() / qmin), epsilon = 1e-9);
        assert!(tiling.planes.len() > 1);
        for plane in &tiling.planes {
            assert!(plane.rows.windows(2).all(|w| w[0].frequency <= w[1].frequency));
            for row in &plane.rows {
                assert!(row.ntiles.is_power_of_two());
                assert!(row.ntiles >= row.window.len());
            }
        }
    }

    #[test]
    fn test_single_q_plane() {
        let tiling = Tiling::new(8.0, 1024.0, &search((11.3, 11.3), (20.0, 200.0))).unwrap();
        assert_eq!(tiling.planes.len(), 1);
        assert_relative_eq!(tiling.planes[0].q, 11.3);
        assert_relative_eq!(tiling.weight, 1.0);
    }

    #[test]
    fn test_rejects_bad_ranges() {
        assert!(matches!(
            Tiling::new(8.0, 1024.0, &search((10.0, 4.0), (20.0, 200.0))),
            Err(TileSearchError::BadQRange { .. })
        ));
        assert!(matches!(
            Tiling::new(8.0, 1024.0, &search((4.0, 10.0), (600.0, 700.0))),
            Err(TileSearchError::BadFrequencyRange { .. })
        ));
    }

    #[test]
    fn test_noise_energies_are_normalised() {
        let ts = white_noise(42, 512.0, 16.0);
        let (qgram, far) = QTransform::new()
            .scan_tiles(&ts, &search((4.0, 16.0), (10.0, 200.0)))
            .unwrap();
        for row in qgram.rows() {
            assert_relative_eq!(median(&row.energies), LN_2, epsilon = 1e-9);
        }
        // Pure noise should not be significant at a once-per-year rate.
        assert!(far > 1e-6, "far = {}", far);
        assert!(qgram.peak().energy < 25.0);
    }

    #[test]
    fn test_detects_sine_gaussian() {
        let fs = 1024.0;
        let mut ts = white_noise(7, fs, 16.0);
        let (f0, tau) = (100.0, 0.02);
        for (i, v) in ts.data.iter_mut().enumerate() {
            let t = -8.0 + i as f64 / fs;
            *v += 20.0 * (-(t / tau).powi(2)).exp() * (2.0 * PI * f0 * t).sin();
        }

        let transform = QTransform::new();
        let params = search((4.0, 64.0), (10.0, 400.0));
        let (qgram, far) = transform.scan_tiles(&ts, &params).unwrap();
        let peak = qgram.peak();
        assert!(far < 1e-10, "far = {}", far);
        assert!(peak.time.abs() < 0.05, "peak at {}", peak.time);
        assert!((peak.frequency - f0).abs() < 30.0, "peak at {} Hz", peak.frequency);
        assert_relative_eq!(peak.snr, (2.0 * peak.energy).sqrt());

        // Deterministic.
        let (again, far_again) = transform.scan_tiles(&ts, &params).unwrap();
        assert_eq!(again.peak(), peak);
        assert_eq!(far_again, far);
    }

    #[test]
    fn test_search_outside_span_fails() {
        let ts = white_noise(1, 256.0, 8.0);
        let mut params = search((4.0, 8.0), (10.0, 60.0));
        params.search = Segment::new(100.0, 101.0);
        assert!(matches!(
            QTransform::new().scan_tiles(&ts, &params),
            Err(TileSearchError::SearchOutsideSpan { .. })
        ));
    }

    #[test]
    fn test_interpolate_shape_and_axes() {
        let rows = vec![
            QRow::new(10.0, vec![1.0, 2.0, 3.0, 4.0]),
            QRow::new(100.0, vec![5.0, 6.0, 7.0, 8.0]),
        ];
        let qgram = QGram::new(5.0, (10.0, 100.0), 0.0, 4.0, rows, Segment::new(0.0, 4.0)).unwrap();
        assert_eq!(qgram.peak().energy, 8.0);
        assert_eq!(qgram.peak().time, 3.0);

        let spec = qgram
            .interpolate(0.5, 3, FrequencyScale::Log, Segment::new(0.0, 4.0))
            .unwrap();
        assert_eq!(spec.nt(), 8);
        assert_eq!(spec.nf(), 3);
        assert_relative_eq!(spec.frequencies[0], 10.0);
        assert_relative_eq!(spec.frequencies[1], 10f64.powf(1.5), epsilon = 1e-9);
        assert_relative_eq!(spec.frequencies[2], 100.0, epsilon = 1e-9);
        // t = 0.5 lies halfway between the first two tiles of each row.
        assert_relative_eq!(spec.values[[1, 0]], 1.5);
        assert_relative_eq!(spec.values[[1, 2]], 5.5, epsilon = 1e-9);
        assert_relative_eq!(spec.max_energy(), 8.0, epsilon = 1e-9);

        let linear = qgram
            .interpolate(1.0, 2, FrequencyScale::Linear, Segment::new(0.0, 4.0))
            .unwrap();
        assert_eq!(linear.frequencies, vec![10.0, 55.0]);
        assert_relative_eq!(linear.values[[0, 1]], 3.0);

        assert!(qgram.interpolate(0.0, 3, FrequencyScale::Log, Segment::new(0.0, 4.0)).is_err());
    }
}
