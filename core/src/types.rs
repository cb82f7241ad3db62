//! Common types shared across the Omega scan pipeline.
//!
//! These structures represent the fundamental data objects of a scan:
//! uniformly sampled time series, GPS time segments, the per-channel
//! loudest-tile record that is checkpointed and reported, and the runtime
//! options that steer an orchestrated scan.

#[cfg(feature = "python")]
use pyo3::prelude::*;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// A half-open GPS time interval `[start, end)`, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
}

impl Segment {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Segment of total width `width` centred on `centre`.
    pub fn centred(centre: f64, width: f64) -> Self {
        Self::new(centre - width / 2.0, centre + width / 2.0)
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }

    /// Whether `other` lies entirely inside this segment.
    pub fn covers(&self, other: &Segment) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    pub fn intersects(&self, other: &Segment) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Merge overlapping or touching segments into a sorted, disjoint list.
    pub fn coalesce(mut segments: Vec<Segment>) -> Vec<Segment> {
        segments.retain(|s| s.end > s.start);
        segments.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));

        let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
        for seg in segments {
            match merged.last_mut() {
                Some(last) if seg.start <= last.end => last.end = last.end.max(seg.end),
                _ => merged.push(seg),
            }
        }
        merged
    }
}

// ---------------------------------------------------------------------------
// TimeSeries
// ---------------------------------------------------------------------------

/// A uniformly sampled, named time series.
///
/// Sample `i` is taken at GPS time `t0 + i / sample_rate`; the series spans
/// `[t0, t0 + len / sample_rate)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Channel name, e.g. `"L1:GDS-CALIB_STRAIN"`.
    pub name: String,

    /// GPS time of the first sample, in seconds.
    pub t0: f64,

    /// Sampling rate in Hz.
    pub sample_rate: f64,

    /// Sample values.
    pub data: Vec<f64>,
}

impl TimeSeries {
    pub fn new(name: impl Into<String>, t0: f64, sample_rate: f64, data: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            t0,
            sample_rate,
            data,
        }
    }

    /// A series with the same name, start time and rate but new samples.
    pub fn with_data(&self, data: Vec<f64>) -> Self {
        Self {
            name: self.name.clone(),
            t0: self.t0,
            sample_rate: self.sample_rate,
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dt(&self) -> f64 {
        1.0 / self.sample_rate
    }

    pub fn duration(&self) -> f64 {
        self.data.len() as f64 / self.sample_rate
    }

    pub fn span(&self) -> Segment {
        Segment::new(self.t0, self.t0 + self.duration())
    }

    pub fn time_at(&self, index: usize) -> f64 {
        self.t0 + index as f64 / self.sample_rate
    }

    /// Nearest sample index to GPS time `t`, clamped into `[0, len]`.
    pub fn index_at(&self, t: f64) -> usize {
        let idx = ((t - self.t0) * self.sample_rate).round();
        if idx <= 0.0 {
            0
        } else {
            (idx as usize).min(self.data.len())
        }
    }

    /// Restrict the series to `[start, end)`, clamped to its own span.
    pub fn crop(&self, start: f64, end: f64) -> Self {
        let i0 = self.index_at(start);
        let i1 = self.index_at(end).max(i0);
        Self {
            name: self.name.clone(),
            t0: self.time_at(i0),
            sample_rate: self.sample_rate,
            data: self.data[i0..i1].to_vec(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f64>() / self.data.len() as f64
    }

    /// Population standard deviation of the samples.
    pub fn std(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let var = self.data.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / self.data.len() as f64;
        var.sqrt()
    }

    /// Index of the sample with the largest absolute value.
    pub fn argmax_abs(&self) -> Option<usize> {
        self.data
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.abs().partial_cmp(&b.abs()).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
    }
}

// ---------------------------------------------------------------------------
// LoudestTileRecord
// ---------------------------------------------------------------------------

/// Round `value` to `decimals` decimal places.
pub fn round_dp(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Matched-filter statistics of one channel against the primary template.
#[cfg_attr(feature = "python", pyclass(get_all))]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelationFeatures {
    /// Largest absolute correlation within the accepted delay window.
    pub peak: f64,

    /// Standard deviation of the full correlation series.  Large values
    /// flag channels with a high glitch rate.
    pub stdev: f64,

    /// Time of `peak` relative to the trigger, in whole milliseconds.
    pub delay_ms: i64,
}

/// Features of the loudest time-frequency tile found in one channel.
///
/// This is the unit of checkpoint persistence and of final reporting; one
/// record exists per scanned (or restored) channel.
#[cfg_attr(feature = "python", pyclass(get_all))]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoudestTileRecord {
    pub channel: String,

    /// GPS time of the loudest tile, rounded to milliseconds.
    pub central_time: f64,

    /// Centre frequency of the loudest tile in Hz, one decimal place.
    pub central_frequency: f64,

    /// Quality factor of the plane holding the loudest tile.
    pub q: f64,

    /// Normalised tile energy.
    pub energy: f64,

    pub snr: f64,

    /// Present only when the run cross-correlates against a primary.
    pub correlation: Option<CorrelationFeatures>,
}

impl LoudestTileRecord {
    /// Build a record, applying the display-stable rounding used in
    /// reports: three decimals for time, one for everything else.
    pub fn rounded(
        channel: impl Into<String>,
        time: f64,
        frequency: f64,
        q: f64,
        energy: f64,
        snr: f64,
    ) -> Self {
        Self {
            channel: channel.into(),
            central_time: round_dp(time, 3),
            central_frequency: round_dp(frequency, 1),
            q: round_dp(q, 1),
            energy: round_dp(energy, 1),
            snr: round_dp(snr, 1),
            correlation: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationFeatures) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn is_correlated(&self) -> bool {
        self.correlation.is_some()
    }
}

// ---------------------------------------------------------------------------
// ScanOptions
// ---------------------------------------------------------------------------

/// Frequency-axis sampling of interpolated time-frequency maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyScale {
    Log,
    Linear,
}

impl std::str::FromStr for FrequencyScale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown frequency scaling '{}', expected 'log' or 'linear'", other)),
        }
    }
}

/// Default white-noise false-alarm-rate threshold: once per year, in Hz.
pub const DEFAULT_FAR_THRESHOLD: f64 = 3.171e-8;

/// Runtime options of an orchestrated scan.
///
/// These are pass-through parameters from the command line; the
/// per-block scan parameters live in [`crate::config::ChannelBlock`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanOptions {
    /// GPS trigger time to scan around.
    pub gps: f64,

    /// A channel is significant when its loudest tile's false-alarm rate
    /// is strictly below this value (Hz).
    pub fthresh: f64,

    /// Cross-correlate channels against the primary template.
    pub correlate: bool,

    /// Resume from (and write to) the checkpoint table.
    pub use_checkpoint: bool,

    /// Process blocks regardless of their state flag.
    pub ignore_state_flags: bool,

    pub frequency_scale: FrequencyScale,

    /// Time samples of each interpolated map.
    pub nt: usize,

    /// Frequency samples of each interpolated map.
    pub nf: usize,

    /// Worker threads writing map products.
    pub nproc: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            gps: 0.0,
            fthresh: DEFAULT_FAR_THRESHOLD,
            correlate: true,
            use_checkpoint: true,
            ignore_state_flags: false,
            frequency_scale: FrequencyScale::Log,
            nt: 1400,
            nf: 700,
            nproc: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_merges_touching_segments() {
        let merged = Segment::coalesce(vec![
            Segment::new(10.0, 20.0),
            Segment::new(0.0, 5.0),
            Segment::new(5.0, 8.0),
            Segment::new(15.0, 30.0),
            Segment::new(40.0, 40.0),
        ]);
        assert_eq!(merged, vec![Segment::new(0.0, 8.0), Segment::new(10.0, 30.0)]);
    }

    #[test]
    fn test_crop_is_clamped_to_span() {
        let ts = TimeSeries::new("X1:TEST", -2.0, 4.0, (0..16).map(|i| i as f64).collect());
        let cropped = ts.crop(-1.0, 1.0);
        assert_eq!(cropped.t0, -1.0);
        assert_eq!(cropped.data, vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);

        let clamped = ts.crop(-100.0, 100.0);
        assert_eq!(clamped.len(), 16);
        assert_eq!(clamped.t0, -2.0);
    }

    #[test]
    fn test_record_rounding() {
        let rec = LoudestTileRecord::rounded("X1:TEST", 0.012_345, 123.456, 5.6568, 40.04, 8.951);
        assert_eq!(rec.central_time, 0.012);
        assert_eq!(rec.central_frequency, 123.5);
        assert_eq!(rec.q, 5.7);
        assert_eq!(rec.energy, 40.0);
        assert_eq!(rec.snr, 9.0);
        assert!(!rec.is_correlated());
    }

    #[test]
    fn test_frequency_scale_parse() {
        assert_eq!("LOG".parse::<FrequencyScale>().unwrap(), FrequencyScale::Log);
        assert_eq!("linear".parse::<FrequencyScale>().unwrap(), FrequencyScale::Linear);
        assert!("cubic".parse::<FrequencyScale>().is_err());
    }
}
