//! Scan of a single channel around the trigger time.
//!
//! # Algorithm overview
//!
//! 1. **Conditioning**: the raw series is resampled to the block rate,
//!    high-passed at the block's lower frequency bound and whitened.
//! 2. **Tile search**: the whitened series is tiled over the block's Q and
//!    frequency ranges; the loudest tile near the trigger is retained
//!    together with its white-noise false-alarm rate.
//! 3. **Significance gate**: a channel whose false-alarm rate is not
//!    strictly below the run threshold stops here, unless its block asks
//!    for maps regardless.
//! 4. **Raw tiling**: the un-whitened series is tiled once more at the Q
//!    and frequency range resolved in step 2.
//! 5. **Maps**: both tilings are interpolated onto a dense grid for every
//!    plot duration of the block.
//! 6. **Correlation**: with a primary template, the whitened series is
//!    matched-filtered and the peak, delay and spread of the correlation
//!    are attached to the record.

use std::time::Instant;

use log::{debug, info};

use crate::conditioning::{condition, ConditioningError};
use crate::config::ChannelBlock;
use crate::primary::{correlation_features, cross_correlate, CorrelationError, PrimaryTemplate};
use crate::products::{MapKind, MapProduct};
use crate::qtransform::{QGram, Spectrogram, TileSearch, TileSearchError, TileTransform};
use crate::types::{FrequencyScale, LoudestTileRecord, ScanOptions, Segment, TimeSeries};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A failure confined to one channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Conditioning(#[from] ConditioningError),

    #[error(transparent)]
    TileSearch(#[from] TileSearchError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Whitened and raw maps of one plot duration.
#[derive(Clone, Debug)]
pub struct DurationMaps {
    pub duration: f64,
    pub whitened: Spectrogram,
    pub raw: Spectrogram,
}

/// Everything a significant channel produced.
#[derive(Clone, Debug)]
pub struct ChannelScan {
    pub record: LoudestTileRecord,
    pub qgram: QGram,
    pub raw_qgram: QGram,
    pub maps: Vec<DurationMaps>,
}

impl ChannelScan {
    /// Split the maps into owned products for the writer pool.
    pub fn into_products(self, snr_threshold: f64) -> (LoudestTileRecord, Vec<MapProduct>) {
        let channel = self.record.channel.clone();
        let mut products = Vec::with_capacity(2 * self.maps.len());
        for maps in self.maps {
            products.push(MapProduct {
                channel: channel.clone(),
                kind: MapKind::Whitened,
                duration: maps.duration,
                snr_threshold,
                spectrogram: maps.whitened,
            });
            products.push(MapProduct {
                channel: channel.clone(),
                kind: MapKind::Raw,
                duration: maps.duration,
                snr_threshold,
                spectrogram: maps.raw,
            });
        }
        (self.record, products)
    }
}

/// Result of scanning one channel.
#[derive(Clone, Debug)]
pub enum ScanOutcome {
    Recorded(Box<ChannelScan>),
    /// The loudest tile did not pass the false-alarm gate.
    Insignificant { far: f64 },
}

// ---------------------------------------------------------------------------
// ChannelScanner
// ---------------------------------------------------------------------------

/// Scans single channels with a fixed [`TileTransform`] and run options.
#[derive(Clone, Debug)]
pub struct ChannelScanner<T: TileTransform> {
    transform: T,
    fthresh: f64,
    frequency_scale: FrequencyScale,
    nt: usize,
    nf: usize,
}

impl<T: TileTransform> ChannelScanner<T> {
    pub fn new(transform: T, options: &ScanOptions) -> Self {
        Self {
            transform,
            fthresh: options.fthresh,
            frequency_scale: options.frequency_scale,
            nt: options.nt.max(1),
            nf: options.nf.max(1),
        }
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }

    /// Whether a false-alarm rate passes the gate.  NaN never does.
    pub fn is_significant(&self, far: f64) -> bool {
        far < self.fthresh
    }

    /// Scan `raw` as channel `channel` of `block` around `gps`.
    pub fn scan(
        &self,
        channel: &str,
        raw: &TimeSeries,
        block: &ChannelBlock,
        gps: f64,
        primary: Option<&PrimaryTemplate>,
    ) -> Result<ScanOutcome, ChannelError> {
        let start = Instant::now();
        let conditioned = condition(raw, block.fftlength, None, block.resample, block.f_low())?;

        let search_window = Segment::centred(gps, block.search);
        let (qgram, far) = self.transform.scan_tiles(
            &conditioned.whitened,
            &TileSearch {
                q_range: block.q_range,
                f_range: block.f_range,
                search: search_window,
                mismatch: block.max_mismatch,
            },
        )?;

        if !self.is_significant(far) && !block.always_plot {
            debug!("{}: FAR {:.3e} Hz is not below {:.3e} Hz", channel, far, self.fthresh);
            return Ok(ScanOutcome::Insignificant { far });
        }

        let (raw_qgram, _) = self.transform.scan_tiles(
            conditioned.unwhitened(),
            &TileSearch {
                q_range: (qgram.q(), qgram.q()),
                f_range: qgram.frange(),
                search: search_window,
                mismatch: block.max_mismatch,
            },
        )?;

        let mut maps = Vec::with_capacity(block.plot_durations.len());
        for &duration in &block.plot_durations {
            let outseg = Segment::centred(gps, duration);
            let tres = duration / self.nt as f64;
            maps.push(DurationMaps {
                duration,
                whitened: qgram.interpolate(tres, self.nf, self.frequency_scale, outseg)?,
                raw: raw_qgram.interpolate(tres, self.nf, self.frequency_scale, outseg)?,
            });
        }

        let peak = qgram.peak();
        let mut record =
            LoudestTileRecord::rounded(channel, peak.time, peak.frequency, qgram.q(), peak.energy, peak.snr);

        if let Some(template) = primary {
            let corr = cross_correlate(&conditioned.whitened, &template.series)?;
            record = record.with_correlation(correlation_features(&corr, gps, block.dt)?);
        }

        info!(
            "{}: Q={:.1} f={:.1} Hz SNR={:.1} FAR={:.3e} Hz ({:.2} s)",
            channel,
            record.q,
            record.central_frequency,
            record.snr,
            far,
            start.elapsed().as_secs_f64()
        );

        Ok(ScanOutcome::Recorded(Box::new(ChannelScan {
            record,
            qgram,
            raw_qgram,
            maps,
        })))
    }
}
