//! Batch driver of an Omega scan.
//!
//! The orchestrator walks every block of a [`ScanConfig`] in order and
//! drives each channel through
//!
//! ```text
//! Pending ─┬─> CheckpointHit
//!          ├─> Skipped (state flag)
//!          └─> Scanning ─┬─> Recorded
//!                        ├─> Skipped
//!                        └─> Failed
//! ```
//!
//! A block whose state flag does not cover its data window is skipped as a
//! whole, before any of its channels is restored from the checkpoint.  Raw
//! data is fetched once per block.  After every channel the record table is
//! written to the checkpoint and the report sink is refreshed, so an
//! interrupted batch resumes where it stopped.  Errors
//! confined to one channel never abort the run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use crate::checkpoint::{CheckpointError, RecordTable, ScanCheckpoint};
use crate::config::{ChannelBlock, ConfigError, PrimaryBlock, ScanConfig};
use crate::datasource::{ChannelFileSource, DataSource, DataSourceError, SeriesBundle, StateFlagSource};
use crate::primary::{build_primary, CorrelationError, PrimaryTemplate};
use crate::products::{ProductPool, ProductTally};
use crate::qtransform::TileTransform;
use crate::report::{BlockEntry, ChannelStatus, ReportError, ReportSink, ReportSnapshot};
use crate::scanner::{ChannelScanner, ScanOutcome};
use crate::types::{ScanOptions, Segment};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that abort a scan.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("cannot build the primary template: {0}")]
    Primary(#[from] CorrelationError),

    #[error("no data for primary channel '{0}'")]
    PrimaryUnavailable(String),

    #[error("data source error: {0}")]
    DataSource(#[from] DataSourceError),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

/// Why a channel produced no record.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The loudest tile's false-alarm rate was not below the threshold.
    Insignificant { far: f64 },
    /// The block's state flag was inactive over its data window.
    StateFlag { flag: String },
    /// The data source returned nothing for the channel.
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ChannelState {
    Pending,
    CheckpointHit,
    Scanning,
    Recorded,
    Skipped(SkipReason),
    /// An error isolated to this channel.
    Failed(String),
}

/// Final state of a scan.
#[derive(Clone, Debug)]
pub struct ScanSummary {
    pub table: RecordTable,
    pub channels: Vec<ChannelStatus>,
    pub products: ProductTally,
}

impl ScanSummary {
    /// State of `channel` in the last block that lists it.
    pub fn state(&self, channel: &str) -> Option<&ChannelState> {
        self.channels.iter().rev().find(|c| c.channel == channel).map(|c| &c.state)
    }

    fn count(&self, pred: impl Fn(&ChannelState) -> bool) -> usize {
        self.channels.iter().filter(|c| pred(&c.state)).count()
    }

    pub fn recorded(&self) -> usize {
        self.count(|s| *s == ChannelState::Recorded)
    }

    pub fn restored(&self) -> usize {
        self.count(|s| *s == ChannelState::CheckpointHit)
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, ChannelState::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ChannelState::Failed(_)))
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Mutable state of a run, kept apart from the orchestrator's collaborators.
struct Progress {
    gps: f64,
    blocks: Vec<BlockEntry>,
    table: RecordTable,
    channels: Vec<ChannelStatus>,
}

impl Progress {
    fn snapshot(&self, complete: bool) -> ReportSnapshot<'_> {
        ReportSnapshot {
            gps: self.gps,
            blocks: &self.blocks,
            table: &self.table,
            channels: &self.channels,
            complete,
        }
    }

    fn set(&mut self, index: usize, state: ChannelState) {
        self.channels[index].state = state;
    }
}

// ---------------------------------------------------------------------------
// ScanOrchestrator
// ---------------------------------------------------------------------------

/// Drives a full scan over every block of a configuration.
pub struct ScanOrchestrator<T: TileTransform> {
    config: ScanConfig,
    options: ScanOptions,
    scanner: ChannelScanner<T>,
    data: Box<dyn DataSource>,
    flags: Box<dyn StateFlagSource>,
    report: Box<dyn ReportSink>,
    checkpoint_path: Option<PathBuf>,
    products: Option<ProductPool>,
}

impl<T: TileTransform> ScanOrchestrator<T> {
    pub fn new(
        config: ScanConfig,
        options: ScanOptions,
        transform: T,
        data: Box<dyn DataSource>,
        flags: Box<dyn StateFlagSource>,
        report: Box<dyn ReportSink>,
    ) -> Self {
        Self {
            scanner: ChannelScanner::new(transform, &options),
            config,
            options,
            data,
            flags,
            report,
            checkpoint_path: None,
            products: None,
        }
    }

    /// Persist records to (and, when enabled, resume from) `path`.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Hand the maps of recorded channels to `pool`.
    pub fn with_products(mut self, pool: ProductPool) -> Self {
        self.products = Some(pool);
        self
    }

    /// Run the scan to completion.
    pub fn run(mut self) -> Result<ScanSummary, ScanError> {
        let start = Instant::now();
        let gps = self.options.gps;

        let correlate = self.options.correlate && self.config.primary.is_some();
        if self.options.correlate && !correlate {
            warn!("No [primary] block configured; cross-correlation disabled");
        }

        let checkpoint = self.checkpoint_path.as_ref().map(|path| ScanCheckpoint::new(path, correlate));
        let (restored, completed) = match (&checkpoint, self.options.use_checkpoint) {
            (Some(cp), true) => cp.load()?,
            _ => (RecordTable::new(), Vec::new()),
        };
        let completed: HashSet<String> = completed.into_iter().collect();

        let (blocks, channels, members) = self.layout();
        let mut progress = Progress {
            gps,
            blocks,
            table: RecordTable::new(),
            channels,
        };
        info!(
            "Scanning {} channel(s) in {} block(s) around GPS {} ({} restored)",
            progress.channels.len(),
            self.config.blocks.len(),
            gps,
            completed.len()
        );

        let needs_scan = progress.channels.iter().any(|c| !completed.contains(&c.channel));
        let template = match self.config.primary.as_ref() {
            Some(primary) if correlate && needs_scan => Some(self.build_template(primary)?),
            _ => None,
        };

        let mut tally = ProductTally::default();
        let blocks = std::mem::take(&mut self.config.blocks);
        for (block, indices) in blocks.iter().zip(&members) {
            self.scan_block(
                block,
                indices,
                &restored,
                template.as_ref(),
                checkpoint.as_ref(),
                &mut progress,
                &mut tally,
            )?;
        }

        if let Some(pool) = self.products.take() {
            if pool.pending() > 0 {
                info!("Waiting for {} map(s) to be written", pool.pending());
            }
            for message in pool.finish() {
                tally.record(&message);
            }
        }
        self.report.finalize(&progress.snapshot(true))?;

        let summary = ScanSummary {
            table: progress.table,
            channels: progress.channels,
            products: tally,
        };
        info!(
            "Scan complete in {:.1} s: {} recorded, {} restored, {} skipped, {} failed, {} map(s) written",
            start.elapsed().as_secs_f64(),
            summary.recorded(),
            summary.restored(),
            summary.skipped(),
            summary.failed(),
            summary.products.written
        );
        Ok(summary)
    }

    /// Table of contents, initial channel states, and the status indices
    /// owned by each block.  Repeated channels within a block are dropped.
    fn layout(&self) -> (Vec<BlockEntry>, Vec<ChannelStatus>, Vec<Vec<usize>>) {
        let mut entries = Vec::with_capacity(self.config.blocks.len());
        let mut channels = Vec::with_capacity(self.config.channel_count());
        let mut members = Vec::with_capacity(self.config.blocks.len());

        for block in &self.config.blocks {
            let mut seen = HashSet::new();
            let mut indices = Vec::with_capacity(block.channels.len());
            for channel in &block.channels {
                if !seen.insert(channel.name.as_str()) {
                    warn!("Channel {} listed twice in block [{}]; scanning it once", channel.name, block.key);
                    continue;
                }
                indices.push(channels.len());
                channels.push(ChannelStatus {
                    channel: channel.name.clone(),
                    block: block.key.clone(),
                    state: ChannelState::Pending,
                });
            }
            entries.push(BlockEntry {
                key: block.key.clone(),
                title: block.title().to_string(),
                section: block.display_section().to_string(),
                channels: indices.iter().map(|&i| channels[i].channel.clone()).collect(),
            });
            members.push(indices);
        }
        (entries, channels, members)
    }

    fn fetch(&self, location: Option<&str>, names: &[String], span: Segment) -> Result<SeriesBundle, DataSourceError> {
        match location {
            Some(location) => ChannelFileSource::open(Path::new(location))?.get_samples(names, span.start, span.end),
            None => self.data.get_samples(names, span.start, span.end),
        }
    }

    fn build_template(&self, primary: &PrimaryBlock) -> Result<PrimaryTemplate, ScanError> {
        let gps = self.options.gps;
        debug!("Reading primary {} (frametype {:?})", primary.channel, primary.frametype);
        let bundle = self.fetch(primary.source.as_deref(), &[primary.channel.clone()], primary.data_span(gps))?;
        let raw = bundle
            .get(&primary.channel)
            .ok_or_else(|| ScanError::PrimaryUnavailable(primary.channel.clone()))?;
        let f_low = (primary.f_low > 0.0).then_some(primary.f_low);
        Ok(build_primary(gps, primary.length, raw, primary.fftlength, primary.resample, f_low)?)
    }

    /// Whether the block's state flag (if any) covers its data window.
    fn block_is_active(&self, block: &ChannelBlock) -> bool {
        let Some(flag) = block.state_flag.as_deref() else {
            return true;
        };
        if self.options.ignore_state_flags {
            return true;
        }
        let span = block.data_span(self.options.gps);
        match self.flags.query_active_segments(flag, span.start, span.end) {
            Ok(segments) => Segment::coalesce(segments).iter().any(|s| s.covers(&span)),
            Err(e) => {
                warn!("Cannot query state flag {} for block [{}]: {}", flag, block.key, e);
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_block(
        &mut self,
        block: &ChannelBlock,
        indices: &[usize],
        restored: &RecordTable,
        template: Option<&PrimaryTemplate>,
        checkpoint: Option<&ScanCheckpoint>,
        progress: &mut Progress,
        tally: &mut ProductTally,
    ) -> Result<(), ScanError> {
        // An inactive flag skips the whole block, checkpointed channels included.
        if !self.block_is_active(block) {
            let flag = block.state_flag.clone().unwrap_or_default();
            warn!("State flag {} inactive; skipping block [{}]", flag, block.key);
            for &i in indices {
                progress.set(i, ChannelState::Skipped(SkipReason::StateFlag { flag: flag.clone() }));
            }
            self.report.update(&progress.snapshot(false))?;
            return Ok(());
        }

        let mut pending = Vec::with_capacity(indices.len());
        for &i in indices {
            let name = progress.channels[i].channel.clone();
            match checkpoint.and_then(|cp| cp.restore(&name, restored)) {
                Some(record) => {
                    debug!("{}: restored from checkpoint", name);
                    progress.table.insert(record);
                    progress.set(i, ChannelState::CheckpointHit);
                    self.report.update(&progress.snapshot(false))?;
                }
                None => pending.push(i),
            }
        }
        if pending.is_empty() {
            return Ok(());
        }
        info!("Block [{}] {}: {} channel(s) to scan", block.key, block.title(), pending.len());

        let names: Vec<String> = pending.iter().map(|&i| progress.channels[i].channel.clone()).collect();
        debug!("Reading {} channel(s) (frametype {:?})", names.len(), block.frametype);
        let bundle = match self.fetch(block.source.as_deref(), &names, block.data_span(self.options.gps)) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!("Cannot read data for block [{}]: {}", block.key, e);
                for &i in &pending {
                    progress.set(i, ChannelState::Failed(e.to_string()));
                }
                self.report.update(&progress.snapshot(false))?;
                return Ok(());
            }
        };

        for &i in &pending {
            let name = progress.channels[i].channel.clone();
            let Some(raw) = bundle.get(&name) else {
                warn!("{}: no data available", name);
                progress.set(i, ChannelState::Skipped(SkipReason::Unavailable));
                self.report.update(&progress.snapshot(false))?;
                continue;
            };

            progress.set(i, ChannelState::Scanning);
            let state = match self.scanner.scan(&name, raw, block, self.options.gps, template) {
                Ok(ScanOutcome::Recorded(scan)) => {
                    let (record, products) = scan.into_products(block.snr_threshold);
                    progress.table.insert(record);
                    if let Some(pool) = self.products.as_mut() {
                        for product in products {
                            pool.submit(product);
                        }
                    }
                    if let Some(cp) = checkpoint {
                        cp.save(&progress.table)?;
                    }
                    ChannelState::Recorded
                }
                Ok(ScanOutcome::Insignificant { far }) => {
                    info!("{}: not significant (FAR {:.3e} Hz)", name, far);
                    ChannelState::Skipped(SkipReason::Insignificant { far })
                }
                Err(e) => {
                    warn!("{}: {}", name, e);
                    ChannelState::Failed(e.to_string())
                }
            };
            progress.set(i, state);
            self.report.update(&progress.snapshot(false))?;

            if let Some(pool) = self.products.as_mut() {
                for message in pool.poll() {
                    tally.record(&message);
                }
            }
        }
        Ok(())
    }
}
