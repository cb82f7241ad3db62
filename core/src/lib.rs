//! # omegascan-core
//!
//! Omega scans of gravitational-wave detector data: given a GPS trigger
//! time, find which auxiliary channels saw a significant transient and how
//! closely each one follows the primary (strain) channel.
//!
//! ## Overview
//!
//! | Module           | Purpose                                                      |
//! |------------------|--------------------------------------------------------------|
//! | [`conditioning`] | Resampling, high-pass filtering and whitening                |
//! | [`qtransform`]   | Multi-resolution Q-transform tile search and map rendering   |
//! | [`primary`]      | Primary-channel matched filter and cross-correlation         |
//! | [`scanner`]      | Per-channel scan with the false-alarm significance gate      |
//! | [`orchestrator`] | Batch driver: blocks, state flags, checkpoint and report     |
//! | [`config`]       | INI channel-block configuration                              |
//! | [`checkpoint`]   | CSV checkpoint of loudest-tile records                       |
//! | [`datasource`]   | Data and state-flag collaborators (memory, channel files)    |
//! | [`products`]     | Worker pool writing time-frequency maps                      |
//! | [`report`]       | Report sinks (JSON summary)                                  |
//! | [`types`]        | Shared data structures (series, segments, records, options)  |
//!
//! ## Python usage
//!
//! Built with the `python` feature, the library exposes a module called
//! `omegascan_core`:
//!
//! ```python
//! import omegascan_core
//!
//! for record in omegascan_core.load_summary("scans/data/summary.csv", correlated=True):
//!     print(record.channel, record.snr, record.correlation)
//! ```

pub mod checkpoint;
pub mod conditioning;
pub mod config;
pub mod datasource;
pub mod fft;
pub mod filter;
pub mod orchestrator;
pub mod primary;
pub mod products;
pub mod qtransform;
pub mod report;
pub mod scanner;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export the most commonly used items at crate root for convenience.
pub use checkpoint::{RecordTable, ScanCheckpoint};
pub use config::{ChannelBlock, PrimaryBlock, ScanConfig};
pub use orchestrator::{ChannelState, ScanError, ScanOrchestrator, ScanSummary};
pub use qtransform::{QTransform, TileTransform};
pub use scanner::ChannelScanner;
pub use types::{LoudestTileRecord, ScanOptions, Segment, TimeSeries};
