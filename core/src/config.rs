//! Channel-block configuration.
//!
//! An Omega scan is configured by one or more INI files.  Every section is
//! a *block* of channels sharing scan parameters; the special section
//! `[primary]` instead names the channel used to build the matched filter.
//!
//! ```ini
//! [primary]
//! f-low = 4.0
//! resample = 4096
//! duration = 64
//! fftlength = 8
//! matched-filter-length = 2
//! channel = %(IFO)s:GDS-CALIB_STRAIN
//!
//! [GW]
//! name = Gravitational Wave Strain
//! q-range = 3.3166,150.0
//! frequency-range = 4.0,Inf
//! resample = 4096
//! state-flag = %(IFO)s:DMT-ANALYSIS_READY:1
//! duration = 64
//! fftlength = 8
//! always-plot = True
//! plot-time-durations = 1,4,16
//! channels = %(IFO)s:GDS-CALIB_STRAIN
//!     %(IFO)s:CAL-DELTAL_EXTERNAL_DQ
//! ```
//!
//! Parsing validates every block once; the rest of the crate relies on the
//! invariants documented on [`ChannelBlock`] and [`PrimaryBlock`].

use std::path::{Path, PathBuf};

use ini::Ini;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Section name of the matched-filter block.
pub const PRIMARY_SECTION: &str = "primary";

/// Configuration errors.  Always fatal, and raised before any scanning.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse configuration {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: ini::ParseError,
    },

    #[error("[{section}] missing required key '{key}'")]
    MissingKey { section: String, key: String },

    #[error("[{section}] {key} = '{value}': {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("configuration defines no channel blocks")]
    NoBlocks,
}

// ---------------------------------------------------------------------------
// Typed configuration
// ---------------------------------------------------------------------------

/// A channel to scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,

    /// Rate (Hz) the channel is analysed at, when its block resamples.
    pub sample_rate: Option<f64>,

    /// Display section: the owning block's `parent`, or its key.
    pub section: String,
}

/// A group of channels sharing scan parameters.
///
/// Invariants (checked at parse time): `0 < qlow < qhigh`,
/// `0 <= flow < fhigh` (`fhigh` may be infinite), `0 < fftlength <=
/// duration`, non-empty `plot_durations` and `channels`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelBlock {
    pub key: String,
    pub name: Option<String>,
    pub parent: Option<String>,
    pub q_range: (f64, f64),
    pub f_range: (f64, f64),
    pub duration: f64,
    pub fftlength: f64,
    pub resample: Option<f64>,
    pub frametype: Option<String>,
    pub source: Option<String>,
    pub state_flag: Option<String>,
    /// Full width (s) of the peak search window around the trigger.
    pub search: f64,
    pub max_mismatch: f64,
    /// Colour-scale ceiling for rendered maps.
    pub snr_threshold: f64,
    /// Maximum accepted delay (s) of the correlation peak.
    pub dt: f64,
    pub always_plot: bool,
    pub plot_durations: Vec<f64>,
    pub channels: Vec<Channel>,
}

impl ChannelBlock {
    pub const DEFAULT_SEARCH: f64 = 0.5;
    pub const DEFAULT_MAX_MISMATCH: f64 = 0.2;
    pub const DEFAULT_SNR_THRESHOLD: f64 = 5.5;
    pub const DEFAULT_DT: f64 = 0.1;

    /// A block with default optional settings and plot durations of 1, 4
    /// and 16 seconds.
    pub fn new(
        key: impl Into<String>,
        q_range: (f64, f64),
        f_range: (f64, f64),
        duration: f64,
        fftlength: f64,
        channels: &[&str],
    ) -> Self {
        let key = key.into();
        Self {
            channels: channels
                .iter()
                .map(|name| Channel {
                    name: name.to_string(),
                    sample_rate: None,
                    section: key.clone(),
                })
                .collect(),
            key,
            name: None,
            parent: None,
            q_range,
            f_range,
            duration,
            fftlength,
            resample: None,
            frametype: None,
            source: None,
            state_flag: None,
            search: Self::DEFAULT_SEARCH,
            max_mismatch: Self::DEFAULT_MAX_MISMATCH,
            snr_threshold: Self::DEFAULT_SNR_THRESHOLD,
            dt: Self::DEFAULT_DT,
            always_plot: false,
            plot_durations: vec![1.0, 4.0, 16.0],
        }
    }

    /// Key of the section this block is displayed under.
    pub fn display_section(&self) -> &str {
        self.parent.as_deref().unwrap_or(&self.key)
    }

    /// Human-readable title: `name` if set, else the key.
    pub fn title(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.key)
    }

    /// High-pass cutoff for conditioning; a non-positive `flow` disables it.
    pub fn f_low(&self) -> Option<f64> {
        (self.f_range.0 > 0.0).then_some(self.f_range.0)
    }

    /// Data window requested from the data source: the block duration
    /// centred on `gps`, padded by one second either side.
    pub fn data_span(&self, gps: f64) -> crate::types::Segment {
        crate::types::Segment::new(gps - self.duration / 2.0 - 1.0, gps + self.duration / 2.0 + 1.0)
    }

    /// Check the block invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let section = &self.key;
        let (qlow, qhigh) = self.q_range;
        if !(qlow > 0.0 && qlow < qhigh && qhigh.is_finite()) {
            return Err(invalid(section, "q-range", format!("{},{}", qlow, qhigh), "need 0 < qlow < qhigh"));
        }
        let (flow, fhigh) = self.f_range;
        if !(flow >= 0.0 && flow < fhigh) {
            return Err(invalid(
                section,
                "frequency-range",
                format!("{},{}", flow, fhigh),
                "need 0 <= flow < fhigh",
            ));
        }
        check_window(section, self.duration, self.fftlength)?;
        if let Some(rate) = self.resample {
            positive(section, "resample", rate)?;
        }
        positive(section, "search", self.search)?;
        positive(section, "snr-threshold", self.snr_threshold)?;
        if !(self.max_mismatch > 0.0 && self.max_mismatch < 1.0) {
            return Err(invalid(section, "max-mismatch", self.max_mismatch, "must lie in (0, 1)"));
        }
        if !(self.dt >= 0.0) {
            return Err(invalid(section, "dt", self.dt, "must be non-negative"));
        }
        if self.plot_durations.is_empty() {
            return Err(invalid(section, "plot-time-durations", "", "at least one duration is required"));
        }
        for &d in &self.plot_durations {
            positive(section, "plot-time-durations", d)?;
        }
        if self.channels.is_empty() {
            return Err(invalid(section, "channels", "", "at least one channel is required"));
        }
        Ok(())
    }
}

/// The `[primary]` block: source of the matched-filter template.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrimaryBlock {
    pub channel: String,
    /// High-pass cutoff in Hz.
    pub f_low: f64,
    /// Matched-filter length in seconds.
    pub length: f64,
    pub duration: f64,
    pub fftlength: f64,
    pub resample: Option<f64>,
    pub frametype: Option<String>,
    pub source: Option<String>,
}

impl PrimaryBlock {
    pub const DEFAULT_F_LOW: f64 = 4.0;

    pub fn new(channel: impl Into<String>, length: f64, duration: f64, fftlength: f64) -> Self {
        Self {
            channel: channel.into(),
            f_low: Self::DEFAULT_F_LOW,
            length,
            duration,
            fftlength,
            resample: None,
            frametype: None,
            source: None,
        }
    }

    pub fn data_span(&self, gps: f64) -> crate::types::Segment {
        crate::types::Segment::new(gps - self.duration / 2.0 - 1.0, gps + self.duration / 2.0 + 1.0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let section = PRIMARY_SECTION;
        check_window(section, self.duration, self.fftlength)?;
        positive(section, "matched-filter-length", self.length)?;
        if self.length > self.duration {
            return Err(invalid(
                section,
                "matched-filter-length",
                self.length,
                "must not exceed the block duration",
            ));
        }
        if !(self.f_low >= 0.0) {
            return Err(invalid(section, "f-low", self.f_low, "must be non-negative"));
        }
        if let Some(rate) = self.resample {
            positive(section, "resample", rate)?;
        }
        Ok(())
    }
}

/// A fully parsed and validated scan configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub primary: Option<PrimaryBlock>,
    /// Data blocks in order of first appearance.
    pub blocks: Vec<ChannelBlock>,
}

impl ScanConfig {
    /// Parse a single INI document.
    pub fn parse(text: &str, ifo: Option<&str>) -> Result<Self, ConfigError> {
        Self::parse_all(&[("<string>".to_string(), text.to_string())], ifo)
    }

    /// Read and merge `paths` in order; keys in later files override those
    /// of earlier ones.
    pub fn read<P: AsRef<Path>>(paths: &[P], ifo: Option<&str>) -> Result<Self, ConfigError> {
        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            documents.push((path.display().to_string(), text));
        }
        Self::parse_all(&documents, ifo)
    }

    fn parse_all(documents: &[(String, String)], ifo: Option<&str>) -> Result<Self, ConfigError> {
        let mut sections = RawSections::default();
        for (origin, text) in documents {
            let text = substitute_ifo(&fold_continuations(text), ifo);
            let ini = Ini::load_from_str(&text).map_err(|source| ConfigError::Parse {
                origin: origin.clone(),
                source,
            })?;
            for (name, props) in ini.iter() {
                let Some(name) = name else { continue };
                for (key, value) in props.iter() {
                    sections.set(name.trim(), &key.trim().to_lowercase(), value.trim());
                }
            }
            debug!("Loaded configuration from {}", origin);
        }

        let mut config = ScanConfig::default();
        for section in &sections.0 {
            if section.name == PRIMARY_SECTION {
                config.primary = Some(section.primary_block()?);
            } else {
                config.blocks.push(section.channel_block()?);
            }
        }
        if config.blocks.is_empty() {
            return Err(ConfigError::NoBlocks);
        }
        Ok(config)
    }

    pub fn block(&self, key: &str) -> Option<&ChannelBlock> {
        self.blocks.iter().find(|b| b.key == key)
    }

    /// Every channel of every block, in configuration order.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.blocks.iter().flat_map(|b| b.channels.iter())
    }

    pub fn channel_count(&self) -> usize {
        self.blocks.iter().map(|b| b.channels.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Raw sections
// ---------------------------------------------------------------------------

struct RawSection {
    name: String,
    entries: Vec<(String, String)>,
}

/// Ordered sections merged across files.
#[derive(Default)]
struct RawSections(Vec<RawSection>);

impl RawSections {
    fn set(&mut self, section: &str, key: &str, value: &str) {
        let idx = match self.0.iter().position(|s| s.name == section) {
            Some(idx) => idx,
            None => {
                self.0.push(RawSection {
                    name: section.to_string(),
                    entries: Vec::new(),
                });
                self.0.len() - 1
            }
        };
        let entries = &mut self.0[idx].entries;
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => entries.push((key.to_string(), value.to_string())),
        }
    }
}

impl RawSection {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingKey {
            section: self.name.clone(),
            key: key.to_string(),
        })
    }

    fn float(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        self.get(key).map(|v| parse_float(&self.name, key, v)).transpose()
    }

    fn require_float(&self, key: &str) -> Result<f64, ConfigError> {
        parse_float(&self.name, key, self.require(key)?)
    }

    fn string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    /// `resample = 0` means "do not resample".
    fn resample(&self) -> Result<Option<f64>, ConfigError> {
        Ok(self.float("resample")?.filter(|&r| r != 0.0))
    }

    fn channel_block(&self) -> Result<ChannelBlock, ConfigError> {
        let section = self.name.as_str();
        let parent = self.string("parent");
        let resample = self.resample()?;
        let display = parent.clone().unwrap_or_else(|| section.to_string());

        let mut names: Vec<&str> = Vec::new();
        for name in split_list(self.require("channels")?) {
            if names.contains(&name) {
                warn!("[{}] channel {} listed more than once", section, name);
            } else {
                names.push(name);
            }
        }

        let block = ChannelBlock {
            key: section.to_string(),
            name: self.string("name"),
            parent,
            q_range: parse_pair(section, "q-range", self.require("q-range")?)?,
            f_range: parse_pair(section, "frequency-range", self.require("frequency-range")?)?,
            duration: self.require_float("duration")?,
            fftlength: self.require_float("fftlength")?,
            resample,
            frametype: self.string("frametype"),
            source: self.string("source"),
            state_flag: self.string("state-flag"),
            search: self.float("search")?.unwrap_or(ChannelBlock::DEFAULT_SEARCH),
            max_mismatch: self.float("max-mismatch")?.unwrap_or(ChannelBlock::DEFAULT_MAX_MISMATCH),
            snr_threshold: self.float("snr-threshold")?.unwrap_or(ChannelBlock::DEFAULT_SNR_THRESHOLD),
            dt: self.float("dt")?.unwrap_or(ChannelBlock::DEFAULT_DT),
            always_plot: self
                .get("always-plot")
                .map(|v| parse_bool(section, "always-plot", v))
                .transpose()?
                .unwrap_or(false),
            plot_durations: split_list(self.require("plot-time-durations")?)
                .map(|v| parse_float(section, "plot-time-durations", v))
                .collect::<Result<_, _>>()?,
            channels: names
                .into_iter()
                .map(|name| Channel {
                    name: name.to_string(),
                    sample_rate: resample,
                    section: display.clone(),
                })
                .collect(),
        };
        block.validate()?;
        Ok(block)
    }

    fn primary_block(&self) -> Result<PrimaryBlock, ConfigError> {
        let channel_value = self.require("channel")?;
        let channels: Vec<&str> = split_list(channel_value).collect();
        if channels.len() != 1 {
            return Err(invalid(&self.name, "channel", channel_value, "exactly one channel is required"));
        }
        let block = PrimaryBlock {
            channel: channels[0].to_string(),
            f_low: self.float("f-low")?.unwrap_or(PrimaryBlock::DEFAULT_F_LOW),
            length: self.require_float("matched-filter-length")?,
            duration: self.require_float("duration")?,
            fftlength: self.require_float("fftlength")?,
            resample: self.resample()?,
            frametype: self.string("frametype"),
            source: self.string("source"),
        };
        block.validate()?;
        Ok(block)
    }
}

// ---------------------------------------------------------------------------
// Value parsing
// ---------------------------------------------------------------------------

fn invalid(section: &str, key: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn positive(section: &str, key: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(invalid(section, key, value, "must be positive and finite"))
    }
}

fn check_window(section: &str, duration: f64, fftlength: f64) -> Result<(), ConfigError> {
    positive(section, "duration", duration)?;
    positive(section, "fftlength", fftlength)?;
    if fftlength > duration {
        return Err(invalid(section, "fftlength", fftlength, "must not exceed duration"));
    }
    Ok(())
}

/// Parse a float; `inf` (any case) is accepted, `nan` is not.
fn parse_float(section: &str, key: &str, value: &str) -> Result<f64, ConfigError> {
    match value.trim().parse::<f64>() {
        Ok(v) if !v.is_nan() => Ok(v),
        _ => Err(invalid(section, key, value, "expected a number")),
    }
}

fn parse_pair(section: &str, key: &str, value: &str) -> Result<(f64, f64), ConfigError> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [a, b] => Ok((parse_float(section, key, a)?, parse_float(section, key, b)?)),
        _ => Err(invalid(section, key, value, "expected two comma-separated numbers")),
    }
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(invalid(section, key, value, "expected true/false, yes/no or 1/0")),
    }
}

/// Split a comma-, whitespace- or newline-separated list.
fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
}

/// Join indented continuation lines onto the preceding key line.
fn fold_continuations(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_value = false;
    for line in text.lines() {
        let trimmed = line.trim();
        let indented = line.starts_with(|c: char| c == ' ' || c == '\t');
        if indented && in_value && !trimmed.is_empty() && !trimmed.starts_with([';', '#']) {
            if let Some(last) = out.last_mut() {
                last.push(' ');
                last.push_str(trimmed);
                continue;
            }
        }
        in_value = !trimmed.is_empty()
            && !trimmed.starts_with([';', '#', '['])
            && (trimmed.contains('=') || trimmed.contains(':'));
        out.push(line.to_string());
    }
    out.join("\n")
}

fn substitute_ifo(text: &str, ifo: Option<&str>) -> String {
    match ifo {
        Some(ifo) => text
            .replace("%(IFO)s", &ifo.to_uppercase())
            .replace("%(ifo)s", &ifo.to_lowercase()),
        None => text.to_string(),
    }
}
